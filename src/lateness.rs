//! Bounded-lateness reordering
//!
//! Readings for one user may arrive slightly out of order when several
//! sources report concurrently. The buffer holds each reading until the
//! user's watermark (latest observed time minus the grace window) passes it,
//! then releases readings in `(observed_at, arrival)` order. Anything older
//! than what has already been released is late and rejected.

use chrono::{DateTime, Duration, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::error::ComputeError;
use crate::types::{Reading, SourceId};

#[derive(Debug)]
struct Pending {
    observed_at: DateTime<Utc>,
    seq: u64,
    reading: Reading,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.observed_at == other.observed_at && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.observed_at
            .cmp(&other.observed_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Per-user reorder buffer with an explicit grace window
#[derive(Debug)]
pub struct LatenessBuffer {
    grace: Duration,
    pending: BinaryHeap<Reverse<Pending>>,
    max_seen: Option<DateTime<Utc>>,
    last_released: Option<DateTime<Utc>>,
    seq: u64,
}

impl LatenessBuffer {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: BinaryHeap::new(),
            max_seen: None,
            last_released: None,
            seq: 0,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Latest observed time minus the grace window
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.max_seen.map(|t| t - self.grace)
    }

    /// Earliest `observed_at` still accepted
    fn floor(&self) -> Option<DateTime<Utc>> {
        match (self.watermark(), self.last_released) {
            (Some(w), Some(r)) => Some(w.max(r)),
            (w, r) => w.or(r),
        }
    }

    /// Accept a reading and return whatever the advanced watermark releases
    pub fn push(&mut self, reading: Reading) -> Result<Vec<Reading>, ComputeError> {
        if let Some(floor) = self.floor() {
            if reading.observed_at < floor {
                return Err(ComputeError::LateReading {
                    user_id: reading.user_id,
                    lateness_ms: (floor - reading.observed_at).num_milliseconds(),
                });
            }
        }

        self.max_seen = Some(match self.max_seen {
            Some(t) => t.max(reading.observed_at),
            None => reading.observed_at,
        });

        self.seq += 1;
        self.pending.push(Reverse(Pending {
            observed_at: reading.observed_at,
            seq: self.seq,
            reading,
        }));

        Ok(self.release_until(self.watermark()))
    }

    /// Release everything buffered regardless of the watermark
    pub fn flush(&mut self) -> Vec<Reading> {
        self.release_until(None)
    }

    fn release_until(&mut self, limit: Option<DateTime<Utc>>) -> Vec<Reading> {
        let mut released = Vec::new();
        while let Some(Reverse(next)) = self.pending.peek() {
            if let Some(limit) = limit {
                if next.observed_at > limit {
                    break;
                }
            }
            if let Some(Reverse(next)) = self.pending.pop() {
                self.last_released = Some(next.observed_at);
                released.push(next.reading);
            }
        }
        released
    }

    /// Drop held readings from `source_id`; returns how many were dropped
    pub fn discard_source(&mut self, source_id: &SourceId) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|Reverse(p)| &p.reading.source_id != source_id);
        before - self.pending.len()
    }

    /// Number of readings held back
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
