//! Partition processing
//!
//! [`PulseProcessor`] is the synchronous core of one partition. It owns the
//! per-user source state and reorder buffers and feeds every released reading
//! to both the pattern matcher and the fusion aggregator.
//!
//! Stages per reading:
//! 1. Clock check - drop readings observed too far ahead of ingest time
//! 2. SourceRegistry - drop readings from disabled sources
//! 3. LatenessBuffer - reorder within the grace window, reject late readings
//! 4. PatternMatchingEngine - advance runs, emit alerts
//! 5. FusionAggregator - update the fused value for the reading's metric
//!
//! Source state outlives eviction: a user whose session is dropped for
//! capacity or idleness keeps any disabled sources until they are re-enabled.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::PulseConfig;
use crate::error::ComputeError;
use crate::fusion::FusionAggregator;
use crate::lateness::LatenessBuffer;
use crate::matcher::PatternMatchingEngine;
use crate::sources::SourceRegistry;
use crate::types::{Alert, FusedMetric, Metric, Reading, SourceControl, SourceId};

/// Everything produced by one processing step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub alerts: Vec<Alert>,
    pub fused: Vec<FusedMetric>,
}

impl ProcessOutput {
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.fused.is_empty()
    }

    pub fn extend(&mut self, other: ProcessOutput) {
        self.alerts.extend(other.alerts);
        self.fused.extend(other.fused);
    }
}

#[derive(Debug)]
struct UserSession {
    lateness: LatenessBuffer,
    /// Latest ingest time seen for this user
    last_active: DateTime<Utc>,
}

/// Stateful processor for one partition's users
#[derive(Debug)]
pub struct PulseProcessor {
    matcher: PatternMatchingEngine,
    fusion: FusionAggregator,
    sessions: HashMap<String, UserSession>,
    sources: HashMap<String, SourceRegistry>,
    grace: Duration,
    max_clock_skew: Duration,
    max_users: usize,
    idle_ttl: Duration,
    /// Users dropped to make room, not yet reported
    evicted: Vec<String>,
}

impl Default for PulseProcessor {
    fn default() -> Self {
        Self::new(&PulseConfig::default())
    }
}

impl PulseProcessor {
    pub fn new(config: &PulseConfig) -> Self {
        Self {
            matcher: PatternMatchingEngine::from_config(config),
            fusion: FusionAggregator::from_config(config),
            sessions: HashMap::new(),
            sources: HashMap::new(),
            grace: config.grace_window(),
            max_clock_skew: config.max_clock_skew(),
            max_users: config.max_users_per_partition.max(1),
            idle_ttl: config.idle_user_ttl(),
            evicted: Vec::new(),
        }
    }

    /// Admit one normalized reading, using its `received_at` as the ingest time
    ///
    /// Returns `ComputeError::LateReading` when the reading is older than the
    /// user's grace window allows and `ComputeError::FutureReading` when it
    /// is observed too far ahead of ingest time. Either way the reading is
    /// dropped without touching matcher or fusion state.
    pub fn ingest(&mut self, reading: Reading) -> Result<ProcessOutput, ComputeError> {
        let now = reading.received_at;
        self.ingest_at(reading, now)
    }

    /// Admit one reading with `now` as the ingest time
    pub fn ingest_at(
        &mut self,
        reading: Reading,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutput, ComputeError> {
        let ahead = reading.observed_at - now;
        if ahead > self.max_clock_skew {
            let err = ComputeError::FutureReading {
                user_id: reading.user_id,
                ahead_ms: ahead.num_milliseconds(),
            };
            warn!(error = %err, "dropping reading from the future");
            return Err(err);
        }
        if !self.is_source_enabled(&reading.user_id, &reading.source_id) {
            debug!(
                user_id = %reading.user_id,
                source_id = %reading.source_id,
                "dropping reading from disabled source"
            );
            return Ok(ProcessOutput::default());
        }

        self.ensure_session(&reading.user_id, now);
        let Some(session) = self.sessions.get_mut(&reading.user_id) else {
            return Ok(ProcessOutput::default());
        };
        if now > session.last_active {
            session.last_active = now;
        }
        self.sources
            .entry(reading.user_id.clone())
            .or_default()
            .observe(&reading.source_id);

        let released = session.lateness.push(reading).map_err(|e| {
            warn!(error = %e, "dropping late reading");
            e
        })?;
        Ok(self.process_released(released))
    }

    /// Apply a source enable/disable signal
    pub fn apply_control(&mut self, control: &SourceControl) -> ProcessOutput {
        if control.enabled {
            self.enable_source(&control.user_id, &control.source_id);
            ProcessOutput::default()
        } else {
            self.disable_source(&control.user_id, &control.source_id)
        }
    }

    /// Exclude a source from matching and fusion for one user
    ///
    /// Takes effect before any reading not yet handed to the engines: the
    /// source's buffered readings are dropped and its values leave the
    /// matcher context. Returns the fused snapshots whose attribution changed.
    pub fn disable_source(&mut self, user_id: &str, source_id: &SourceId) -> ProcessOutput {
        let changed = self
            .sources
            .entry(user_id.to_string())
            .or_default()
            .set_enabled(source_id, false);
        if !changed {
            debug!(user_id, source_id = %source_id, "source already disabled");
            return ProcessOutput::default();
        }

        let dropped = self
            .sessions
            .get_mut(user_id)
            .map(|s| s.lateness.discard_source(source_id))
            .unwrap_or(0);
        self.matcher.disable_source(user_id, source_id);
        let fused = self.fusion.disable_source(user_id, source_id);
        info!(user_id, source_id = %source_id, dropped, "source disabled");

        ProcessOutput {
            alerts: Vec::new(),
            fused,
        }
    }

    /// Re-admit a source's future readings; returns whether anything changed
    pub fn enable_source(&mut self, user_id: &str, source_id: &SourceId) -> bool {
        let changed = self
            .sources
            .entry(user_id.to_string())
            .or_default()
            .set_enabled(source_id, true);
        if changed {
            info!(user_id, source_id = %source_id, "source enabled");
        }
        self.prune_sources(user_id);
        changed
    }

    pub fn is_source_enabled(&self, user_id: &str, source_id: &SourceId) -> bool {
        self.sources
            .get(user_id)
            .map_or(true, |sources| sources.is_enabled(source_id))
    }

    /// Discard a user's runs, buffered readings and fused state without
    /// emitting alerts; disabled sources stay disabled
    pub fn end_session(&mut self, user_id: &str) -> bool {
        let had_session = self.sessions.remove(user_id).is_some();
        let had_runs = self.matcher.end_session(user_id);
        let had_fused = self.fusion.end_session(user_id);
        self.prune_sources(user_id);
        if had_session || had_runs || had_fused {
            info!(user_id, "session ended");
        }
        had_session || had_runs || had_fused
    }

    /// Release every buffered reading, users in id order
    pub fn flush(&mut self) -> ProcessOutput {
        let mut user_ids: Vec<String> = self.sessions.keys().cloned().collect();
        user_ids.sort();

        let mut output = ProcessOutput::default();
        for user_id in user_ids {
            output.extend(self.flush_user(&user_id));
        }
        output
    }

    /// Release one user's buffered readings
    pub fn flush_user(&mut self, user_id: &str) -> ProcessOutput {
        let released = match self.sessions.get_mut(user_id) {
            Some(session) => session.lateness.flush(),
            None => return ProcessOutput::default(),
        };
        self.process_released(released)
    }

    /// Drop users whose last ingest is older than the idle TTL; returns their ids
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = self.idle_ttl;
        let mut idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now - s.last_active > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();

        for user_id in &idle {
            self.discard(user_id);
        }
        if !idle.is_empty() {
            info!(count = idle.len(), "evicted idle users");
        }
        idle
    }

    /// Users evicted for capacity since the last call
    pub fn take_evicted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.evicted)
    }

    pub fn fused(&self, user_id: &str, metric: Metric) -> Option<FusedMetric> {
        self.fusion.get(user_id, metric)
    }

    pub fn snapshot(&self, user_id: &str) -> Vec<FusedMetric> {
        self.fusion.snapshot(user_id)
    }

    pub fn matcher(&self) -> &PatternMatchingEngine {
        &self.matcher
    }

    pub fn user_count(&self) -> usize {
        self.sessions.len()
    }

    /// Readings held back across all users
    pub fn buffered(&self) -> usize {
        self.sessions.values().map(|s| s.lateness.len()).sum()
    }

    fn ensure_session(&mut self, user_id: &str, now: DateTime<Utc>) {
        if self.sessions.contains_key(user_id) {
            return;
        }
        if self.sessions.len() >= self.max_users {
            let lru = self
                .sessions
                .iter()
                .min_by(|a, b| a.1.last_active.cmp(&b.1.last_active).then(a.0.cmp(b.0)))
                .map(|(id, _)| id.clone());
            if let Some(lru) = lru {
                warn!(user_id = %lru, max_users = self.max_users, "partition full, evicting least recently active user");
                self.discard(&lru);
                self.evicted.push(lru);
            }
        }
        self.sessions.insert(
            user_id.to_string(),
            UserSession {
                lateness: LatenessBuffer::new(self.grace),
                last_active: now,
            },
        );
    }

    fn discard(&mut self, user_id: &str) {
        self.sessions.remove(user_id);
        self.matcher.end_session(user_id);
        self.fusion.end_session(user_id);
        self.prune_sources(user_id);
    }

    /// Forget source state for a user with no session and nothing disabled
    fn prune_sources(&mut self, user_id: &str) {
        if self.sessions.contains_key(user_id) {
            return;
        }
        if self
            .sources
            .get(user_id)
            .is_some_and(|sources| !sources.has_disabled())
        {
            self.sources.remove(user_id);
        }
    }

    fn process_released(&mut self, released: Vec<Reading>) -> ProcessOutput {
        let mut output = ProcessOutput::default();
        for reading in released {
            let Some(sources) = self.sources.get(&reading.user_id) else {
                continue;
            };
            if !sources.is_enabled(&reading.source_id) {
                debug!(
                    user_id = %reading.user_id,
                    source_id = %reading.source_id,
                    "discarding buffered reading from disabled source"
                );
                continue;
            }

            output.alerts.extend(self.matcher.process(&reading));
            if let Some(fused) = self.fusion.update(&reading, sources) {
                output.fused.push(fused);
            }
        }
        output
    }
}
