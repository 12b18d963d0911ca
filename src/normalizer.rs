//! Event normalization
//!
//! This module turns inbound JSON into validated [`Reading`]s.
//! - Single readings are checked for a user id, a finite value and a
//!   physiologically plausible range
//! - Flat multi-metric events are exploded into one reading per metric
//! - Ingest time is stamped when the producer did not supply one

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ComputeError;
use crate::types::{Metric, Reading, SourceControl, SourceId};

/// A single reading as produced upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReading {
    pub user_id: String,
    pub source_id: SourceId,
    pub metric: Metric,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

/// Multi-metric record with one field per vital
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlatBiometricEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub timestamp: String,
    pub user_id: String,
    /// Explicit source; takes precedence over `device_sources`
    #[serde(default)]
    pub source_id: Option<SourceId>,
    #[serde(default)]
    pub device_sources: Vec<String>,
    pub heart_rate: Option<f64>,
    pub hrv_ms: Option<f64>,
    pub spo2_percent: Option<f64>,
    pub skin_temp_c: Option<f64>,
    pub respiratory_rate: Option<f64>,
    pub activity_level: Option<f64>,
    pub steps_per_minute: Option<f64>,
}

impl FlatBiometricEvent {
    fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::HeartRate => self.heart_rate,
            Metric::Hrv => self.hrv_ms,
            Metric::Spo2 => self.spo2_percent,
            Metric::SkinTemp => self.skin_temp_c,
            Metric::RespiratoryRate => self.respiratory_rate,
            Metric::ActivityLevel => self.activity_level,
            Metric::StepsPerMinute => self.steps_per_minute,
        }
    }

    fn source(&self) -> Result<SourceId, ComputeError> {
        if let Some(source_id) = &self.source_id {
            return Ok(source_id.clone());
        }
        self.device_sources
            .first()
            .map(|device| source_from_device(device))
            .ok_or_else(|| ComputeError::MissingField("device_sources".to_string()))
    }
}

/// Stop a user's session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSession {
    pub user_id: String,
    pub end_session: bool,
}

/// Any line of the inbound stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Reading(InboundReading),
    Control(SourceControl),
    Flat(FlatBiometricEvent),
    EndSession(EndSession),
}

/// Map a device name to the platform that reports it
pub fn source_from_device(device: &str) -> SourceId {
    match device {
        "apple_watch" | "apple" => SourceId::Apple,
        "fitbit" | "google" | "google_fit" => SourceId::Google,
        "oura_ring" | "oura" => SourceId::Oura,
        other => SourceId::Other(other.to_string()),
    }
}

/// Parse an RFC 3339 timestamp, treating zone-less values as UTC
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ComputeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ComputeError::ParseError(format!("invalid timestamp {raw}: {e}")))
}

/// Stateless reading validator
pub struct Normalizer;

impl Normalizer {
    /// Validate an inbound reading; `now` becomes `received_at` when absent
    pub fn normalize(input: &InboundReading, now: DateTime<Utc>) -> Result<Reading, ComputeError> {
        let user_id = input.user_id.trim();
        if user_id.is_empty() {
            return Err(ComputeError::MissingField("user_id".to_string()));
        }
        if let SourceId::Other(name) = &input.source_id {
            if name.trim().is_empty() {
                return Err(ComputeError::MissingField("source_id".to_string()));
            }
        }
        check_value(input.metric, input.value)?;

        Ok(Reading {
            user_id: user_id.to_string(),
            source_id: input.source_id.clone(),
            metric: input.metric,
            value: input.value,
            observed_at: input.observed_at,
            received_at: input.received_at.unwrap_or(now),
        })
    }

    /// Explode a flat event into readings, context metrics first
    ///
    /// Implausible fields are skipped with a warning; the rest of the event
    /// is still used.
    pub fn explode(event: &FlatBiometricEvent, now: DateTime<Utc>) -> Result<Vec<Reading>, ComputeError> {
        let user_id = event.user_id.trim();
        if user_id.is_empty() {
            return Err(ComputeError::MissingField("user_id".to_string()));
        }
        let observed_at = parse_timestamp(&event.timestamp)?;
        let source_id = event.source()?;

        let mut readings = Vec::new();
        for metric in Metric::ALL {
            let Some(value) = event.value(metric) else {
                continue;
            };
            if let Err(e) = check_value(metric, value) {
                warn!(
                    user_id,
                    event_id = event.event_id.as_deref().unwrap_or(""),
                    error = %e,
                    "skipping field"
                );
                continue;
            }
            readings.push(Reading {
                user_id: user_id.to_string(),
                source_id: source_id.clone(),
                metric,
                value,
                observed_at,
                received_at: now,
            });
        }
        Ok(readings)
    }
}

fn check_value(metric: Metric, value: f64) -> Result<(), ComputeError> {
    if !value.is_finite() {
        return Err(ComputeError::InvalidReading(format!(
            "{metric} value is not finite"
        )));
    }
    let (low, high) = metric.plausible_range();
    if value < low || value > high {
        return Err(ComputeError::InvalidReading(format!(
            "{metric} value {value} outside plausible range {low}..={high}"
        )));
    }
    Ok(())
}
