//! Core types for the Synheart Pulse stream
//!
//! This module defines the records that flow through the core: normalized
//! readings in, alerts and fused metric snapshots out, plus the source control
//! signal that gates which readings are admitted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ComputeError;

/// Biometric metric carried by a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeartRate,
    #[serde(alias = "hrv_ms")]
    Hrv,
    #[serde(alias = "spo2_percent")]
    Spo2,
    #[serde(alias = "skin_temp_c")]
    SkinTemp,
    ActivityLevel,
    RespiratoryRate,
    StepsPerMinute,
}

impl Metric {
    /// Every metric, context-style metrics (movement) first.
    ///
    /// Multi-metric records are exploded in this order so a pattern keyed on a
    /// vital sign sees the movement context that was sampled with it.
    pub const ALL: [Metric; 7] = [
        Metric::ActivityLevel,
        Metric::StepsPerMinute,
        Metric::RespiratoryRate,
        Metric::SkinTemp,
        Metric::Hrv,
        Metric::Spo2,
        Metric::HeartRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HeartRate => "heart_rate",
            Metric::Hrv => "hrv",
            Metric::Spo2 => "spo2",
            Metric::SkinTemp => "skin_temp",
            Metric::ActivityLevel => "activity_level",
            Metric::RespiratoryRate => "respiratory_rate",
            Metric::StepsPerMinute => "steps_per_minute",
        }
    }

    /// Physiologically plausible value range (inclusive)
    ///
    /// Values outside this range are sensor faults, not anomalies.
    pub fn plausible_range(&self) -> (f64, f64) {
        match self {
            Metric::HeartRate => (20.0, 250.0),
            Metric::Hrv => (1.0, 300.0),
            Metric::Spo2 => (50.0, 100.0),
            Metric::SkinTemp => (25.0, 45.0),
            Metric::ActivityLevel => (0.0, 100.0),
            Metric::RespiratoryRate => (2.0, 60.0),
            Metric::StepsPerMinute => (0.0, 300.0),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heart_rate" => Ok(Metric::HeartRate),
            "hrv" | "hrv_ms" => Ok(Metric::Hrv),
            "spo2" | "spo2_percent" => Ok(Metric::Spo2),
            "skin_temp" | "skin_temp_c" => Ok(Metric::SkinTemp),
            "activity_level" => Ok(Metric::ActivityLevel),
            "respiratory_rate" => Ok(Metric::RespiratoryRate),
            "steps_per_minute" => Ok(Metric::StepsPerMinute),
            other => Err(ComputeError::UnknownMetric(other.to_string())),
        }
    }
}

/// Measurement source identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Apple HealthKit (watch)
    Apple,
    /// Google Fit (usually synced from a phone or Fitbit)
    Google,
    /// Oura ring
    Oura,
    /// Sources outside the known set are accepted as-is
    #[serde(untagged)]
    Other(String),
}

impl SourceId {
    pub fn as_str(&self) -> &str {
        match self {
            SourceId::Apple => "apple",
            SourceId::Google => "google",
            SourceId::Oura => "oura",
            SourceId::Other(name) => name.as_str(),
        }
    }

    /// Parse a source id, mapping unknown names to `Other`
    pub fn parse(s: &str) -> Self {
        match s {
            "apple" => SourceId::Apple,
            "google" => SourceId::Google,
            "oura" => SourceId::Oura,
            other => SourceId::Other(other.to_string()),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized observation from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub user_id: String,
    pub source_id: SourceId,
    pub metric: Metric,
    pub value: f64,
    /// Event time reported by the source
    pub observed_at: DateTime<Utc>,
    /// Ingest time stamped by the normalizer
    pub received_at: DateTime<Utc>,
}

impl Reading {
    /// Build a reading received now
    pub fn new(
        user_id: impl Into<String>,
        source_id: SourceId,
        metric: Metric,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            source_id,
            metric,
            value,
            observed_at,
            received_at: Utc::now(),
        }
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Alert severity tier, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected sustained anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub pattern_id: String,
    pub user_id: String,
    pub severity: Severity,
    /// `observed_at` of the first matched reading
    pub start_time: DateTime<Utc>,
    /// `observed_at` of the last matched reading
    pub end_time: DateTime<Utc>,
    pub sample_count: u32,
    pub avg_value: f64,
    pub description: String,
}

impl Alert {
    /// Whether two alerts' `[start_time, end_time]` ranges intersect
    pub fn overlaps(&self, other: &Alert) -> bool {
        self.start_time <= other.end_time && other.start_time <= self.end_time
    }
}

/// Latest reading seen from one source for a fused metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContribution {
    pub source_id: SourceId,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// One authoritative value per (user, metric) with attribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedMetric {
    pub user_id: String,
    pub metric: Metric,
    pub value: f64,
    /// Source whose reading currently supplies `value`
    pub winning_source: SourceId,
    /// Latest reading per enabled source, in source priority order
    pub contributing_sources: Vec<SourceContribution>,
    pub updated_at: DateTime<Utc>,
}

impl FusedMetric {
    /// Elapsed time since the fused value was last updated, against the caller's clock
    pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
        now - self.updated_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.staleness(now) > stale_after
    }

    pub fn contribution(&self, source_id: &SourceId) -> Option<&SourceContribution> {
        self.contributing_sources
            .iter()
            .find(|c| &c.source_id == source_id)
    }
}

/// Enable/disable signal for one user's source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceControl {
    pub user_id: String,
    pub source_id: SourceId,
    pub enabled: bool,
}
