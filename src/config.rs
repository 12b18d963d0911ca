//! Engine configuration
//!
//! All thresholds, windows and capacities are configuration inputs. The
//! configuration serializes to JSON so it can be persisted and reloaded the
//! same way processor state is.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::patterns::{default_patterns, PatternDefinition};
use crate::types::SourceId;

/// Default maximum lateness tolerated before a reading is dropped
pub const DEFAULT_GRACE_WINDOW_MS: i64 = 5_000;

/// Default age after which a context metric no longer satisfies a predicate
pub const DEFAULT_CONTEXT_MAX_AGE_MS: i64 = 30_000;

/// Default tolerance for source clocks running ahead of ingest time
pub const DEFAULT_MAX_CLOCK_SKEW_MS: i64 = 300_000;

/// Policy applied when a subscriber's queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room for the new one
    DropOldest,
    /// Discard the new item and keep the queue as is
    DropNewest,
}

/// Complete configuration for processors and the partitioned runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Bounded lateness per user partition
    pub grace_window_ms: i64,
    /// Maximum age of a context metric used by a predicate
    pub context_max_age_ms: i64,
    /// Readings observed further than this ahead of ingest time are rejected
    pub max_clock_skew_ms: i64,
    /// Fusion tie-break order, highest priority first
    pub source_priority: Vec<SourceId>,
    /// Patterns evaluated for every user
    pub patterns: Vec<PatternDefinition>,
    /// Number of partition workers
    pub partitions: usize,
    /// Inbound queue capacity per partition worker
    pub partition_queue_capacity: usize,
    /// Queue capacity per bus subscriber
    pub subscriber_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Maximum user states held by one partition
    pub max_users_per_partition: usize,
    /// Users with no reading for this long are evicted
    pub idle_user_ttl_ms: i64,
    /// How often partitions sweep for idle users
    pub eviction_interval_ms: u64,
    /// Alerts retained by the in-memory alert log
    pub alert_log_capacity: usize,
    /// Staleness beyond which a fused metric is reported stale
    pub stale_after_ms: i64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: DEFAULT_GRACE_WINDOW_MS,
            context_max_age_ms: DEFAULT_CONTEXT_MAX_AGE_MS,
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            source_priority: vec![SourceId::Apple, SourceId::Google, SourceId::Oura],
            patterns: default_patterns(),
            partitions: 4,
            partition_queue_capacity: 1024,
            subscriber_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            max_users_per_partition: 4096,
            idle_user_ttl_ms: 15 * 60 * 1000,
            eviction_interval_ms: 30_000,
            alert_log_capacity: 10_000,
            stale_after_ms: 10_000,
        }
    }
}

impl PulseConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::milliseconds(self.grace_window_ms)
    }

    pub fn context_max_age(&self) -> Duration {
        Duration::milliseconds(self.context_max_age_ms)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::milliseconds(self.max_clock_skew_ms)
    }

    pub fn idle_user_ttl(&self) -> Duration {
        Duration::milliseconds(self.idle_user_ttl_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::milliseconds(self.stale_after_ms)
    }

    /// Check ranges and pattern definitions
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.grace_window_ms < 0 {
            return Err(ComputeError::InvalidConfig(
                "grace_window_ms must not be negative".to_string(),
            ));
        }
        if self.context_max_age_ms <= 0 {
            return Err(ComputeError::InvalidConfig(
                "context_max_age_ms must be positive".to_string(),
            ));
        }
        if self.max_clock_skew_ms < 0 {
            return Err(ComputeError::InvalidConfig(
                "max_clock_skew_ms must not be negative".to_string(),
            ));
        }
        if self.partitions == 0 {
            return Err(ComputeError::InvalidConfig(
                "partitions must be at least 1".to_string(),
            ));
        }
        if self.partition_queue_capacity == 0 || self.subscriber_queue_capacity == 0 {
            return Err(ComputeError::InvalidConfig(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        if self.max_users_per_partition == 0 {
            return Err(ComputeError::InvalidConfig(
                "max_users_per_partition must be at least 1".to_string(),
            ));
        }
        if self.idle_user_ttl_ms <= 0 || self.eviction_interval_ms == 0 {
            return Err(ComputeError::InvalidConfig(
                "idle_user_ttl_ms and eviction_interval_ms must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for pattern in &self.patterns {
            pattern.validate()?;
            if !seen.insert(pattern.id.as_str()) {
                return Err(ComputeError::InvalidConfig(format!(
                    "duplicate pattern id {}",
                    pattern.id
                )));
            }
        }
        Ok(())
    }

    /// Load and validate configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
