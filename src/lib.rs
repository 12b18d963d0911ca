//! Synheart Pulse - Streaming biometric anomaly detection and multi-source fusion
//!
//! Pulse consumes per-user biometric readings from several wearable sources and
//! produces two outputs through a deterministic per-partition pipeline:
//! source gating → bounded-lateness reordering → pattern matching → fusion.
//!
//! ## Modules
//!
//! - **Pattern matching**: sustained-anomaly runs (tachycardia at rest, low SpO2,
//!   elevated temperature, low HRV) emitted as severity-classified alerts
//! - **Fusion**: one authoritative value per (user, metric) with source attribution
//! - **Runtime**: hash-partitioned tokio workers publishing to a fan-out bus

pub mod bus;
pub mod config;
pub mod error;
pub mod fusion;
pub mod lateness;
pub mod matcher;
pub mod normalizer;
pub mod patterns;
pub mod pipeline;
pub mod runtime;
pub mod severity;
pub mod sources;
pub mod types;

pub use bus::{AlertLog, AlertQuery, FusedView, Publication, PublicationBus, Subscriber};
pub use config::{OverflowPolicy, PulseConfig};
pub use error::ComputeError;
pub use fusion::FusionAggregator;
pub use matcher::{MatchState, PatternMatchingEngine};
pub use normalizer::{FlatBiometricEvent, InboundMessage, InboundReading, Normalizer};
pub use patterns::{default_patterns, PatternDefinition};
pub use pipeline::{ProcessOutput, PulseProcessor};
pub use runtime::{partition_for, PulseRuntime};
pub use types::{Alert, FusedMetric, Metric, Reading, Severity, SourceControl, SourceId};

/// Pulse version reported by the CLI
pub const PULSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name attached to emitted records
pub const PRODUCER_NAME: &str = "synheart-pulse";
