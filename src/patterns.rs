//! Pattern definitions
//!
//! A pattern is static configuration: a conjunction of per-metric threshold
//! conditions, a primary metric whose readings form the run, run length and
//! span limits, and a severity rule over the run's average value.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;
use crate::types::{Metric, Severity};

/// Threshold comparison used by conditions and severity tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    AtLeast,
    Below,
    AtMost,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::AtLeast => value >= threshold,
            Comparison::Below => value < threshold,
            Comparison::AtMost => value <= threshold,
        }
    }
}

/// Single threshold condition on one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: Metric,
    pub comparison: Comparison,
    pub threshold: f64,
}

impl Condition {
    pub fn new(metric: Metric, comparison: Comparison, threshold: f64) -> Self {
        Self {
            metric,
            comparison,
            threshold,
        }
    }

    pub fn holds(&self, value: f64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

/// One severity tier: assigned when the average passes `threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityTier {
    pub threshold: f64,
    pub severity: Severity,
}

/// Maps a run's average value to a severity tier
///
/// Tiers are checked in order with `comparison`; the first that holds wins,
/// otherwise `floor` applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityRule {
    pub comparison: Comparison,
    pub tiers: Vec<SeverityTier>,
    pub floor: Severity,
}

impl SeverityRule {
    /// Rule for patterns where higher averages are worse
    pub fn above(tiers: &[(f64, Severity)], floor: Severity) -> Self {
        Self::with_comparison(Comparison::Above, tiers, floor)
    }

    /// Rule for patterns where lower averages are worse
    pub fn below(tiers: &[(f64, Severity)], floor: Severity) -> Self {
        Self::with_comparison(Comparison::Below, tiers, floor)
    }

    fn with_comparison(comparison: Comparison, tiers: &[(f64, Severity)], floor: Severity) -> Self {
        Self {
            comparison,
            tiers: tiers
                .iter()
                .map(|&(threshold, severity)| SeverityTier {
                    threshold,
                    severity,
                })
                .collect(),
            floor,
        }
    }
}

/// Static configuration for one detectable condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    /// Stable identifier, e.g. `TACHYCARDIA_AT_REST`
    pub id: String,
    /// Metric whose readings advance the run and are averaged
    pub primary_metric: Metric,
    /// All conditions must hold (conjunction)
    pub predicate: Vec<Condition>,
    /// Consecutive matching readings required before a run can alert
    pub min_run_length: u32,
    /// Longest allowed span between first and last matched reading
    pub max_match_span_ms: i64,
    pub severity_rule: SeverityRule,
    /// Description template; `{avg}` and `{count}` are substituted
    pub description: String,
    /// Decimal places used when rendering `{avg}`
    #[serde(default)]
    pub avg_decimals: usize,
}

impl PatternDefinition {
    pub fn max_match_span(&self) -> Duration {
        Duration::milliseconds(self.max_match_span_ms)
    }

    /// Render the alert description for a closed run
    pub fn describe(&self, avg_value: f64, sample_count: u32) -> String {
        let avg = format!("{:.*}", self.avg_decimals, avg_value);
        self.description
            .replace("{avg}", &avg)
            .replace("{count}", &sample_count.to_string())
    }

    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.id.trim().is_empty() {
            return Err(ComputeError::InvalidConfig(
                "pattern id must not be empty".to_string(),
            ));
        }
        if self.min_run_length == 0 {
            return Err(ComputeError::InvalidConfig(format!(
                "pattern {}: min_run_length must be at least 1",
                self.id
            )));
        }
        if self.max_match_span_ms <= 0 {
            return Err(ComputeError::InvalidConfig(format!(
                "pattern {}: max_match_span_ms must be positive",
                self.id
            )));
        }
        if !self
            .predicate
            .iter()
            .any(|c| c.metric == self.primary_metric)
        {
            return Err(ComputeError::InvalidConfig(format!(
                "pattern {}: predicate has no condition on primary metric {}",
                self.id, self.primary_metric
            )));
        }
        Ok(())
    }

    /// Sustained elevated heart rate while sedentary
    pub fn tachycardia_at_rest() -> Self {
        Self {
            id: "TACHYCARDIA_AT_REST".to_string(),
            primary_metric: Metric::HeartRate,
            predicate: vec![
                Condition::new(Metric::HeartRate, Comparison::Above, 100.0),
                Condition::new(Metric::ActivityLevel, Comparison::Below, 10.0),
            ],
            min_run_length: 5,
            max_match_span_ms: 60_000,
            severity_rule: SeverityRule::above(
                &[(130.0, Severity::Critical), (115.0, Severity::High)],
                Severity::Medium,
            ),
            description: "Sustained elevated HR ({avg} bpm avg) detected while at rest for {count} consecutive readings".to_string(),
            avg_decimals: 0,
        }
    }

    /// Low blood oxygen saturation
    pub fn low_spo2_hypoxia() -> Self {
        Self {
            id: "LOW_SPO2_HYPOXIA".to_string(),
            primary_metric: Metric::Spo2,
            predicate: vec![Condition::new(Metric::Spo2, Comparison::Below, 94.0)],
            min_run_length: 3,
            max_match_span_ms: 60_000,
            severity_rule: SeverityRule::below(
                &[(90.0, Severity::Critical), (92.0, Severity::High)],
                Severity::Medium,
            ),
            description: "Low blood oxygen ({avg}% avg SpO2) detected for {count} consecutive readings".to_string(),
            avg_decimals: 0,
        }
    }

    /// Skin temperature consistent with fever onset
    pub fn elevated_temperature() -> Self {
        Self {
            id: "ELEVATED_TEMPERATURE".to_string(),
            primary_metric: Metric::SkinTemp,
            predicate: vec![Condition::new(Metric::SkinTemp, Comparison::Above, 37.5)],
            min_run_length: 3,
            max_match_span_ms: 60_000,
            severity_rule: SeverityRule::above(
                &[(38.5, Severity::Critical), (38.0, Severity::High)],
                Severity::Medium,
            ),
            description: "Elevated body temperature ({avg}°C avg) detected for {count} consecutive readings".to_string(),
            avg_decimals: 1,
        }
    }

    /// Depressed HRV associated with acute stress
    pub fn low_hrv_stress() -> Self {
        Self {
            id: "LOW_HRV_STRESS".to_string(),
            primary_metric: Metric::Hrv,
            predicate: vec![Condition::new(Metric::Hrv, Comparison::Below, 25.0)],
            min_run_length: 5,
            max_match_span_ms: 120_000,
            severity_rule: SeverityRule::below(
                &[(15.0, Severity::High), (20.0, Severity::Medium)],
                Severity::Low,
            ),
            description: "Suppressed HRV ({avg} ms avg) detected for {count} consecutive readings".to_string(),
            avg_decimals: 0,
        }
    }
}

/// Built-in pattern set
pub fn default_patterns() -> Vec<PatternDefinition> {
    vec![
        PatternDefinition::tachycardia_at_rest(),
        PatternDefinition::low_spo2_hypoxia(),
        PatternDefinition::elevated_temperature(),
        PatternDefinition::low_hrv_stress(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patterns_are_valid() {
        for pattern in default_patterns() {
            assert!(pattern.validate().is_ok(), "{} failed validation", pattern.id);
        }
    }

    #[test]
    fn test_describe() {
        let tachy = PatternDefinition::tachycardia_at_rest();
        assert_eq!(
            tachy.describe(115.0, 5),
            "Sustained elevated HR (115 bpm avg) detected while at rest for 5 consecutive readings"
        );

        let fever = PatternDefinition::elevated_temperature();
        assert!(fever.describe(38.24, 3).contains("38.2°C avg"));
    }

    #[test]
    fn test_validate_rejects_missing_primary_condition() {
        let mut pattern = PatternDefinition::low_spo2_hypoxia();
        pattern.primary_metric = Metric::HeartRate;
        assert!(pattern.validate().is_err());

        let mut pattern = PatternDefinition::low_spo2_hypoxia();
        pattern.min_run_length = 0;
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn test_pattern_json_roundtrip() {
        let json = serde_json::to_string(&PatternDefinition::tachycardia_at_rest()).unwrap();
        let parsed: PatternDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, PatternDefinition::tachycardia_at_rest());
    }
}
