//! Alert severity classification
//!
//! Pure mapping from a closed run's average value to a severity tier, using
//! the thresholds declared on the pattern.

use crate::patterns::PatternDefinition;
use crate::types::Severity;

/// Classify the average matched value of a run for `pattern`
pub fn classify(avg_value: f64, pattern: &PatternDefinition) -> Severity {
    let rule = &pattern.severity_rule;
    rule.tiers
        .iter()
        .find(|tier| rule.comparison.holds(avg_value, tier.threshold))
        .map(|tier| tier.severity)
        .unwrap_or(rule.floor)
}
