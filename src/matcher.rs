//! Pattern matching engine
//!
//! One run-length state machine per (user, pattern). Each pattern advances on
//! readings of its primary metric; the other metrics its predicate references
//! are read from a per-user snapshot of the latest value of every metric.
//! The snapshot remembers which source reported each value so a disabled
//! source can be purged from it. Runs are non-overlapping: once a run closes
//! the next one can only start at a later reading.
//!
//! Memory is O(users × patterns): a user holds one `MatchState` per pattern
//! plus one context entry per (metric, reporting source).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PulseConfig;
use crate::patterns::PatternDefinition;
use crate::severity;
use crate::types::{Alert, Metric, Reading, SourceId};

/// Run-length state for one (user, pattern)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchState {
    pub run_count: u32,
    pub run_start_time: Option<DateTime<Utc>>,
    pub run_sum: f64,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl MatchState {
    pub fn is_open(&self) -> bool {
        self.run_count > 0
    }

    /// `run_count > 0` implies a start time
    pub fn is_consistent(&self) -> bool {
        self.run_count == 0 || self.run_start_time.is_some()
    }

    fn extend(&mut self, value: f64, observed_at: DateTime<Utc>) {
        self.run_count += 1;
        if self.run_count == 1 {
            self.run_start_time = Some(observed_at);
        }
        self.run_sum += value;
        self.last_event_time = Some(observed_at);
    }

    fn reset(&mut self) {
        *self = MatchState::default();
    }

    /// Span the run would cover if `observed_at` were folded into it
    fn span_to(&self, observed_at: DateTime<Utc>) -> Option<Duration> {
        self.run_start_time.map(|start| observed_at - start)
    }

    /// Close the run, producing an alert when it is long enough, and reset
    fn close(&mut self, pattern: &PatternDefinition, user_id: &str) -> Option<Alert> {
        let alert = match (self.run_start_time, self.last_event_time) {
            (Some(start_time), Some(end_time)) if self.run_count >= pattern.min_run_length => {
                let avg_value = self.run_sum / self.run_count as f64;
                Some(Alert {
                    alert_id: Uuid::new_v4().to_string(),
                    pattern_id: pattern.id.clone(),
                    user_id: user_id.to_string(),
                    severity: severity::classify(avg_value, pattern),
                    start_time,
                    end_time,
                    sample_count: self.run_count,
                    avg_value,
                    description: pattern.describe(avg_value, self.run_count),
                })
            }
            _ => None,
        };
        self.reset();
        alert
    }
}

#[derive(Debug, Clone, Copy)]
struct ContextValue {
    value: f64,
    observed_at: DateTime<Utc>,
    /// Arrival order within the user, breaks event-time ties
    seq: u64,
}

/// Matching state owned by one user
#[derive(Debug, Clone)]
struct UserMatcher {
    context: HashMap<Metric, BTreeMap<SourceId, ContextValue>>,
    seq: u64,
    states: Vec<MatchState>,
    /// End time of the last alert per pattern; later runs must start after it
    fences: Vec<Option<DateTime<Utc>>>,
}

impl UserMatcher {
    fn new(pattern_count: usize) -> Self {
        Self {
            context: HashMap::with_capacity(Metric::ALL.len()),
            seq: 0,
            states: vec![MatchState::default(); pattern_count],
            fences: vec![None; pattern_count],
        }
    }

    fn remember(&mut self, reading: &Reading) {
        self.seq += 1;
        self.context.entry(reading.metric).or_default().insert(
            reading.source_id.clone(),
            ContextValue {
                value: reading.value,
                observed_at: reading.observed_at,
                seq: self.seq,
            },
        );
    }

    /// Latest value of `metric` across the sources still in context
    fn latest(&self, metric: Metric) -> Option<&ContextValue> {
        self.context
            .get(&metric)?
            .values()
            .max_by_key(|ctx| (ctx.observed_at, ctx.seq))
    }

    /// Evaluate the predicate at `now`; missing or stale context fails it
    fn predicate_holds(
        &self,
        pattern: &PatternDefinition,
        now: DateTime<Utc>,
        context_max_age: Duration,
    ) -> bool {
        pattern.predicate.iter().all(|condition| {
            match self.latest(condition.metric) {
                Some(ctx) if now - ctx.observed_at <= context_max_age => {
                    condition.holds(ctx.value)
                }
                _ => false,
            }
        })
    }

    /// Forget every context value reported by `source_id`
    fn forget_source(&mut self, source_id: &SourceId) -> usize {
        let mut removed = 0;
        self.context.retain(|_, by_source| {
            if by_source.remove(source_id).is_some() {
                removed += 1;
            }
            !by_source.is_empty()
        });
        removed
    }
}

/// Converts an ordered-per-user reading stream into alerts
#[derive(Debug, Clone)]
pub struct PatternMatchingEngine {
    patterns: Arc<[PatternDefinition]>,
    context_max_age: Duration,
    users: HashMap<String, UserMatcher>,
}

impl PatternMatchingEngine {
    pub fn new(patterns: Vec<PatternDefinition>, context_max_age: Duration) -> Self {
        Self {
            patterns: patterns.into(),
            context_max_age,
            users: HashMap::new(),
        }
    }

    pub fn from_config(config: &PulseConfig) -> Self {
        Self::new(config.patterns.clone(), config.context_max_age())
    }

    pub fn patterns(&self) -> &[PatternDefinition] {
        &self.patterns
    }

    /// Consume one reading; callers guarantee non-decreasing `observed_at` per user
    pub fn process(&mut self, reading: &Reading) -> Vec<Alert> {
        let pattern_count = self.patterns.len();
        let user = self
            .users
            .entry(reading.user_id.clone())
            .or_insert_with(|| UserMatcher::new(pattern_count));

        user.remember(reading);

        let mut alerts = Vec::new();
        for (idx, pattern) in self.patterns.iter().enumerate() {
            if pattern.primary_metric != reading.metric {
                continue;
            }

            // simultaneous readings must not reopen a range that already alerted
            let fenced = user.fences[idx]
                .map(|end| reading.observed_at <= end)
                .unwrap_or(false);
            let matched = !fenced
                && user.predicate_holds(pattern, reading.observed_at, self.context_max_age);
            let state = &mut user.states[idx];

            let closed = if matched {
                let over_span = state
                    .span_to(reading.observed_at)
                    .map(|span| span > pattern.max_match_span())
                    .unwrap_or(false);
                let closed = if over_span {
                    debug!(
                        user_id = %reading.user_id,
                        pattern_id = %pattern.id,
                        run_count = state.run_count,
                        "run exceeded max match span, force-closing"
                    );
                    state.close(pattern, &reading.user_id)
                } else {
                    None
                };
                state.extend(reading.value, reading.observed_at);
                closed
            } else if state.is_open() {
                state.close(pattern, &reading.user_id)
            } else {
                None
            };

            if let Some(alert) = closed {
                user.fences[idx] = Some(alert.end_time);
                alerts.push(alert);
            }
        }

        for alert in &alerts {
            info!(
                user_id = %alert.user_id,
                pattern_id = %alert.pattern_id,
                severity = %alert.severity,
                sample_count = alert.sample_count,
                avg_value = alert.avg_value,
                "alert emitted"
            );
        }
        alerts
    }

    /// Current state for one (user, pattern)
    pub fn state(&self, user_id: &str, pattern_id: &str) -> Option<&MatchState> {
        let idx = self.patterns.iter().position(|p| p.id == pattern_id)?;
        self.users.get(user_id).map(|u| &u.states[idx])
    }

    /// Stop using a source's values as predicate context for one user
    ///
    /// Open runs stay open; the next primary reading is judged on the
    /// remaining context only.
    pub fn disable_source(&mut self, user_id: &str, source_id: &SourceId) -> bool {
        let removed = self
            .users
            .get_mut(user_id)
            .map(|user| user.forget_source(source_id))
            .unwrap_or(0);
        if removed > 0 {
            debug!(user_id, source_id = %source_id, metrics = removed, "context purged for disabled source");
        }
        removed > 0
    }

    /// Discard all in-flight runs for a user without emitting anything
    pub fn end_session(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{Comparison, Condition, SeverityRule};
    use crate::types::{Severity, SourceId};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn reading(user: &str, metric: Metric, value: f64, secs: i64) -> Reading {
        Reading::new(user, SourceId::Apple, metric, value, at(secs))
    }

    fn engine() -> PatternMatchingEngine {
        PatternMatchingEngine::from_config(&PulseConfig::default())
    }

    /// Heart-rate-only pattern without context metrics
    fn high_hr_pattern(min_run_length: u32, span_secs: i64) -> PatternDefinition {
        PatternDefinition {
            id: "HIGH_HR".to_string(),
            primary_metric: Metric::HeartRate,
            predicate: vec![Condition::new(Metric::HeartRate, Comparison::Above, 100.0)],
            min_run_length,
            max_match_span_ms: span_secs * 1000,
            severity_rule: SeverityRule::above(&[(130.0, Severity::High)], Severity::Medium),
            description: "HR {avg} for {count}".to_string(),
            avg_decimals: 0,
        }
    }

    /// Feed activity then heart rate at one timestamp, as a device bundle would
    fn feed_at_rest(
        engine: &mut PatternMatchingEngine,
        user: &str,
        hr: f64,
        secs: i64,
    ) -> Vec<Alert> {
        let mut alerts = engine.process(&reading(user, Metric::ActivityLevel, 5.0, secs));
        alerts.extend(engine.process(&reading(user, Metric::HeartRate, hr, secs)));
        alerts
    }

    #[test]
    fn test_tachycardia_example_scenario() {
        let mut engine = engine();

        for (i, hr) in [110.0, 115.0, 120.0, 118.0, 112.0].iter().enumerate() {
            let alerts = feed_at_rest(&mut engine, "u1", *hr, i as i64 * 2);
            assert!(alerts.is_empty(), "run still open at reading {i}");
        }

        let state = engine.state("u1", "TACHYCARDIA_AT_REST").unwrap();
        assert_eq!(state.run_count, 5);
        assert_eq!(state.run_start_time, Some(at(0)));

        let alerts = feed_at_rest(&mut engine, "u1", 85.0, 10);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.pattern_id, "TACHYCARDIA_AT_REST");
        assert_eq!(alert.user_id, "u1");
        assert_eq!(alert.sample_count, 5);
        assert!((alert.avg_value - 115.0).abs() < 1e-9);
        assert_eq!(alert.start_time, at(0));
        assert_eq!(alert.end_time, at(8));
        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(
            alert.description,
            "Sustained elevated HR (115 bpm avg) detected while at rest for 5 consecutive readings"
        );

        let state = engine.state("u1", "TACHYCARDIA_AT_REST").unwrap();
        assert_eq!(state, &MatchState::default());
    }

    #[test]
    fn test_short_run_resets_without_alert() {
        let mut engine = engine();
        for secs in [0, 2, 4, 6] {
            assert!(feed_at_rest(&mut engine, "u1", 120.0, secs).is_empty());
        }
        assert!(feed_at_rest(&mut engine, "u1", 80.0, 8).is_empty());
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);
    }

    #[test]
    fn test_missing_context_does_not_match() {
        let mut engine = engine();
        for secs in 0..6 {
            assert!(engine
                .process(&reading("u1", Metric::HeartRate, 125.0, secs))
                .is_empty());
        }
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);
    }

    #[test]
    fn test_stale_context_does_not_match() {
        let mut engine = engine();
        engine.process(&reading("u1", Metric::ActivityLevel, 2.0, 0));
        engine.process(&reading("u1", Metric::HeartRate, 125.0, 10));
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 1);

        // default context max age is 30s
        engine.process(&reading("u1", Metric::HeartRate, 125.0, 31));
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);
    }

    #[test]
    fn test_context_change_breaks_run() {
        let mut engine = engine();
        for secs in [0, 1, 2, 3, 4] {
            feed_at_rest(&mut engine, "u1", 140.0, secs);
        }
        // user starts moving: the next heart-rate reading no longer matches
        engine.process(&reading("u1", Metric::ActivityLevel, 60.0, 5));
        let alerts = engine.process(&reading("u1", Metric::HeartRate, 140.0, 5));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].end_time, at(4));
    }

    #[test]
    fn test_unrelated_metrics_do_not_perturb_run() {
        let mut engine = engine();
        for secs in [0, 2, 4, 6, 8] {
            feed_at_rest(&mut engine, "u1", 118.0, secs);
            engine.process(&reading("u1", Metric::Spo2, 98.0, secs));
            engine.process(&reading("u1", Metric::SkinTemp, 36.5, secs));
        }
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 5);
    }

    #[test]
    fn test_span_cutoff_force_closes_and_restarts() {
        let mut engine = engine();
        let mut alerts = Vec::new();
        for secs in (0..=60).step_by(10) {
            alerts.extend(feed_at_rest(&mut engine, "u1", 120.0, secs));
        }
        assert!(alerts.is_empty());

        // 70s after the run start exceeds the 60s span
        let alerts = feed_at_rest(&mut engine, "u1", 120.0, 70);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].sample_count, 7);
        assert_eq!(alerts[0].start_time, at(0));
        assert_eq!(alerts[0].end_time, at(60));

        let state = engine.state("u1", "TACHYCARDIA_AT_REST").unwrap();
        assert_eq!(state.run_count, 1);
        assert_eq!(state.run_start_time, Some(at(70)));
    }

    #[test]
    fn test_span_cutoff_short_run_discarded() {
        let mut engine = PatternMatchingEngine::new(vec![high_hr_pattern(3, 10)], Duration::seconds(30));
        engine.process(&reading("u1", Metric::HeartRate, 120.0, 0));
        engine.process(&reading("u1", Metric::HeartRate, 120.0, 5));
        let alerts = engine.process(&reading("u1", Metric::HeartRate, 120.0, 11));
        assert!(alerts.is_empty());
        let state = engine.state("u1", "HIGH_HR").unwrap();
        assert_eq!(state.run_count, 1);
        assert_eq!(state.run_start_time, Some(at(11)));
    }

    #[test]
    fn test_users_are_independent() {
        let mut engine = engine();
        for secs in [0, 1, 2, 3, 4] {
            feed_at_rest(&mut engine, "u1", 120.0, secs);
            feed_at_rest(&mut engine, "u2", 70.0, secs);
        }
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 5);
        assert_eq!(engine.state("u2", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);
        assert!(feed_at_rest(&mut engine, "u2", 70.0, 5).is_empty());
    }

    #[test]
    fn test_end_session_discards_open_run() {
        let mut engine = engine();
        for secs in [0, 1, 2, 3, 4, 5] {
            feed_at_rest(&mut engine, "u1", 120.0, secs);
        }
        assert!(engine.end_session("u1"));
        assert!(engine.state("u1", "TACHYCARDIA_AT_REST").is_none());
        // a fresh session starts from nothing
        assert!(feed_at_rest(&mut engine, "u1", 80.0, 6).is_empty());
    }

    #[test]
    fn test_simultaneous_reading_cannot_reopen_alerted_range() {
        let mut engine = PatternMatchingEngine::new(vec![high_hr_pattern(2, 60)], Duration::seconds(30));
        engine.process(&reading("u1", Metric::HeartRate, 120.0, 0));
        engine.process(&reading("u1", Metric::HeartRate, 120.0, 1));
        let alerts = engine.process(&reading("u1", Metric::HeartRate, 80.0, 1));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].end_time, at(1));

        // a second source reporting the same instant is fenced off
        engine.process(&reading("u1", Metric::HeartRate, 125.0, 1));
        assert_eq!(engine.state("u1", "HIGH_HR").unwrap().run_count, 0);

        engine.process(&reading("u1", Metric::HeartRate, 125.0, 2));
        assert_eq!(engine.state("u1", "HIGH_HR").unwrap().run_start_time, Some(at(2)));
    }

    #[test]
    fn test_disabled_source_context_no_longer_satisfies_predicate() {
        let mut engine = engine();
        engine.process(&reading("u1", Metric::ActivityLevel, 5.0, 0));
        assert!(engine.disable_source("u1", &SourceId::Apple));
        assert!(!engine.disable_source("u1", &SourceId::Apple));

        let mut alerts = Vec::new();
        for secs in 1..=5 {
            alerts.extend(engine.process(&Reading::new(
                "u1",
                SourceId::Google,
                Metric::HeartRate,
                120.0,
                at(secs),
            )));
        }
        alerts.extend(engine.process(&Reading::new("u1", SourceId::Google, Metric::HeartRate, 80.0, at(6))));
        assert!(alerts.is_empty());
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);
    }

    #[test]
    fn test_context_from_remaining_source_still_counts() {
        let mut engine = engine();
        engine.process(&Reading::new("u1", SourceId::Oura, Metric::ActivityLevel, 4.0, at(0)));
        // newer apple value would fail the predicate on its own
        engine.process(&reading("u1", Metric::ActivityLevel, 50.0, 1));
        engine.process(&reading("u1", Metric::HeartRate, 120.0, 1));
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 0);

        engine.disable_source("u1", &SourceId::Apple);
        engine.process(&Reading::new("u1", SourceId::Google, Metric::HeartRate, 120.0, at(2)));
        assert_eq!(engine.state("u1", "TACHYCARDIA_AT_REST").unwrap().run_count, 1);
    }

    #[test]
    fn test_hypoxia_pattern() {
        let mut engine = engine();
        for (secs, spo2) in [(0, 91.0), (1, 89.0), (2, 90.0)] {
            assert!(engine.process(&reading("u1", Metric::Spo2, spo2, secs)).is_empty());
        }
        let alerts = engine.process(&reading("u1", Metric::Spo2, 97.0, 3));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].pattern_id, "LOW_SPO2_HYPOXIA");
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].sample_count, 3);
    }

    proptest! {
        #[test]
        fn prop_alerts_never_overlap_and_respect_span(
            steps in prop::collection::vec((0i64..8, 60.0f64..160.0), 1..200)
        ) {
            let pattern = high_hr_pattern(3, 20);
            let span = pattern.max_match_span();
            let mut engine = PatternMatchingEngine::new(vec![pattern], Duration::seconds(30));
            let mut t = 0;
            let mut alerts: Vec<Alert> = Vec::new();
            for (gap, hr) in steps {
                t += gap;
                alerts.extend(engine.process(&reading("u1", Metric::HeartRate, hr, t)));
                prop_assert!(engine.state("u1", "HIGH_HR").unwrap().is_consistent());
            }
            for (i, a) in alerts.iter().enumerate() {
                prop_assert!(a.end_time - a.start_time <= span);
                prop_assert!(a.sample_count >= 3);
                for b in &alerts[i + 1..] {
                    prop_assert!(!a.overlaps(b));
                    prop_assert!(a.end_time < b.start_time);
                }
            }
        }

        #[test]
        fn prop_run_length_correctness(
            values in prop::collection::vec(101.0f64..200.0, 1..12),
            min_run_length in 1u32..8,
        ) {
            let mut engine = PatternMatchingEngine::new(
                vec![high_hr_pattern(min_run_length, 3600)],
                Duration::seconds(30),
            );
            let mut alerts = Vec::new();
            for (i, v) in values.iter().enumerate() {
                alerts.extend(engine.process(&reading("u1", Metric::HeartRate, *v, i as i64)));
            }
            prop_assert!(alerts.is_empty());

            let closing = engine.process(&reading("u1", Metric::HeartRate, 70.0, values.len() as i64));
            let n = values.len() as u32;
            if n >= min_run_length {
                prop_assert_eq!(closing.len(), 1);
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                prop_assert_eq!(closing[0].sample_count, n);
                prop_assert!((closing[0].avg_value - mean).abs() < 1e-9);
                prop_assert_eq!(closing[0].start_time, at(0));
                prop_assert_eq!(closing[0].end_time, at(n as i64 - 1));
            } else {
                prop_assert!(closing.is_empty());
            }
        }
    }
}
