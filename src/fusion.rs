//! Multi-source fusion
//!
//! Keeps one fused value per (user, metric) from every enabled source that
//! reports it; source state is owned by the caller and passed in. The latest
//! observation wins and exact event-time ties go to the source listed first
//! in the priority order. Fusion has no wall-clock
//! input, so replaying the same readings and control signals reproduces the
//! same snapshots.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::PulseConfig;
use crate::sources::SourceRegistry;
use crate::types::{FusedMetric, Metric, Reading, SourceContribution, SourceId};

/// Deterministic source ranking; lower ranks win ties
#[derive(Debug, Clone)]
pub struct SourcePriority {
    order: Vec<SourceId>,
}

impl SourcePriority {
    pub fn new(order: Vec<SourceId>) -> Self {
        Self { order }
    }

    /// Listed sources rank by position, unlisted ones after them by id
    fn rank<'a>(&self, source_id: &'a SourceId) -> (usize, &'a SourceId) {
        let position = self
            .order
            .iter()
            .position(|s| s == source_id)
            .unwrap_or(self.order.len());
        (position, source_id)
    }

    /// `Greater` when `a` should be preferred over `b`
    pub fn prefer(&self, a: &SourceContribution, b: &SourceContribution) -> Ordering {
        a.observed_at
            .cmp(&b.observed_at)
            .then_with(|| self.rank(&b.source_id).cmp(&self.rank(&a.source_id)))
    }

    fn sort(&self, contributions: &mut [SourceContribution]) {
        contributions.sort_by(|a, b| self.rank(&a.source_id).cmp(&self.rank(&b.source_id)));
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self::new(vec![SourceId::Apple, SourceId::Google, SourceId::Oura])
    }
}

#[derive(Debug, Clone)]
struct FusedState {
    value: f64,
    winning_source: SourceId,
    contributions: BTreeMap<SourceId, SourceContribution>,
    updated_at: DateTime<Utc>,
}

type UserFusion = BTreeMap<Metric, FusedState>;

/// Fused metric state for every user handled by one partition
#[derive(Debug, Clone, Default)]
pub struct FusionAggregator {
    priority: SourcePriority,
    users: HashMap<String, UserFusion>,
}

impl FusionAggregator {
    pub fn new(priority: SourcePriority) -> Self {
        Self {
            priority,
            users: HashMap::new(),
        }
    }

    pub fn from_config(config: &PulseConfig) -> Self {
        Self::new(SourcePriority::new(config.source_priority.clone()))
    }

    /// Fold a reading into its (user, metric) value
    ///
    /// Returns `None` when `sources` has the reading's source disabled.
    pub fn update(&mut self, reading: &Reading, sources: &SourceRegistry) -> Option<FusedMetric> {
        if !sources.is_enabled(&reading.source_id) {
            return None;
        }
        let user = self.users.entry(reading.user_id.clone()).or_default();

        let incoming = SourceContribution {
            source_id: reading.source_id.clone(),
            value: reading.value,
            observed_at: reading.observed_at,
        };

        let state = user
            .entry(reading.metric)
            .or_insert_with(|| FusedState {
                value: reading.value,
                winning_source: reading.source_id.clone(),
                contributions: BTreeMap::new(),
                updated_at: reading.observed_at,
            });

        match state.contributions.get(&reading.source_id) {
            // an older reading from the same source never replaces a newer one
            Some(existing) if existing.observed_at > reading.observed_at => {}
            _ => {
                state
                    .contributions
                    .insert(reading.source_id.clone(), incoming);
            }
        }

        let priority = &self.priority;
        if let Some(winner) = state
            .contributions
            .values()
            .max_by(|a, b| priority.prefer(a, b))
        {
            state.value = winner.value;
            state.winning_source = winner.source_id.clone();
            state.updated_at = state.updated_at.max(winner.observed_at);
        }

        Some(snapshot(&self.priority, &reading.user_id, reading.metric, state))
    }

    /// Drop a source's contributions; fused values are kept as they are
    ///
    /// Returns the snapshots whose attribution changed.
    pub fn disable_source(&mut self, user_id: &str, source_id: &SourceId) -> Vec<FusedMetric> {
        let Some(user) = self.users.get_mut(user_id) else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for (metric, state) in user.iter_mut() {
            if state.contributions.remove(source_id).is_some() {
                changed.push(snapshot(&self.priority, user_id, *metric, state));
            }
        }
        if !changed.is_empty() {
            debug!(
                user_id,
                source_id = %source_id,
                metrics = changed.len(),
                "source removed from fusion"
            );
        }
        changed
    }

    pub fn get(&self, user_id: &str, metric: Metric) -> Option<FusedMetric> {
        let user = self.users.get(user_id)?;
        let state = user.get(&metric)?;
        Some(snapshot(&self.priority, user_id, metric, state))
    }

    /// All fused metrics for a user, in metric order
    pub fn snapshot(&self, user_id: &str) -> Vec<FusedMetric> {
        self.users
            .get(user_id)
            .map(|user| {
                user.iter()
                    .map(|(metric, state)| snapshot(&self.priority, user_id, *metric, state))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn end_session(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

fn snapshot(
    priority: &SourcePriority,
    user_id: &str,
    metric: Metric,
    state: &FusedState,
) -> FusedMetric {
    let mut contributing_sources: Vec<SourceContribution> =
        state.contributions.values().cloned().collect();
    priority.sort(&mut contributing_sources);

    FusedMetric {
        user_id: user_id.to_string(),
        metric,
        value: state.value,
        winning_source: state.winning_source.clone(),
        contributing_sources,
        updated_at: state.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    impl FusionAggregator {
        /// Update with every source enabled
        fn fold(&mut self, reading: &Reading) -> Option<FusedMetric> {
            self.update(reading, &SourceRegistry::new())
        }
    }

    fn hr(source: SourceId, value: f64, secs: i64) -> Reading {
        Reading::new("u1", source, Metric::HeartRate, value, at(secs))
    }

    #[test]
    fn test_latest_observation_wins() {
        let mut fusion = FusionAggregator::default();
        fusion.fold(&hr(SourceId::Apple, 70.0, 0));
        let fused = fusion.fold(&hr(SourceId::Google, 74.0, 2)).unwrap();

        assert_eq!(fused.value, 74.0);
        assert_eq!(fused.winning_source, SourceId::Google);
        assert_eq!(fused.updated_at, at(2));
        assert_eq!(fused.contributing_sources.len(), 2);
        assert_eq!(fused.contributing_sources[0].source_id, SourceId::Apple);
    }

    #[test]
    fn test_older_reading_only_updates_attribution() {
        let mut fusion = FusionAggregator::default();
        fusion.fold(&hr(SourceId::Apple, 70.0, 10));
        let fused = fusion.fold(&hr(SourceId::Oura, 66.0, 5)).unwrap();

        assert_eq!(fused.value, 70.0);
        assert_eq!(fused.winning_source, SourceId::Apple);
        assert_eq!(fused.updated_at, at(10));
        assert_eq!(fused.contribution(&SourceId::Oura).unwrap().value, 66.0);
    }

    #[test]
    fn test_same_source_keeps_newest_contribution() {
        let mut fusion = FusionAggregator::default();
        fusion.fold(&hr(SourceId::Apple, 70.0, 10));
        let fused = fusion.fold(&hr(SourceId::Apple, 60.0, 4)).unwrap();
        assert_eq!(fused.contribution(&SourceId::Apple).unwrap().value, 70.0);
        assert_eq!(fused.value, 70.0);
    }

    #[test]
    fn test_tie_break_by_priority_regardless_of_arrival() {
        let mut a = FusionAggregator::default();
        a.fold(&hr(SourceId::Oura, 61.0, 3));
        a.fold(&hr(SourceId::Apple, 63.0, 3));
        let first = a.fold(&hr(SourceId::Google, 62.0, 3)).unwrap();

        let mut b = FusionAggregator::default();
        b.fold(&hr(SourceId::Google, 62.0, 3));
        b.fold(&hr(SourceId::Apple, 63.0, 3));
        let second = b.fold(&hr(SourceId::Oura, 61.0, 3)).unwrap();

        assert_eq!(first.value, 63.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unlisted_sources_rank_after_listed() {
        let mut fusion = FusionAggregator::default();
        fusion.fold(&hr(SourceId::Other("polar".to_string()), 80.0, 1));
        let fused = fusion.fold(&hr(SourceId::Oura, 79.0, 1)).unwrap();
        assert_eq!(fused.winning_source, SourceId::Oura);

        fusion.fold(&hr(SourceId::Other("coros".to_string()), 81.0, 2));
        let fused = fusion
            .fold(&hr(SourceId::Other("amazfit".to_string()), 82.0, 2))
            .unwrap();
        assert_eq!(fused.winning_source, SourceId::Other("amazfit".to_string()));
    }

    #[test]
    fn test_disable_retains_value_and_drops_attribution() {
        let mut fusion = FusionAggregator::default();
        let mut sources = SourceRegistry::new();
        fusion.fold(&hr(SourceId::Google, 72.0, 0));
        fusion.fold(&hr(SourceId::Apple, 75.0, 4));

        sources.set_enabled(&SourceId::Apple, false);
        let changed = fusion.disable_source("u1", &SourceId::Apple);
        assert_eq!(changed.len(), 1);
        let fused = &changed[0];
        assert_eq!(fused.value, 75.0);
        assert_eq!(fused.winning_source, SourceId::Apple);
        assert!(fused.contribution(&SourceId::Apple).is_none());
        assert!(fused.contribution(&SourceId::Google).is_some());

        // disabled source is ignored from now on
        assert!(fusion.update(&hr(SourceId::Apple, 90.0, 6), &sources).is_none());

        // the next qualifying reading takes over without moving updated_at back
        let fused = fusion.update(&hr(SourceId::Google, 73.0, 2), &sources).unwrap();
        assert_eq!(fused.value, 73.0);
        assert_eq!(fused.winning_source, SourceId::Google);
        assert_eq!(fused.updated_at, at(4));
    }

    #[test]
    fn test_disable_is_idempotent_and_enable_readmits() {
        let mut fusion = FusionAggregator::default();
        let mut sources = SourceRegistry::new();
        fusion.fold(&hr(SourceId::Apple, 70.0, 0));
        assert_eq!(fusion.disable_source("u1", &SourceId::Apple).len(), 1);
        assert!(fusion.disable_source("u1", &SourceId::Apple).is_empty());
        assert!(fusion.disable_source("nobody", &SourceId::Apple).is_empty());

        sources.set_enabled(&SourceId::Apple, true);
        let fused = fusion.update(&hr(SourceId::Apple, 71.0, 1), &sources).unwrap();
        assert_eq!(fused.value, 71.0);
    }

    #[test]
    fn test_snapshot_lists_metrics() {
        let mut fusion = FusionAggregator::default();
        fusion.fold(&hr(SourceId::Apple, 70.0, 0));
        fusion.fold(&Reading::new("u1", SourceId::Oura, Metric::Hrv, 48.0, at(0)));
        let metrics: Vec<Metric> = fusion.snapshot("u1").iter().map(|f| f.metric).collect();
        assert_eq!(metrics, vec![Metric::HeartRate, Metric::Hrv]);
        assert!(fusion.snapshot("u2").is_empty());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Read(u8, u8, i64, u8),
        Toggle(u8, bool),
    }

    fn source(i: u8) -> SourceId {
        match i % 4 {
            0 => SourceId::Apple,
            1 => SourceId::Google,
            2 => SourceId::Oura,
            _ => SourceId::Other("polar".to_string()),
        }
    }

    fn metric(i: u8) -> Metric {
        Metric::ALL[i as usize % Metric::ALL.len()]
    }

    fn replay(steps: &[Step]) -> Vec<Option<FusedMetric>> {
        let mut fusion = FusionAggregator::default();
        let mut sources = SourceRegistry::new();
        let mut out = Vec::new();
        for step in steps {
            match step {
                Step::Read(s, m, secs, v) => out.push(fusion.update(
                    &Reading::new("u1", source(*s), metric(*m), *v as f64, at(*secs)),
                    &sources,
                )),
                Step::Toggle(s, true) => {
                    sources.set_enabled(&source(*s), true);
                }
                Step::Toggle(s, false) => {
                    if sources.set_enabled(&source(*s), false) {
                        out.extend(fusion.disable_source("u1", &source(*s)).into_iter().map(Some));
                    }
                }
            }
        }
        out
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0u8..4, 0u8..3, 0i64..20, 40u8..180).prop_map(|(s, m, t, v)| Step::Read(s, m, t, v)),
            1 => (0u8..4, any::<bool>()).prop_map(|(s, e)| Step::Toggle(s, e)),
        ]
    }

    proptest! {
        #[test]
        fn prop_replay_is_deterministic(steps in prop::collection::vec(step_strategy(), 0..80)) {
            prop_assert_eq!(replay(&steps), replay(&steps));
        }

        #[test]
        fn prop_updated_at_is_monotonic(steps in prop::collection::vec(step_strategy(), 0..80)) {
            let mut last: HashMap<Metric, DateTime<Utc>> = HashMap::new();
            for fused in replay(&steps).into_iter().flatten() {
                if let Some(prev) = last.get(&fused.metric) {
                    prop_assert!(fused.updated_at >= *prev);
                }
                last.insert(fused.metric, fused.updated_at);
            }
        }

        #[test]
        fn prop_tie_break_ignores_arrival_order(
            values in prop::collection::vec(40u8..180, 4),
            rotation in 0usize..4,
        ) {
            let readings: Vec<Reading> = values
                .iter()
                .enumerate()
                .map(|(i, v)| hr(source(i as u8), *v as f64, 7))
                .collect();
            let mut rotated = readings.clone();
            rotated.rotate_left(rotation);

            let mut a = FusionAggregator::default();
            let mut b = FusionAggregator::default();
            let last_a = readings.iter().filter_map(|r| a.fold(r)).last().unwrap();
            let last_b = rotated.iter().filter_map(|r| b.fold(r)).last().unwrap();

            prop_assert_eq!(last_a.value, values[0] as f64);
            prop_assert_eq!(last_a, last_b);
        }
    }
}
