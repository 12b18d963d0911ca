//! Per-user source state
//!
//! Source enable/disable is an external signal. Unknown sources are admitted
//! until a control signal says otherwise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{SourceControl, SourceId};

/// Enabled flag for one (user, source)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub enabled: bool,
}

/// Source states for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    states: BTreeMap<SourceId, SourceState>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a source has reported, creating its state if needed
    pub fn observe(&mut self, source_id: &SourceId) {
        self.states
            .entry(source_id.clone())
            .or_insert(SourceState { enabled: true });
    }

    /// Apply an enable/disable signal; returns `true` if the state changed
    pub fn set_enabled(&mut self, source_id: &SourceId, enabled: bool) -> bool {
        match self.states.get_mut(source_id) {
            Some(state) if state.enabled == enabled => false,
            Some(state) => {
                state.enabled = enabled;
                true
            }
            None => {
                self.states
                    .insert(source_id.clone(), SourceState { enabled });
                // A fresh source is implicitly enabled, so only a disable changes anything
                !enabled
            }
        }
    }

    /// Apply a control signal addressed to this user
    pub fn apply(&mut self, control: &SourceControl) -> bool {
        self.set_enabled(&control.source_id, control.enabled)
    }

    pub fn is_enabled(&self, source_id: &SourceId) -> bool {
        self.states
            .get(source_id)
            .map(|s| s.enabled)
            .unwrap_or(true)
    }

    /// Whether any source is currently disabled
    pub fn has_disabled(&self) -> bool {
        self.states.values().any(|s| !s.enabled)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_source_enabled_by_default() {
        let registry = SourceRegistry::new();
        assert!(registry.is_enabled(&SourceId::Other("polar".to_string())));
    }

    #[test]
    fn test_set_enabled_is_idempotent() {
        let mut registry = SourceRegistry::new();
        registry.observe(&SourceId::Apple);

        assert!(!registry.set_enabled(&SourceId::Apple, true));
        assert!(registry.set_enabled(&SourceId::Apple, false));
        assert!(!registry.set_enabled(&SourceId::Apple, false));
        assert!(!registry.is_enabled(&SourceId::Apple));
        assert!(registry.has_disabled());
        assert!(registry.set_enabled(&SourceId::Apple, true));
        assert!(registry.is_enabled(&SourceId::Apple));
        assert!(!registry.has_disabled());
    }

    #[test]
    fn test_control_before_first_reading_creates_state() {
        let mut registry = SourceRegistry::new();
        assert!(!registry.set_enabled(&SourceId::Oura, true));
        assert_eq!(registry.len(), 1);

        assert!(registry.set_enabled(&SourceId::Google, false));
        assert!(!registry.is_enabled(&SourceId::Google));

        // observing afterwards keeps the explicit state
        registry.observe(&SourceId::Google);
        assert!(!registry.is_enabled(&SourceId::Google));
    }

    #[test]
    fn test_apply_control_signal() {
        let mut registry = SourceRegistry::new();
        let control = SourceControl {
            user_id: "u1".to_string(),
            source_id: SourceId::Other("polar".to_string()),
            enabled: false,
        };
        assert!(registry.apply(&control));
        assert!(!registry.apply(&control));
        assert!(!registry.is_enabled(&control.source_id));
    }
}
