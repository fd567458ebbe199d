//! Record filtering.
//!
//! Deterministic policy, evaluated in order:
//!
//! 1. malformed records always pass — diagnostics are never filtered
//! 2. `current_state` in `drop_states` → drop
//! 3. `device_id` in `drop_device_ids` → drop
//! 4. `keep_device_ids` non-empty and `device_id` not in it → drop
//! 5. otherwise → pass
//!
//! Rule 3 preceding rule 4 means an id present in both lists is dropped.
//! Drops produce a debug `event_dropped` log line, never a record.

use crate::config::FilterConfig;
use polaris_core::Record;
use std::collections::HashSet;
use tracing::debug;

/// Stateless keep/drop policy over records.
pub struct EventFilter {
    /// Canonicalized to the wire's upper-case form at construction, so
    /// config files may spell states either way.
    drop_states: HashSet<String>,
    drop_device_ids: HashSet<String>,
    keep_device_ids: HashSet<String>,
}

impl EventFilter {
    pub fn new(cfg: &FilterConfig) -> Self {
        Self {
            drop_states: cfg.drop_states.iter().map(|s| s.to_uppercase()).collect(),
            drop_device_ids: cfg.drop_device_ids.iter().cloned().collect(),
            keep_device_ids: cfg.keep_device_ids.iter().cloned().collect(),
        }
    }

    /// True if the record should continue to the writer.
    pub fn keeps(&self, record: &Record) -> bool {
        let state_change = match record {
            Record::Malformed(_) => return true,
            Record::StateChange(r) => r,
        };

        if self.drop_states.contains(state_change.current_state.as_str()) {
            debug!(
                device_id = %state_change.device_id,
                state = %state_change.current_state,
                reason = "drop_states",
                "event_dropped"
            );
            return false;
        }

        if self.drop_device_ids.contains(&state_change.device_id) {
            debug!(
                device_id = %state_change.device_id,
                reason = "drop_device_ids",
                "event_dropped"
            );
            return false;
        }

        if !self.keep_device_ids.is_empty()
            && !self.keep_device_ids.contains(&state_change.device_id)
        {
            debug!(
                device_id = %state_change.device_id,
                reason = "keep_device_ids",
                "event_dropped"
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use polaris_core::{
        DeviceState, ErrorCode, ErrorDetail, MalformedRecord, SourceInfo, StateChangeRecord,
    };

    fn state_change(device_id: &str, state: DeviceState) -> Record {
        Record::StateChange(StateChangeRecord {
            timestamp: None,
            received_at: "2025-02-15T18:32:01.000Z".to_string(),
            device_id: device_id.to_string(),
            device_label: None,
            previous_state: None,
            current_state: state,
            latitude: None,
            longitude: None,
            altitude_m: None,
            rtk_enabled: None,
            tags: None,
            source: SourceInfo::default(),
        })
    }

    fn malformed() -> Record {
        Record::Malformed(MalformedRecord {
            timestamp: "2025-02-15T18:32:01.000Z".to_string(),
            received_at: "2025-02-15T18:32:01.000Z".to_string(),
            error: ErrorDetail::new(ErrorCode::ParseError, "x", b"x"),
            source: SourceInfo::default(),
        })
    }

    fn filter(drop_states: &[&str], drop_ids: &[&str], keep_ids: &[&str]) -> EventFilter {
        EventFilter::new(&FilterConfig {
            drop_states: drop_states.iter().map(|s| s.to_string()).collect(),
            drop_device_ids: drop_ids.iter().map(|s| s.to_string()).collect(),
            keep_device_ids: keep_ids.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn empty_config_passes_everything() {
        let f = filter(&[], &[], &[]);
        assert!(f.keeps(&state_change("d1", DeviceState::Connected)));
        assert!(f.keeps(&state_change("d1", DeviceState::Undefined)));
    }

    #[test]
    fn drops_by_state() {
        let f = filter(&["UNDEFINED"], &[], &[]);
        assert!(!f.keeps(&state_change("d1", DeviceState::Undefined)));
        assert!(f.keeps(&state_change("d1", DeviceState::Connected)));
    }

    #[test]
    fn lowercase_config_states_still_match() {
        // The shipped default is ["undefined", "error"].
        let f = filter(&["undefined", "error"], &[], &[]);
        assert!(!f.keeps(&state_change("d1", DeviceState::Undefined)));
        assert!(!f.keeps(&state_change("d1", DeviceState::Error)));
        assert!(f.keeps(&state_change("d1", DeviceState::Connected)));
    }

    #[test]
    fn drops_by_device_id() {
        let f = filter(&[], &["noisy-device"], &[]);
        assert!(!f.keeps(&state_change("noisy-device", DeviceState::Connected)));
        assert!(f.keeps(&state_change("other", DeviceState::Connected)));
    }

    #[test]
    fn keep_list_excludes_everyone_else() {
        let f = filter(&[], &[], &["d1", "d2"]);
        assert!(f.keeps(&state_change("d1", DeviceState::Connected)));
        assert!(f.keeps(&state_change("d2", DeviceState::Connected)));
        assert!(!f.keeps(&state_change("d3", DeviceState::Connected)));
    }

    #[test]
    fn drop_list_wins_over_keep_list() {
        let f = filter(&[], &["d1"], &["d1"]);
        assert!(!f.keeps(&state_change("d1", DeviceState::Connected)));
    }

    #[test]
    fn malformed_always_passes() {
        let f = filter(&["UNDEFINED"], &["d1"], &["only-this"]);
        assert!(f.keeps(&malformed()));
    }
}
