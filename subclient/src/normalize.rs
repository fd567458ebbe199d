//! Frame normalization: one [`RawMessage`] in, exactly one [`Record`] out.
//!
//! Classification order:
//!
//! ```text
//! raw bytes
//!   ├─ not JSON                      → malformed(parse_error)
//!   ├─ graphql `error` frame         → malformed(parse_error, server message)
//!   ├─ wrong shape at a required node → malformed(schema_mismatch)
//!   ├─ missing device id / state     → malformed(missing_fields)
//!   ├─ state outside the closed enum → malformed(unknown_state)
//!   └─ valid                         → state_change
//! ```
//!
//! The normalizer owns `last_state_by_device` — the per-session map that
//! supplies `previous_state` — and must therefore be driven serially, one
//! frame at a time, in arrival order. The map is cleared at session
//! boundaries: after a reconnect every device starts over with
//! `previous_state: null`.

use polaris_core::{
    format_timestamp, DeviceState, ErrorCode, ErrorDetail, MalformedRecord, RawMessage, Record,
    SourceInfo, StateChangeRecord, Tag,
};
use serde_json::Value;
use std::collections::HashMap;

/// Stateful frame → record transformer.
pub struct Normalizer {
    instance_id: String,
    /// device_id → last emitted current_state, this session only.
    last_state_by_device: HashMap<String, DeviceState>,
}

impl Normalizer {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            last_state_by_device: HashMap::new(),
        }
    }

    /// A new subscription session began: forget all previous states.
    pub fn begin_session(&mut self) {
        self.last_state_by_device.clear();
    }

    /// The session ended. The map is cleared eagerly so memory does not sit
    /// on dead state across a long backoff.
    pub fn end_session(&mut self) {
        self.last_state_by_device.clear();
    }

    /// Number of devices tracked in the current session.
    pub fn tracked_devices(&self) -> usize {
        self.last_state_by_device.len()
    }

    /// Classify one frame. Always returns a record; failures are data, not
    /// errors.
    pub fn normalize(&mut self, raw: &RawMessage) -> Record {
        let received_at = format_timestamp(raw.received_at);
        let source = SourceInfo {
            instance_id: self.instance_id.clone(),
            subscription_id: Some(raw.subscription_id.to_string()),
        };

        let value: Value = match serde_json::from_slice(&raw.payload) {
            Ok(v) => v,
            Err(e) => {
                return malformed(ErrorCode::ParseError, e.to_string(), raw, received_at, source)
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("next") => {}
            Some("error") => {
                let message = server_error_message(value.get("payload"));
                return malformed(ErrorCode::ParseError, message, raw, received_at, source);
            }
            other => {
                let message = match other {
                    Some(kind) => format!("unexpected frame type {kind:?}"),
                    None => "frame has no type field".to_string(),
                };
                return malformed(ErrorCode::SchemaMismatch, message, raw, received_at, source);
            }
        }

        let Some(device) = get_path(&value, &["payload", "data", "devices"]).filter(|v| v.is_object())
        else {
            return malformed(
                ErrorCode::SchemaMismatch,
                "missing path: payload.data.devices",
                raw,
                received_at,
                source,
            );
        };

        let device_id = device.get("id").and_then(Value::as_str).unwrap_or("");
        if device_id.is_empty() {
            return malformed(
                ErrorCode::MissingFields,
                "device object missing required field: id",
                raw,
                received_at,
                source,
            );
        }

        let Some(state_str) =
            get_path(device, &["services", "rtk", "connectionStatus"]).and_then(Value::as_str)
        else {
            return malformed(
                ErrorCode::MissingFields,
                "device object missing required field: services.rtk.connectionStatus",
                raw,
                received_at,
                source,
            );
        };

        let current_state: DeviceState = match state_str.parse() {
            Ok(state) => state,
            Err(unknown) => {
                return malformed(
                    ErrorCode::UnknownState,
                    unknown.to_string(),
                    raw,
                    received_at,
                    source,
                )
            }
        };

        let previous_state = self
            .last_state_by_device
            .insert(device_id.to_string(), current_state);

        let position = get_path(device, &["lastPosition", "position", "llaDec"]);

        Record::StateChange(StateChangeRecord {
            timestamp: get_path(device, &["lastPosition", "timestamp"])
                .and_then(Value::as_str)
                .map(str::to_string),
            received_at,
            device_id: device_id.to_string(),
            device_label: device.get("label").and_then(Value::as_str).map(str::to_string),
            previous_state,
            current_state,
            latitude: position.and_then(|p| p.get("lat")).and_then(Value::as_f64),
            longitude: position.and_then(|p| p.get("lon")).and_then(Value::as_f64),
            altitude_m: position.and_then(|p| p.get("alt")).and_then(Value::as_f64),
            rtk_enabled: get_path(device, &["services", "rtk", "enabled"]).and_then(Value::as_bool),
            tags: device.get("tags").and_then(Value::as_array).map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(Tag {
                            key: item.get("key")?.as_str()?.to_string(),
                            value: item.get("value")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            }),
            source,
        })
    }
}

/// Walk nested objects, `None` on any missing or non-object step.
fn get_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Flatten a graphql `error` payload into a diagnostic string.
fn server_error_message(payload: Option<&Value>) -> String {
    let Some(payload) = payload else {
        return "server error frame without payload".to_string();
    };
    if let Some(errors) = payload.as_array() {
        let messages: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(Value::as_str))
            .collect();
        if !messages.is_empty() {
            return format!("server error: {}", messages.join("; "));
        }
    }
    format!("server error: {payload}")
}

fn malformed(
    code: ErrorCode,
    message: impl Into<String>,
    raw: &RawMessage,
    received_at: String,
    source: SourceInfo,
) -> Record {
    Record::Malformed(MalformedRecord {
        timestamp: received_at.clone(),
        received_at,
        error: ErrorDetail::new(code, message, &raw.payload),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn raw(payload: &str) -> RawMessage {
        RawMessage::new(Bytes::from(payload.to_string()), Arc::from("sub-1"))
    }

    fn next_frame(device: serde_json::Value) -> String {
        serde_json::json!({
            "id": "sub-1",
            "type": "next",
            "payload": { "data": { "devices": device } },
        })
        .to_string()
    }

    fn full_device(state: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "dev-abc-123",
            "label": "Fleet-Truck-042",
            "tags": [
                {"key": "fleet", "value": "west-coast"},
                {"key": "tier", "value": "gold"},
            ],
            "lastPosition": {
                "position": { "llaDec": {"lat": 37.7749, "lon": -122.4194, "alt": 10.5} },
                "timestamp": "2025-02-15T18:32:01.123Z",
            },
            "services": { "rtk": {"enabled": true, "connectionStatus": state} },
        })
    }

    fn expect_state_change(record: Record) -> StateChangeRecord {
        match record {
            Record::StateChange(r) => r,
            Record::Malformed(m) => panic!("expected state_change, got malformed: {m:?}"),
        }
    }

    fn expect_malformed(record: Record) -> MalformedRecord {
        match record {
            Record::Malformed(m) => m,
            Record::StateChange(r) => panic!("expected malformed, got state_change: {r:?}"),
        }
    }

    #[test]
    fn maps_a_full_device_event() {
        let mut n = Normalizer::new("writer-01");
        let record = expect_state_change(n.normalize(&raw(&next_frame(full_device("CONNECTED")))));

        assert_eq!(record.device_id, "dev-abc-123");
        assert_eq!(record.device_label.as_deref(), Some("Fleet-Truck-042"));
        assert_eq!(record.current_state, DeviceState::Connected);
        assert_eq!(record.previous_state, None);
        assert_eq!(record.latitude, Some(37.7749));
        assert_eq!(record.longitude, Some(-122.4194));
        assert_eq!(record.altitude_m, Some(10.5));
        assert_eq!(record.rtk_enabled, Some(true));
        assert_eq!(record.timestamp.as_deref(), Some("2025-02-15T18:32:01.123Z"));
        assert_eq!(record.source.instance_id, "writer-01");
        assert_eq!(record.source.subscription_id.as_deref(), Some("sub-1"));

        let tags = record.tags.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].key, "fleet");
        assert_eq!(tags[1].key, "tier");
    }

    #[test]
    fn previous_state_chains_within_a_session() {
        let mut n = Normalizer::new("w");
        let states = ["CONNECTED", "DISCONNECTED", "CONNECTED"];
        let previous: Vec<Option<DeviceState>> = states
            .iter()
            .map(|s| expect_state_change(n.normalize(&raw(&next_frame(full_device(s))))).previous_state)
            .collect();
        assert_eq!(
            previous,
            vec![
                None,
                Some(DeviceState::Connected),
                Some(DeviceState::Disconnected),
            ]
        );
    }

    #[test]
    fn previous_state_is_per_device() {
        let mut n = Normalizer::new("w");
        let mut dev_a = full_device("CONNECTED");
        dev_a["id"] = "dev-a".into();
        let mut dev_b = full_device("ERROR");
        dev_b["id"] = "dev-b".into();

        n.normalize(&raw(&next_frame(dev_a.clone())));
        let b = expect_state_change(n.normalize(&raw(&next_frame(dev_b))));
        assert_eq!(b.previous_state, None);

        dev_a["services"]["rtk"]["connectionStatus"] = "DISCONNECTED".into();
        let a2 = expect_state_change(n.normalize(&raw(&next_frame(dev_a))));
        assert_eq!(a2.previous_state, Some(DeviceState::Connected));
    }

    #[test]
    fn session_boundary_resets_previous_state() {
        let mut n = Normalizer::new("w");
        n.begin_session();
        n.normalize(&raw(&next_frame(full_device("CONNECTED"))));
        assert_eq!(n.tracked_devices(), 1);

        n.end_session();
        n.begin_session();
        let record = expect_state_change(n.normalize(&raw(&next_frame(full_device("CONNECTED")))));
        assert_eq!(record.previous_state, None);
    }

    #[test]
    fn broken_json_is_parse_error() {
        let mut n = Normalizer::new("w");
        let m = expect_malformed(n.normalize(&raw("{broken json")));
        assert_eq!(m.error.code, ErrorCode::ParseError);
        assert_eq!(m.error.raw_payload, "{broken json");
        assert!(!m.error.raw_payload_truncated);
        assert_eq!(m.source.subscription_id.as_deref(), Some("sub-1"));
    }

    #[test]
    fn server_error_frame_is_parse_error_with_message() {
        let mut n = Normalizer::new("w");
        let frame = serde_json::json!({
            "id": "sub-1",
            "type": "error",
            "payload": [{"message": "rate limited"}, {"message": "try later"}],
        })
        .to_string();
        let m = expect_malformed(n.normalize(&raw(&frame)));
        assert_eq!(m.error.code, ErrorCode::ParseError);
        assert!(m.error.message.contains("rate limited"));
        assert!(m.error.message.contains("try later"));
    }

    #[test]
    fn missing_devices_path_is_schema_mismatch() {
        let mut n = Normalizer::new("w");
        let frame = serde_json::json!({
            "type": "next",
            "payload": { "data": {} },
        })
        .to_string();
        let m = expect_malformed(n.normalize(&raw(&frame)));
        assert_eq!(m.error.code, ErrorCode::SchemaMismatch);
        assert!(m.error.message.contains("payload.data.devices"));
    }

    #[test]
    fn non_object_devices_is_schema_mismatch() {
        let mut n = Normalizer::new("w");
        let frame = serde_json::json!({
            "type": "next",
            "payload": { "data": { "devices": [1, 2, 3] } },
        })
        .to_string();
        let m = expect_malformed(n.normalize(&raw(&frame)));
        assert_eq!(m.error.code, ErrorCode::SchemaMismatch);
    }

    #[test]
    fn missing_device_id_is_missing_fields() {
        let mut n = Normalizer::new("w");
        let mut device = full_device("CONNECTED");
        device.as_object_mut().unwrap().remove("id");
        let m = expect_malformed(n.normalize(&raw(&next_frame(device))));
        assert_eq!(m.error.code, ErrorCode::MissingFields);
        assert!(m.error.message.contains("id"));
    }

    #[test]
    fn missing_state_is_missing_fields() {
        let mut n = Normalizer::new("w");
        let frame = next_frame(serde_json::json!({"id": "dev-1", "label": "L"}));
        let m = expect_malformed(n.normalize(&raw(&frame)));
        assert_eq!(m.error.code, ErrorCode::MissingFields);
        assert!(m.error.message.contains("connectionStatus"));
    }

    #[test]
    fn unknown_state_preserves_raw_value() {
        let mut n = Normalizer::new("w");
        let m = expect_malformed(n.normalize(&raw(&next_frame(full_device("DEGRADED")))));
        assert_eq!(m.error.code, ErrorCode::UnknownState);
        assert!(m.error.message.contains("DEGRADED"));
        // The rejected event must not poison previous-state tracking.
        assert_eq!(n.tracked_devices(), 0);
    }

    #[test]
    fn lowercase_state_is_unknown() {
        let mut n = Normalizer::new("w");
        let m = expect_malformed(n.normalize(&raw(&next_frame(full_device("connected")))));
        assert_eq!(m.error.code, ErrorCode::UnknownState);
    }

    #[test]
    fn optional_fields_default_to_null() {
        let mut n = Normalizer::new("w");
        let frame = next_frame(serde_json::json!({
            "id": "dev-min",
            "services": { "rtk": {"connectionStatus": "CONNECTED"} },
        }));
        let record = expect_state_change(n.normalize(&raw(&frame)));
        assert_eq!(record.device_label, None);
        assert_eq!(record.latitude, None);
        assert_eq!(record.rtk_enabled, None);
        assert_eq!(record.tags, None);
        assert_eq!(record.timestamp, None);
    }

    #[test]
    fn integer_coordinates_coerce_to_float() {
        let mut n = Normalizer::new("w");
        let mut device = full_device("CONNECTED");
        device["lastPosition"]["position"]["llaDec"]["lat"] = 37.into();
        let record = expect_state_change(n.normalize(&raw(&next_frame(device))));
        assert_eq!(record.latitude, Some(37.0));
    }

    #[test]
    fn oversized_payload_is_truncated_in_malformed() {
        let mut n = Normalizer::new("w");
        let big = format!("{{\"garbage\": \"{}\"", "x".repeat(8000));
        let m = expect_malformed(n.normalize(&raw(&big)));
        assert_eq!(m.error.code, ErrorCode::ParseError);
        assert!(m.error.raw_payload_truncated);
        assert_eq!(m.error.raw_payload.len(), polaris_core::MAX_RAW_PAYLOAD_BYTES);
    }

    #[test]
    fn malformed_timestamps_use_ingest_instant() {
        let mut n = Normalizer::new("w");
        let m = expect_malformed(n.normalize(&raw("not json")));
        assert_eq!(m.timestamp, m.received_at);
    }
}
