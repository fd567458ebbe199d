//! Output record model.
//!
//! Every frame the transport hands downstream becomes exactly one [`Record`]:
//! either a [`StateChangeRecord`] or a [`MalformedRecord`]. The two variants
//! share the NDJSON output stream; `event_type` is the discriminator tag so
//! tailers can route on a single field.
//!
//! Serialization is plain `serde_json` — one object per line, no pretty
//! printing, a single trailing `\n` appended by [`Record::to_ndjson`].

use crate::state::DeviceState;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Maximum bytes of original payload preserved in a malformed record.
pub const MAX_RAW_PAYLOAD_BYTES: usize = 4096;

/// Provenance stamped on every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceInfo {
    /// Configured identity of this writer process.
    pub instance_id: String,
    /// Client-generated id of the subscription session the frame arrived on.
    pub subscription_id: Option<String>,
}

/// One `{key, value}` pair from the device's tag list, server order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag name.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// A device RTK connection-status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangeRecord {
    /// Server-provided fix time (passed through verbatim).
    pub timestamp: Option<String>,
    /// Local wall clock at ingest, UTC, millisecond precision.
    pub received_at: String,
    /// Unique device key.
    pub device_id: String,
    /// Human-readable device label, when the server provides one.
    pub device_label: Option<String>,
    /// Last state seen for this device within the session; `None` on first
    /// sight.
    pub previous_state: Option<DeviceState>,
    /// State reported by this event.
    pub current_state: DeviceState,
    /// Degrees.
    pub latitude: Option<f64>,
    /// Degrees.
    pub longitude: Option<f64>,
    /// Meters.
    pub altitude_m: Option<f64>,
    /// Whether RTK corrections are enabled on the device.
    pub rtk_enabled: Option<bool>,
    /// Device tags, server order preserved.
    pub tags: Option<Vec<Tag>>,
    /// Provenance.
    pub source: SourceInfo,
}

/// Why a frame failed classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Payload was not valid JSON, or the server sent an `error` frame.
    ParseError,
    /// A required node of the subscription payload shape was absent.
    SchemaMismatch,
    /// `device.id` or `currentState` missing.
    MissingFields,
    /// `currentState` outside the documented enum.
    UnknownState,
}

impl ErrorCode {
    /// Wire representation, as written into `error.code`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse_error",
            ErrorCode::SchemaMismatch => "schema_mismatch",
            ErrorCode::MissingFields => "missing_fields",
            ErrorCode::UnknownState => "unknown_state",
        }
    }
}

/// Structured error block of a malformed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Typed failure class.
    pub code: ErrorCode,
    /// Free-text diagnostic.
    pub message: String,
    /// UTF-8-repaired prefix of the original payload.
    pub raw_payload: String,
    /// True when `raw_payload` was cut at [`MAX_RAW_PAYLOAD_BYTES`].
    pub raw_payload_truncated: bool,
}

impl ErrorDetail {
    /// Build an error block, repairing and truncating the raw payload.
    pub fn new(code: ErrorCode, message: impl Into<String>, raw: &[u8]) -> Self {
        let (raw_payload, raw_payload_truncated) = repair_and_truncate(raw);
        Self {
            code,
            message: message.into(),
            raw_payload,
            raw_payload_truncated,
        }
    }
}

/// Wrapper for frames that fail classification. Never silently dropped —
/// these traverse the filter and writer like any other record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRecord {
    /// Set to the ingest instant — there is no trustworthy server time here.
    pub timestamp: String,
    /// Local wall clock at ingest.
    pub received_at: String,
    /// What went wrong, with the offending payload attached.
    pub error: ErrorDetail,
    /// Provenance.
    pub source: SourceInfo,
}

/// The tagged sum written to the output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum Record {
    /// A well-formed device state transition.
    #[serde(rename = "state_change")]
    StateChange(StateChangeRecord),
    /// A frame that failed classification.
    #[serde(rename = "malformed")]
    Malformed(MalformedRecord),
}

impl Record {
    /// Serialize to a single NDJSON line, newline-terminated.
    pub fn to_ndjson(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Whether this is a `malformed` record.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Record::Malformed(_))
    }

    /// Device id for state-change records; malformed records have none.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Record::StateChange(r) => Some(&r.device_id),
            Record::Malformed(_) => None,
        }
    }
}

/// Format an instant the way every record timestamp is written: RFC 3339,
/// UTC, millisecond precision, `Z` suffix.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Repair invalid UTF-8 and cap the result at [`MAX_RAW_PAYLOAD_BYTES`],
/// never splitting a character.
fn repair_and_truncate(raw: &[u8]) -> (String, bool) {
    let repaired = String::from_utf8_lossy(raw);
    if repaired.len() <= MAX_RAW_PAYLOAD_BYTES {
        return (repaired.into_owned(), false);
    }
    let mut end = MAX_RAW_PAYLOAD_BYTES;
    while !repaired.is_char_boundary(end) {
        end -= 1;
    }
    (repaired[..end].to_string(), true)
}
