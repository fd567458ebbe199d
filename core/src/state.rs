//! Device connection states as reported by the Polaris subscription.
//!
//! The wire values are a closed, case-sensitive set. Anything outside it is
//! rejected at parse time so that an unexpected value surfaces as a
//! `malformed` record instead of leaking a new string into downstream
//! consumers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// RTK connection status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum DeviceState {
    Connected,
    Disconnected,
    Connecting,
    Reconnecting,
    Error,
    Undefined,
}

impl DeviceState {
    /// Canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Connected => "CONNECTED",
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::Reconnecting => "RECONNECTING",
            DeviceState::Error => "ERROR",
            DeviceState::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state value outside the documented set. Carries the raw string so the
/// resulting `malformed` record can preserve it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device state: {0:?}")]
pub struct UnknownState(pub String);

impl FromStr for DeviceState {
    type Err = UnknownState;

    /// Case-sensitive match against the documented set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(DeviceState::Connected),
            "DISCONNECTED" => Ok(DeviceState::Disconnected),
            "CONNECTING" => Ok(DeviceState::Connecting),
            "RECONNECTING" => Ok(DeviceState::Reconnecting),
            "ERROR" => Ok(DeviceState::Error),
            "UNDEFINED" => Ok(DeviceState::Undefined),
            other => Err(UnknownState(other.to_string())),
        }
    }
}
