//! polaris-core - shared types for the Polaris device subclient
//!
//! This crate holds the types that cross component boundaries:
//!
//! - [`RawMessage`] - an opaque frame off the transport, stamped at ingest
//! - [`Record`] - the tagged output sum (`state_change` | `malformed`)
//! - [`DeviceState`] - the closed RTK connection-status enum
//! - [`SubclientError`] - the control-plane error type
//!
//! The pipeline crate depends on these; keeping them here keeps the record
//! schema reviewable in one place, separate from connection and writer
//! machinery.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Control-plane error type.
pub mod error;
/// Raw transport message.
pub mod message;
/// Output record model.
pub mod record;
/// Device connection-state enum.
pub mod state;

pub use error::{Result, SubclientError};
pub use message::RawMessage;
pub use record::{
    format_timestamp, ErrorCode, ErrorDetail, MalformedRecord, Record, SourceInfo,
    StateChangeRecord, Tag, MAX_RAW_PAYLOAD_BYTES,
};
pub use state::{DeviceState, UnknownState};
