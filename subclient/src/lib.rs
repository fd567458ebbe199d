//! polaris-subclient - Polaris device state changes to NDJSON files
//!
//! A long-running bridge between the Polaris GraphQL subscription endpoint
//! and a local directory of NDJSON files meant to be tailed by an external
//! log collector. Four stages in a straight line:
//!
//! ```text
//! Connection ──► Normalizer ──► Filter ──► Sink
//! (WebSocket)    (frame→record) (keep/drop) (rotating files | stdout)
//! ```
//!
//! The connection task feeds a bounded queue; back-pressure propagates to
//! the server through the TCP window. Every frame the transport hands over
//! becomes exactly one output record — failures become `malformed` records
//! rather than log lines or silence.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backoff;
pub mod cli;
pub mod config;
pub mod connection;
pub mod filter;
pub mod logging;
pub mod normalize;
pub mod pipeline;
pub mod redact;
pub mod rolling;
pub mod run;
pub mod secrets;
pub mod sink;

pub use backoff::BackoffConfig;
pub use cli::{Cli, LogLevel, OutputMode};
pub use config::AppConfig;
pub use connection::{ConnectionManager, SessionEvent, DEVICES_SUBSCRIPTION};
pub use filter::EventFilter;
pub use normalize::Normalizer;
pub use pipeline::{Pipeline, PipelineSummary, DRY_RUN_RECORD_LIMIT, RAW_QUEUE_CAPACITY};
pub use redact::Redactor;
pub use sink::{FileSink, RecordSink, StdoutSink};
