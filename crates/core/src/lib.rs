//! Core contracts for the Pulse observability backbone: the canonical
//! event shape, configuration, error types, self-healing envelopes, and
//! the port traits every other crate binds against.

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod ports;
pub mod schedule;
pub mod telemetry;

pub use envelope::{flow_trace_key, HealCompletion, HealRequest, HealStatus};
pub use error::{PulseError, PulseResult};
pub use event::{dedup_key, EventDocument, EventInput, Level, SystemEvent};
