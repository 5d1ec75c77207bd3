//! Observability utilities.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to binaries and tests via [`init_tracing`]. Scheduler lifecycle events can
//! be forwarded to `tracing` with [`crate::events::LoggingEventSink`].

mod logging;

pub use logging::{init_tracing, LogFormat, DEFAULT_FILTER};
