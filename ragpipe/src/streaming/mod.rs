//! Memory-aware backpressure and streaming events.
//!
//! A [`BackpressureController`] is the single piece of state shared by a
//! producer and its consumer. [`backpressured_channel`] wires one into a lazy
//! pipe whose receiving half is a `futures::Stream`.

mod channel;
mod controller;
mod events;

pub use channel::{backpressured_channel, BackpressuredReceiver, BackpressuredSender};
pub use controller::{
    BackpressureConfig, BackpressureController, BackpressureMetrics, BackpressureStatus,
    MemoryStatus,
};
pub use events::{IngestEvent, IngestProgress, QueryEvent};
