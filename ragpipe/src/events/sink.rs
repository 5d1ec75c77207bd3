//! Event sink trait and implementations.

use super::SchedulerEvent;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

/// Receives lifecycle events from a scheduler.
///
/// Sinks are registered on a single [`crate::scheduler::Scheduler`]; there is
/// no process-wide bus. Implementations must not block and must not panic.
pub trait EventSink: Send + Sync {
    /// Delivers an event.
    fn try_emit(&self, event: &SchedulerEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: &SchedulerEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &SchedulerEvent) {
        let event_type = event.event_type();
        if event.is_failure() {
            warn!(event_type, event = ?event, "Event: {}", event_type);
        } else if self.level == Level::DEBUG {
            debug!(event_type, event = ?event, "Event: {}", event_type);
        } else {
            info!(event_type, event = ?event, "Event: {}", event_type);
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<SchedulerEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the event type names in arrival order.
    #[must_use]
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(SchedulerEvent::event_type).collect()
    }

    /// Returns events whose type starts with a prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<SchedulerEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &SchedulerEvent) {
        self.events.write().push(event.clone());
    }
}
