//! Typed scheduler lifecycle events and the sinks that receive them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;
use uuid::Uuid;

/// A lifecycle event emitted by a scheduler run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A run began.
    RunStarted {
        /// The run id.
        run_id: Uuid,
        /// Number of nodes in the graph.
        node_count: usize,
    },
    /// A node attempt began.
    NodeStarted {
        /// The run id.
        run_id: Uuid,
        /// The node.
        node_id: String,
        /// 1-indexed attempt number.
        attempt: usize,
    },
    /// A node attempt failed and will be retried.
    NodeRetrying {
        /// The run id.
        run_id: Uuid,
        /// The node.
        node_id: String,
        /// 1-indexed retry number.
        retry: usize,
        /// Backoff before the retry.
        delay_ms: u64,
        /// The attempt's error message.
        error: String,
    },
    /// A node succeeded.
    NodeSucceeded {
        /// The run id.
        run_id: Uuid,
        /// The node.
        node_id: String,
        /// Wall-clock duration across all attempts.
        duration_ms: f64,
    },
    /// A node failed terminally.
    NodeFailed {
        /// The run id.
        run_id: Uuid,
        /// The node.
        node_id: String,
        /// The error message.
        error: String,
        /// Whether the failure was tolerated.
        tolerated: bool,
    },
    /// A node never ran.
    NodeSkipped {
        /// The run id.
        run_id: Uuid,
        /// The node.
        node_id: String,
        /// Why it was skipped.
        reason: String,
    },
    /// A run finished, successfully or not.
    RunCompleted {
        /// The run id.
        run_id: Uuid,
        /// Whether the run succeeded.
        success: bool,
        /// Total duration.
        duration_ms: f64,
    },
}

impl SchedulerEvent {
    /// Returns the dotted event type name.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::NodeStarted { .. } => "node.started",
            Self::NodeRetrying { .. } => "node.retrying",
            Self::NodeSucceeded { .. } => "node.succeeded",
            Self::NodeFailed { .. } => "node.failed",
            Self::NodeSkipped { .. } => "node.skipped",
            Self::RunCompleted { .. } => "run.completed",
        }
    }

    /// Returns the node id for node-scoped events.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::NodeRetrying { node_id, .. }
            | Self::NodeSucceeded { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeSkipped { node_id, .. } => Some(node_id),
            Self::RunStarted { .. } | Self::RunCompleted { .. } => None,
        }
    }

    /// Returns true for failure events.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::NodeFailed { .. } | Self::RunCompleted { success: false, .. }
        )
    }
}
