//! Error types for the ragpipe engine.
//!
//! Every public operation returns [`PipelineError`]. Structural variants
//! (`Validation`, `CycleDetected`, `MissingDependency`, `UnknownNode`,
//! `StageContract`) describe configuration bugs and are never retried;
//! transient variants are retried by [`crate::retry::with_retry`].

use crate::graph::CycleReport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// The main error type for ragpipe operations.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Malformed input to a public call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The graph contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// The graph references a node that was never declared.
    #[error("{0}")]
    MissingDependency(#[from] MissingDependencyError),

    /// An edge references a node that does not exist.
    #[error("Unknown node: '{node_id}'")]
    UnknownNode {
        /// The missing node id.
        node_id: String,
    },

    /// A node's runner failed.
    #[error("Node '{node_id}' failed: {source}")]
    NodeExecution {
        /// The failing node.
        node_id: String,
        /// The original cause.
        #[source]
        source: Box<PipelineError>,
    },

    /// A node or scheduler deadline was exceeded.
    #[error("Timed out after {}ms: {context}", .elapsed.as_millis())]
    Timeout {
        /// What timed out.
        context: String,
        /// The budget that was exceeded.
        elapsed: Duration,
    },

    /// A collaborator returned a structurally invalid result.
    #[error("{0}")]
    StageContract(#[from] StageContractError),

    /// Retryable network or storage failure.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A failure reported by a remote service.
    #[error("Upstream error (status {status}): {message}")]
    Upstream {
        /// Status code reported by the service.
        status: u16,
        /// The service message.
        message: String,
        /// Whether the response carried a rate-limit reset hint.
        rate_limit_reset: bool,
    },

    /// A collaborator cannot continue at all (e.g. storage offline).
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A non-transient collaborator failure.
    #[error("{0}")]
    Collaborator(String),

    /// The operation was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A plugin lookup failed.
    #[error("Unknown {kind} plugin: '{name}'")]
    UnknownPlugin {
        /// The plugin kind.
        kind: String,
        /// The requested name.
        name: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A failure wrapped by a public entry point.
    #[error("{action} failed: {source}")]
    Stage {
        /// The entry point (e.g. "Ingestion").
        action: String,
        /// The original error.
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an unknown node error.
    #[must_use]
    pub fn unknown_node(node_id: impl Into<String>) -> Self {
        Self::UnknownNode {
            node_id: node_id.into(),
        }
    }

    /// Wraps an error with the node that raised it.
    #[must_use]
    pub fn node_execution(node_id: impl Into<String>, source: Self) -> Self {
        Self::NodeExecution {
            node_id: node_id.into(),
            source: Box::new(source),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(context: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            elapsed,
        }
    }

    /// Creates an upstream error.
    #[must_use]
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
            rate_limit_reset: false,
        }
    }

    /// Creates a collaborator error.
    #[must_use]
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator(message.into())
    }

    /// Wraps this error with an action prefix, keeping the original message.
    #[must_use]
    pub fn with_action(self, action: impl Into<String>) -> Self {
        Self::Stage {
            action: action.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error, unwrapping action and node wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } | Self::NodeExecution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the node id attached to this error, if any.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeExecution { node_id, .. } => Some(node_id),
            Self::Stage { source, .. } => source.node_id(),
            _ => None,
        }
    }

    /// Returns true if the failure is worth retrying.
    ///
    /// Timeouts, transient I/O, 5xx and 429 responses, 403 responses carrying
    /// a rate-limit reset, and connection resets are transient. Everything else
    /// fails fast.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::TransientIo(_) => true,
            Self::Upstream {
                status,
                rate_limit_reset,
                message,
            } => {
                (500..600).contains(status)
                    || *status == 429
                    || (*status == 403 && *rate_limit_reset)
                    || message.to_ascii_lowercase().contains("connection reset")
            }
            Self::Collaborator(message) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("econnreset") || lower.contains("connection reset")
            }
            Self::NodeExecution { source, .. } | Self::Stage { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Returns true for configuration and contract errors, which are never retried.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::CycleDetected(_)
            | Self::MissingDependency(_)
            | Self::UnknownNode { .. }
            | Self::StageContract(_)
            | Self::UnknownPlugin { .. }
            | Self::Config(_)
            | Self::Cancelled(_) => true,
            Self::NodeExecution { source, .. } | Self::Stage { source, .. } => {
                source.is_structural()
            }
            _ => false,
        }
    }

    /// Returns true if the failure means the pipeline cannot continue at all.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Self::Unavailable(_) | Self::Cancelled(_))
    }

    /// Returns a stable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::CycleDetected(_) => "CycleDetectedError",
            Self::MissingDependency(_) => "MissingDependencyError",
            Self::UnknownNode { .. } => "UnknownNodeError",
            Self::NodeExecution { .. } => "NodeExecutionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::StageContract(_) => "StageContractError",
            Self::TransientIo(_) => "TransientIOError",
            Self::Upstream { .. } => "UpstreamError",
            Self::Unavailable(_) => "UnavailableError",
            Self::Collaborator(_) => "CollaboratorError",
            Self::Cancelled(_) => "CancelledError",
            Self::UnknownPlugin { .. } => "UnknownPluginError",
            Self::Config(_) => "ConfigError",
            Self::Stage { .. } => "StageError",
        }
    }

    /// Returns structured diagnostics for structural errors.
    #[must_use]
    pub fn error_info(&self) -> Option<ContractErrorInfo> {
        match self.root() {
            Self::CycleDetected(err) => Some(err.error_info.clone()),
            Self::MissingDependency(err) => Some(err.error_info()),
            Self::StageContract(err) => Some(err.error_info()),
            Self::UnknownNode { node_id } => Some(
                ContractErrorInfo::new("GRAPH-001-UNKNOWN_NODE", format!("Node '{node_id}' does not exist"))
                    .with_fix_hint("Add the node before connecting it."),
            ),
            _ => None,
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "GRAPH-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in graph: {}", cycle.join(" -> "))]
pub struct CycleDetectedError {
    /// The node ids forming the cycle; first and last are the same node.
    pub cycle: CycleReport,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle: CycleReport) -> Self {
        let info = ContractErrorInfo::new(
            "GRAPH-004-CYCLE",
            format!("Graph contains a dependency cycle: {}", cycle.join(" -> ")),
        )
        .with_fix_hint("Remove one of the edges in the cycle to break it.");

        Self {
            cycle,
            error_info: info,
        }
    }
}

/// Error raised when a node depends on, or requires, a node that is absent.
#[derive(Debug, Clone, Error)]
#[error("Node '{node}' depends on missing node '{dependency}'")]
pub struct MissingDependencyError {
    /// The declaring node, or `"<graph>"` for graph-level requirements.
    pub node: String,
    /// The missing node id.
    pub dependency: String,
}

impl MissingDependencyError {
    /// Creates a new missing dependency error.
    #[must_use]
    pub fn new(node: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            dependency: dependency.into(),
        }
    }

    /// Returns structured diagnostics.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new(
            "GRAPH-004-MISSING_DEP",
            format!("Dependency '{}' not found", self.dependency),
        )
        .with_fix_hint("Check for typos in node ids and add the dependency to the graph.")
        .with_context_entry("node", &self.node)
    }
}

/// Error raised when a collaborator returns a structurally invalid result.
#[derive(Debug, Clone, Error)]
#[error("{stage} returned an invalid result: expected {expected}, got {actual}")]
pub struct StageContractError {
    /// The stage whose collaborator misbehaved (e.g. "embed").
    pub stage: String,
    /// The expected shape.
    pub expected: String,
    /// The observed shape.
    pub actual: String,
}

impl StageContractError {
    /// Creates a new stage contract error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Returns structured diagnostics.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        ContractErrorInfo::new("STAGE-002-CONTRACT", self.to_string())
            .with_context_entry("stage", &self.stage)
            .with_context_entry("expected", &self.expected)
            .with_context_entry("actual", &self.actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.error_info.code, "GRAPH-004-CYCLE");
    }

    #[test]
    fn test_with_action_preserves_message() {
        let err = PipelineError::validation("prompt must not be empty").with_action("Query");

        assert_eq!(
            err.to_string(),
            "Query failed: Validation error: prompt must not be empty"
        );
        assert!(matches!(err.root(), PipelineError::Validation(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::TransientIo("socket".into()).is_transient());
        assert!(PipelineError::timeout("node", Duration::from_millis(5)).is_transient());
        assert!(PipelineError::upstream(503, "busy").is_transient());
        assert!(PipelineError::upstream(429, "slow down").is_transient());
        assert!(!PipelineError::upstream(403, "forbidden").is_transient());
        assert!(PipelineError::Upstream {
            status: 403,
            message: "rate limited".into(),
            rate_limit_reset: true,
        }
        .is_transient());
        assert!(PipelineError::collaborator("read ECONNRESET").is_transient());
        assert!(!PipelineError::upstream(400, "bad request").is_transient());
        assert!(!PipelineError::validation("x").is_transient());
        assert!(!PipelineError::from(StageContractError::new("embed", "2 vectors", "1 vector"))
            .is_transient());
    }

    #[test]
    fn test_node_id_and_root() {
        let err = PipelineError::node_execution("b", PipelineError::collaborator("boom"))
            .with_action("Execution");

        assert_eq!(err.node_id(), Some("b"));
        assert!(matches!(err.root(), PipelineError::Collaborator(_)));
        assert_eq!(err.root().kind(), "CollaboratorError");
    }

    #[test]
    fn test_structural_classification() {
        assert!(PipelineError::validation("empty").is_structural());
        assert!(PipelineError::unknown_node("x").is_structural());
        assert!(!PipelineError::collaborator("boom").is_structural());
        assert!(!PipelineError::TransientIo("blip".into()).is_structural());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Unavailable("store offline".into())
            .with_action("Ingestion")
            .is_fatal());
        assert!(!PipelineError::TransientIo("blip".into()).is_fatal());
    }

    #[test]
    fn test_error_info_for_structural_errors() {
        let err = PipelineError::from(MissingDependencyError::new("b", "a"));
        let info = err.error_info().unwrap();
        assert_eq!(info.code, "GRAPH-004-MISSING_DEP");
        assert_eq!(info.context.get("node"), Some(&"b".to_string()));

        assert!(PipelineError::TransientIo("x".into()).error_info().is_none());
    }
}
