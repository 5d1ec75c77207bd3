//! Per-run execution state, options, and results.

use crate::cancellation::CancellationToken;
use crate::errors::PipelineError;
use crate::retry::Sleeper;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// The execution status of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// Currently running.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed terminally.
    Failed,
    /// Never ran.
    Skipped,
}

impl NodeStatus {
    /// Returns true for `Succeeded`, `Failed`, and `Skipped`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of a single node in a run.
#[derive(Debug, Clone, Default)]
pub struct NodeOutcome {
    /// Final status.
    pub status: NodeStatus,
    /// The node's result, if it succeeded.
    pub output: Option<Value>,
    /// The terminal error, if it failed.
    pub error: Option<PipelineError>,
    /// Number of attempts made.
    pub attempts: usize,
    /// Wall-clock time across all attempts.
    pub duration_ms: f64,
    /// Whether a failure was tolerated (optional node).
    pub tolerated: bool,
    /// Why the node was skipped.
    pub skip_reason: Option<String>,
}

/// Options for a single [`crate::scheduler::Scheduler::execute`] call.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Per-attempt deadline for every node.
    pub node_timeout: Option<Duration>,
    /// Deadline for the whole run.
    pub timeout: Option<Duration>,
    /// Maximum nodes running at once.
    pub concurrency: usize,
    /// Keep running independent branches after a failure.
    pub continue_on_error: bool,
    /// Ids that must succeed for the run to succeed.
    pub required_nodes: Vec<String>,
    /// Retry nodes that declare no retries of their own.
    pub retry_failed_nodes: bool,
    /// Retries applied when `retry_failed_nodes` is set.
    pub max_retries: usize,
    /// First retry delay for nodes without their own delay.
    pub retry_base_delay: Duration,
    /// Replaces the tokio sleeper used between retries.
    pub sleeper: Option<Arc<dyn Sleeper>>,
    /// External cancellation.
    pub cancellation: Option<Arc<CancellationToken>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            node_timeout: None,
            timeout: None,
            concurrency: 3,
            continue_on_error: false,
            required_nodes: Vec::new(),
            retry_failed_nodes: false,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(100),
            sleeper: None,
            cancellation: None,
        }
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("node_timeout", &self.node_timeout)
            .field("timeout", &self.timeout)
            .field("concurrency", &self.concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .field("required_nodes", &self.required_nodes)
            .field("retry_failed_nodes", &self.retry_failed_nodes)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl ExecuteOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-node timeout.
    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    /// Sets the run deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Enables or disables continue-on-error.
    #[must_use]
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Alias for [`Self::continue_on_error`].
    #[must_use]
    pub fn graceful_degradation(self, enabled: bool) -> Self {
        self.continue_on_error(enabled)
    }

    /// Adds a required node.
    #[must_use]
    pub fn require(mut self, id: impl Into<String>) -> Self {
        self.required_nodes.push(id.into());
        self
    }

    /// Retries every node up to `max_retries` times.
    #[must_use]
    pub fn retry_failed_nodes(mut self, max_retries: usize) -> Self {
        self.retry_failed_nodes = true;
        self.max_retries = max_retries;
        self
    }

    /// Sets the default first retry delay.
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Replaces the retry sleeper.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Attaches a cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Ephemeral state of one run. Never shared between runs.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    seed: Value,
    options: ExecuteOptions,
    outcomes: HashMap<String, NodeOutcome>,
}

impl ExecutionContext {
    /// Creates a context with every node pending.
    #[must_use]
    pub fn new<'a>(
        seed: Value,
        options: ExecuteOptions,
        node_ids: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            seed,
            options,
            outcomes: node_ids
                .into_iter()
                .map(|id| (id.clone(), NodeOutcome::default()))
                .collect(),
        }
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the wall-clock start of the run.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the seed value.
    #[must_use]
    pub fn seed(&self) -> &Value {
        &self.seed
    }

    /// Returns the effective options.
    #[must_use]
    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    /// Returns a node's current status.
    #[must_use]
    pub fn status(&self, id: &str) -> NodeStatus {
        self.outcomes.get(id).map(|o| o.status).unwrap_or_default()
    }

    /// Returns the value a downstream node receives from `id`.
    ///
    /// Tolerated failures and missing outputs produce `null`.
    #[must_use]
    pub fn upstream_value(&self, id: &str) -> Value {
        self.outcomes
            .get(id)
            .and_then(|o| o.output.clone())
            .unwrap_or(Value::Null)
    }

    /// Returns a node's outcome so far.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(id)
    }

    pub(crate) fn outcome_mut(&mut self, id: &str) -> Option<&mut NodeOutcome> {
        self.outcomes.get_mut(id)
    }

    pub(crate) fn mark_running(&mut self, id: &str) {
        if let Some(outcome) = self.outcomes.get_mut(id) {
            outcome.status = NodeStatus::Running;
        }
    }

    pub(crate) fn mark_skipped(&mut self, id: &str, reason: impl Into<String>) -> bool {
        match self.outcomes.get_mut(id) {
            Some(outcome) if !outcome.status.is_terminal() => {
                outcome.status = NodeStatus::Skipped;
                outcome.skip_reason = Some(reason.into());
                true
            }
            _ => false,
        }
    }

    /// Ids of nodes that have not reached a terminal state.
    pub(crate) fn unfinished(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Consumes the context into a report.
    #[must_use]
    pub fn into_report(self, duration_ms: f64) -> ExecutionReport {
        ExecutionReport {
            run_id: self.run_id,
            started_at: self.started_at,
            outcomes: self.outcomes,
            duration_ms,
        }
    }
}

/// Result of a run: one outcome per node.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// The run id.
    pub run_id: Uuid,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Per-node outcomes.
    pub outcomes: HashMap<String, NodeOutcome>,
    /// Total run time.
    pub duration_ms: f64,
}

impl ExecutionReport {
    /// Returns the status of a node.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.outcomes.get(id).map(|o| o.status)
    }

    /// Returns the output of a node.
    #[must_use]
    pub fn output(&self, id: &str) -> Option<&Value> {
        self.outcomes.get(id).and_then(|o| o.output.as_ref())
    }

    /// Returns the terminal error of a node.
    #[must_use]
    pub fn error(&self, id: &str) -> Option<&PipelineError> {
        self.outcomes.get(id).and_then(|o| o.error.as_ref())
    }

    /// Returns the outputs of succeeded nodes keyed by id.
    #[must_use]
    pub fn results(&self) -> BTreeMap<String, Value> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| o.output.clone().map(|v| (id.clone(), v)))
            .collect()
    }

    /// Returns sorted ids with the given status.
    #[must_use]
    pub fn with_status(&self, status: NodeStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outcomes
            .iter()
            .filter(|(_, o)| o.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Returns true if every node succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| o.status == NodeStatus::Succeeded)
    }
}

/// A failed run: the originating error plus whatever completed.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// The originating error.
    pub error: PipelineError,
    /// Partial results.
    pub report: ExecutionReport,
}

impl ExecutionFailure {
    /// Creates a failure with a partial report.
    #[must_use]
    pub fn new(error: PipelineError, report: ExecutionReport) -> Self {
        Self { error, report }
    }

    /// Returns the node the failure originated from.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        self.error.node_id()
    }
}

impl From<ExecutionFailure> for PipelineError {
    fn from(failure: ExecutionFailure) -> Self {
        failure.error
    }
}
