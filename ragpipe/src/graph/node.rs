//! Nodes: named units of work in an execution graph.

use crate::errors::PipelineError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Input handed to a node's runner.
///
/// Root nodes (no inputs) receive the seed; other nodes receive the results of
/// their direct dependencies keyed by node id. A tolerated optional failure
/// upstream shows up as `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInput {
    /// The node being run.
    pub node_id: String,
    /// The seed value of the run.
    pub seed: Value,
    /// Results of direct dependencies.
    pub upstream: BTreeMap<String, Value>,
}

impl NodeInput {
    /// Returns true if the node has no dependencies.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.upstream.is_empty()
    }

    /// Returns the result of a direct dependency.
    #[must_use]
    pub fn get(&self, dependency: &str) -> Option<&Value> {
        self.upstream.get(dependency)
    }

    /// Returns the seed for root nodes, otherwise an object of upstream results.
    #[must_use]
    pub fn merged(&self) -> Value {
        if self.is_root() {
            self.seed.clone()
        } else {
            Value::Object(
                self.upstream
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        }
    }
}

/// The work performed by a node.
#[async_trait]
pub trait NodeRunner: Send + Sync + Debug {
    /// Runs the node.
    async fn run(&self, input: NodeInput) -> Result<Value, PipelineError>;
}

/// A closure-backed node runner.
pub struct FnNode<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnNode<F>
where
    F: Fn(NodeInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, PipelineError>> + Send,
{
    /// Creates a new closure-backed runner.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnNode<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnNode").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> NodeRunner for FnNode<F>
where
    F: Fn(NodeInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, PipelineError>> + Send,
{
    async fn run(&self, input: NodeInput) -> Result<Value, PipelineError> {
        (self.func)(input).await
    }
}

/// Wraps an async closure as a shareable runner.
pub fn node_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn NodeRunner>
where
    F: Fn(NodeInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, PipelineError>> + Send + 'static,
{
    Arc::new(FnNode::new(name, func))
}

/// Options accepted by [`crate::graph::Graph::add_node`].
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Ids this node depends on; they may be added later.
    pub depends_on: Vec<String>,
    /// Whether failure of this node may be tolerated.
    pub optional: bool,
    /// Retries for this node's runner.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Per-attempt deadline overriding the run's node timeout.
    pub timeout: Option<Duration>,
}

impl NodeOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Marks the node optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets retries and the first retry delay.
    #[must_use]
    pub fn with_retries(mut self, max_retries: usize, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Sets a per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A node as stored in a graph.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// The unique id.
    pub id: String,
    /// The runner.
    pub runner: Arc<dyn NodeRunner>,
    /// Ids of nodes this node depends on, in declaration order.
    pub inputs: Vec<String>,
    /// Ids of nodes depending on this node, in declaration order.
    pub outputs: Vec<String>,
    /// Whether failure may be tolerated.
    pub optional: bool,
    /// Retries for this node.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Per-attempt deadline override.
    pub timeout: Option<Duration>,
}

/// Handle returned when a node is added to a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    id: String,
}

impl NodeHandle {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Returns the node id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl AsRef<str> for NodeHandle {
    fn as_ref(&self) -> &str {
        &self.id
    }
}
