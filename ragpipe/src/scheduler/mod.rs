//! DAG scheduler.
//!
//! Executes a validated [`Graph`] as soon as each node's dependencies have
//! resolved, with at most `concurrency` nodes in flight. Every node ends a run
//! `Succeeded`, `Failed`, or `Skipped`.

mod context;

pub use context::{
    ExecuteOptions, ExecutionContext, ExecutionFailure, ExecutionReport, NodeOutcome, NodeStatus,
};

use crate::cancellation::CancellationToken;
use crate::errors::{MissingDependencyError, PipelineError};
use crate::events::{EventSink, SchedulerEvent};
use crate::graph::{Graph, NodeInput, NodeSpec};
use crate::retry::{with_retry, RetryPolicy};
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivers events to the listeners of one scheduler.
#[derive(Clone)]
struct Emitter {
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl Emitter {
    fn emit(&self, event: SchedulerEvent) {
        for sink in self.sinks.iter() {
            sink.try_emit(&event);
        }
    }
}

/// Result of one node task.
struct NodeRun {
    node_id: String,
    result: Result<Value, PipelineError>,
    attempts: usize,
    duration_ms: f64,
}

/// Runs validated graphs.
///
/// A scheduler holds the graph behind an `Arc`; it can run any number of
/// times, concurrently, each run with its own [`ExecutionContext`].
#[derive(Clone)]
pub struct Scheduler {
    graph: Arc<Graph>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("graph", &self.graph.name())
            .field("listeners", &self.sinks.len())
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler for a graph.
    #[must_use]
    pub fn new(graph: Arc<Graph>) -> Self {
        Self {
            graph,
            sinks: Vec::new(),
        }
    }

    /// Returns the graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Builder form of [`Self::add_listener`].
    #[must_use]
    pub fn with_listener(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.add_listener(sink);
        self
    }

    /// Executes the graph once.
    ///
    /// Root nodes receive `seed`; every other node receives an object of its
    /// direct dependencies' results keyed by node id.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionFailure`] carrying the originating error and the
    /// partial report when the graph is not validated, a critical node fails,
    /// a required node does not succeed, or the run times out or is cancelled.
    pub async fn execute(
        &self,
        seed: Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionReport, ExecutionFailure> {
        let start = Instant::now();
        let graph = &self.graph;

        let Some(order) = graph.topological_order() else {
            return Err(ExecutionFailure::new(
                PipelineError::validation(format!(
                    "graph '{}' must be validated before execution",
                    graph.name()
                )),
                ExecutionReport::default(),
            ));
        };
        if options.concurrency == 0 {
            return Err(ExecutionFailure::new(
                PipelineError::validation("concurrency must be at least 1"),
                ExecutionReport::default(),
            ));
        }

        let mut required: HashSet<String> = graph.required_nodes().iter().cloned().collect();
        for id in &options.required_nodes {
            if !graph.contains(id) {
                return Err(ExecutionFailure::new(
                    MissingDependencyError::new("<options>", id.clone()).into(),
                    ExecutionReport::default(),
                ));
            }
            required.insert(id.clone());
        }

        let concurrency = options.concurrency;
        let continue_on_error = options.continue_on_error;
        let cancellation = options.cancellation.clone();
        let deadline = options
            .timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        let mut ctx = ExecutionContext::new(seed, options, order);
        let run_id = ctx.run_id();
        let emitter = Emitter {
            sinks: Arc::new(self.sinks.clone()),
        };

        info!(
            graph = graph.name(),
            %run_id,
            nodes = order.len(),
            started_at = %ctx.started_at().to_rfc3339(),
            "Run started"
        );
        emitter.emit(SchedulerEvent::RunStarted {
            run_id,
            node_count: order.len(),
        });

        let mut in_degree: HashMap<&str, usize> = order
            .iter()
            .map(|id| (id.as_str(), graph.node(id).map_or(0, |n| n.inputs.len())))
            .collect();
        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .cloned()
            .collect();
        let mut tasks: JoinSet<NodeRun> = JoinSet::new();
        let mut failure: Option<PipelineError> = None;

        loop {
            while tasks.len() < concurrency {
                let Some(id) = ready.pop_front() else { break };
                self.spawn_node(&mut tasks, &mut ctx, &id, &emitter);
            }
            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = wait_cancelled(cancellation.as_deref()) => {
                    tasks.abort_all();
                    failure = Some(
                        cancellation
                            .as_ref()
                            .and_then(|token| token.error())
                            .unwrap_or_else(|| PipelineError::Cancelled("cancelled".to_string())),
                    );
                    break;
                }
                () = wait_deadline(deadline) => {
                    tasks.abort_all();
                    failure = Some(PipelineError::timeout(
                        format!("graph '{}'", graph.name()),
                        start.elapsed(),
                    ));
                    break;
                }
                joined = tasks.join_next() => joined,
            };

            let run = match joined {
                Some(Ok(run)) => run,
                Some(Err(join_error)) => {
                    tasks.abort_all();
                    failure = Some(PipelineError::collaborator(format!(
                        "node task failed: {join_error}"
                    )));
                    break;
                }
                None => break,
            };

            let Some(spec) = graph.node(&run.node_id) else {
                continue;
            };
            match run.result {
                Ok(value) => {
                    if let Some(outcome) = ctx.outcome_mut(&run.node_id) {
                        outcome.status = NodeStatus::Succeeded;
                        outcome.output = Some(value);
                        outcome.attempts = run.attempts;
                        outcome.duration_ms = run.duration_ms;
                    }
                    debug!(node = %run.node_id, duration_ms = run.duration_ms, "Node succeeded");
                    emitter.emit(SchedulerEvent::NodeSucceeded {
                        run_id,
                        node_id: run.node_id.clone(),
                        duration_ms: run.duration_ms,
                    });
                    release_dependents(spec, &ctx, &mut in_degree, &mut ready);
                }
                Err(error) => {
                    let critical = required.contains(&run.node_id) || !spec.optional;
                    warn!(
                        node = %run.node_id,
                        attempts = run.attempts,
                        tolerated = !critical,
                        error = %error,
                        "Node failed"
                    );
                    emitter.emit(SchedulerEvent::NodeFailed {
                        run_id,
                        node_id: run.node_id.clone(),
                        error: error.to_string(),
                        tolerated: !critical,
                    });
                    if let Some(outcome) = ctx.outcome_mut(&run.node_id) {
                        outcome.status = NodeStatus::Failed;
                        outcome.error = Some(error.clone());
                        outcome.attempts = run.attempts;
                        outcome.duration_ms = run.duration_ms;
                        outcome.tolerated = !critical;
                    }

                    if !critical {
                        release_dependents(spec, &ctx, &mut in_degree, &mut ready);
                    } else if continue_on_error {
                        let reason = format!("upstream node '{}' failed", run.node_id);
                        skip_descendants(graph, &mut ctx, spec, &reason, &emitter);
                    } else {
                        tasks.abort_all();
                        failure = Some(PipelineError::node_execution(run.node_id.clone(), error));
                        break;
                    }
                }
            }
        }

        if let Some(error) = &failure {
            let interrupted = interruption_error(error);
            for id in ctx.unfinished() {
                if ctx.status(&id) == NodeStatus::Running {
                    if let Some(outcome) = ctx.outcome_mut(&id) {
                        outcome.status = NodeStatus::Failed;
                        outcome.error = Some(interrupted.clone());
                    }
                } else if ctx.mark_skipped(&id, "run aborted") {
                    emitter.emit(SchedulerEvent::NodeSkipped {
                        run_id,
                        node_id: id,
                        reason: "run aborted".to_string(),
                    });
                }
            }
        } else {
            for id in ctx.unfinished() {
                ctx.mark_skipped(&id, "never became ready");
            }
            failure = first_unmet_requirement(order, &required, &ctx);
        }

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        emitter.emit(SchedulerEvent::RunCompleted {
            run_id,
            success: failure.is_none(),
            duration_ms,
        });
        let report = ctx.into_report(duration_ms);

        match failure {
            Some(error) => {
                warn!(graph = graph.name(), %run_id, error = %error, "Run failed");
                Err(ExecutionFailure::new(error, report))
            }
            None => {
                info!(graph = graph.name(), %run_id, duration_ms, "Run completed");
                Ok(report)
            }
        }
    }

    fn spawn_node(
        &self,
        tasks: &mut JoinSet<NodeRun>,
        ctx: &mut ExecutionContext,
        id: &str,
        emitter: &Emitter,
    ) {
        let Some(spec) = self.graph.node(id) else {
            return;
        };

        let upstream: BTreeMap<String, Value> = spec
            .inputs
            .iter()
            .map(|dep| (dep.clone(), ctx.upstream_value(dep)))
            .collect();
        let input = NodeInput {
            node_id: id.to_string(),
            seed: ctx.seed().clone(),
            upstream,
        };

        let options = ctx.options();
        let retries = if spec.max_retries > 0 {
            spec.max_retries
        } else if options.retry_failed_nodes {
            options.max_retries
        } else {
            0
        };
        let base_delay = if spec.retry_delay.is_zero() {
            options.retry_base_delay
        } else {
            spec.retry_delay
        };
        let timeout = spec.timeout.or(options.node_timeout);

        let run_id = ctx.run_id();
        let observer = emitter.clone();
        let node_id = id.to_string();
        let mut policy = RetryPolicy::new()
            .with_retries(retries)
            .with_base_delay(base_delay)
            .with_factor(2.0)
            .with_should_retry(|error| !error.is_structural())
            .with_on_delay(move |attempt| {
                observer.emit(SchedulerEvent::NodeRetrying {
                    run_id,
                    node_id: node_id.clone(),
                    retry: attempt.retry,
                    delay_ms: u64::try_from(attempt.delay.as_millis()).unwrap_or(u64::MAX),
                    error: attempt.error.to_string(),
                });
            });
        if let Some(sleeper) = &options.sleeper {
            policy = policy.with_sleeper(sleeper.clone());
        }

        ctx.mark_running(id);
        tasks.spawn(run_node(
            spec.clone(),
            input,
            policy,
            timeout,
            emitter.clone(),
            run_id,
        ));
    }
}

async fn run_node(
    spec: NodeSpec,
    input: NodeInput,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    emitter: Emitter,
    run_id: Uuid,
) -> NodeRun {
    let start = Instant::now();
    let mut attempts = 0;

    let result = with_retry(&policy, || {
        attempts += 1;
        emitter.emit(SchedulerEvent::NodeStarted {
            run_id,
            node_id: spec.id.clone(),
            attempt: attempts,
        });
        run_attempt(&spec, input.clone(), timeout)
    })
    .await;

    NodeRun {
        node_id: spec.id.clone(),
        result,
        attempts,
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

/// One attempt: the runner bounded by the node timeout, panics mapped to errors.
async fn run_attempt(
    spec: &NodeSpec,
    input: NodeInput,
    timeout: Option<Duration>,
) -> Result<Value, PipelineError> {
    let run = AssertUnwindSafe(spec.runner.run(input)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(PipelineError::timeout(format!("node '{}'", spec.id), limit)),
        },
        None => run.await,
    };

    outcome.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(PipelineError::collaborator(format!(
            "node '{}' panicked: {message}",
            spec.id
        )))
    })
}

/// Decrements dependents and queues those whose dependencies have all resolved.
fn release_dependents(
    spec: &NodeSpec,
    ctx: &ExecutionContext,
    in_degree: &mut HashMap<&str, usize>,
    ready: &mut VecDeque<String>,
) {
    for next in &spec.outputs {
        if let Some(count) = in_degree.get_mut(next.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 && ctx.status(next) == NodeStatus::Pending {
                ready.push_back(next.clone());
            }
        }
    }
}

fn skip_descendants(
    graph: &Graph,
    ctx: &mut ExecutionContext,
    failed: &NodeSpec,
    reason: &str,
    emitter: &Emitter,
) {
    let mut stack: Vec<&str> = failed.outputs.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if ctx.mark_skipped(id, reason) {
            debug!(node = id, reason, "Node skipped");
            emitter.emit(SchedulerEvent::NodeSkipped {
                run_id: ctx.run_id(),
                node_id: id.to_string(),
                reason: reason.to_string(),
            });
            if let Some(spec) = graph.node(id) {
                stack.extend(spec.outputs.iter().map(String::as_str));
            }
        }
    }
}

/// The error recorded on nodes still running when the run is aborted.
///
/// A run-level deadline or cancellation is reported as is; a node failure
/// is not attributed to the siblings it interrupted.
fn interruption_error(cause: &PipelineError) -> PipelineError {
    match cause {
        PipelineError::Timeout { .. } | PipelineError::Cancelled(_) => cause.clone(),
        other => PipelineError::Cancelled(match other.node_id() {
            Some(node) => format!("run aborted after node '{node}' failed"),
            None => "run aborted".to_string(),
        }),
    }
}

/// Returns an error for the first required node, in execution order, that did not succeed.
fn first_unmet_requirement(
    order: &[String],
    required: &HashSet<String>,
    ctx: &ExecutionContext,
) -> Option<PipelineError> {
    order
        .iter()
        .filter(|id| required.contains(*id))
        .find(|id| ctx.status(id) != NodeStatus::Succeeded)
        .map(|id| {
            let cause = ctx
                .outcome(id)
                .and_then(|o| o.error.clone())
                .unwrap_or_else(|| {
                    PipelineError::validation(format!("required node '{id}' did not run"))
                });
            PipelineError::node_execution(id.clone(), cause)
        })
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
