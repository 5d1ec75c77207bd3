//! # Ragpipe
//!
//! A pipeline execution engine for retrieval-augmented generation workloads.
//!
//! Ragpipe schedules work and leaves the actual loading, embedding, retrieval,
//! reranking, and generation to pluggable collaborators. It provides:
//!
//! - **DAG execution**: validated graphs run with bounded concurrency, per-node
//!   timeouts, retries, and a configurable failure policy
//! - **Retry middleware**: exponential backoff with jitter and an injectable sleeper
//! - **Backpressure**: memory-aware pause/resume for streaming producers
//! - **Batch processing**: bounded parallel batches with order-preserving output
//! - **Orchestration**: ingestion and query paths over typed plugin traits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ragpipe::prelude::*;
//!
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!     .loader(loader)
//!     .embedder(embedder)
//!     .retriever(retriever)
//!     .llm(llm)
//!     .build()?;
//!
//! orchestrator.ingest("docs/").await?;
//! let answer = orchestrator.query("What changed in v2?").await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod batch;
pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod orchestrator;
pub mod plugins;
pub mod retry;
pub mod scheduler;
pub mod streaming;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchConfig, BatchProcessor};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{OrchestratorConfig, PerformanceConfig, RetrySettings};
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, MissingDependencyError, PipelineError,
        StageContractError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, SchedulerEvent};
    pub use crate::graph::{node_fn, Graph, NodeInput, NodeOptions, NodeRunner};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestrator::{IngestSummary, Orchestrator, QueryAnswer};
    pub use crate::plugins::{
        Document, Embedder, Embedding, Llm, Loader, PluginRegistry, PluginSelection, Reranker,
        Retriever, VectorRecord,
    };
    pub use crate::retry::{with_retry, RetryPolicy, Sleeper};
    pub use crate::scheduler::{ExecuteOptions, ExecutionReport, NodeStatus, Scheduler};
    pub use crate::streaming::{
        backpressured_channel, BackpressureConfig, BackpressureController, IngestEvent,
        QueryEvent,
    };
}
