//! Pipeline orchestrator.
//!
//! Composes the five collaborators into ingestion and query paths. Every
//! collaborator call is a stage boundary: it is retried per the configured
//! policy and logged when `use_logging` is on. Public entry points wrap
//! failures as `"<Action> failed: <message>"`.

mod builder;
mod graph;
mod stats;

pub use builder::OrchestratorBuilder;
pub use graph::{EMBED_QUERY_NODE, GENERATE_NODE, RERANK_NODE, RETRIEVE_NODE};
pub use stats::{MemorySnapshot, PerformanceStats, PipelineStream, StreamingStats};

use crate::batch::{embed_batch, BatchProcessor};
use crate::config::OrchestratorConfig;
use crate::errors::{PipelineError, StageContractError};
use crate::events::LoggingEventSink;
use crate::graph::Graph;
use crate::plugins::{
    Document, Embedder, Embedding, Llm, Loader, PluginRegistry, PluginSelection, Reranker,
    Retriever, VectorRecord,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::scheduler::{ExecuteOptions, Scheduler};
use crate::streaming::{
    backpressured_channel, BackpressuredSender, IngestEvent, IngestProgress, QueryEvent,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stats::{StreamGuard, StreamTracker};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Events of [`Orchestrator::ingest_stream`].
pub type IngestStream = PipelineStream<IngestEvent>;

/// Events of [`Orchestrator::query_stream`]; a failure ends the stream.
pub type QueryStream = PipelineStream<Result<QueryEvent, PipelineError>>;

/// Result of a completed ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// Documents loaded.
    pub documents: usize,
    /// Chunks embedded and stored.
    pub chunks: usize,
    /// Total time.
    pub duration_ms: f64,
}

/// Result of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    /// The generated answer.
    pub answer: String,
    /// The documents handed to the LLM, in order.
    pub documents: Vec<Document>,
    /// Total time.
    #[serde(default)]
    pub duration_ms: f64,
}

/// Configuration plus capability flags, as reported by [`Orchestrator::get_config`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// The active configuration.
    #[serde(flatten)]
    pub config: OrchestratorConfig,
    /// Whether a reranker was supplied.
    pub has_reranker: bool,
    /// Whether the LLM can stream.
    pub supports_streaming: bool,
}

pub(crate) struct Inner {
    config: OrchestratorConfig,
    loader: Arc<dyn Loader>,
    embedder: Arc<dyn Embedder>,
    retriever: Arc<dyn Retriever>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Arc<dyn Llm>,
    retry: RetryPolicy,
    batch: BatchProcessor,
    streams: Arc<StreamTracker>,
    query_graph: OnceLock<Arc<Graph>>,
}

/// A chunk waiting to be embedded.
#[derive(Debug, Clone)]
struct PendingChunk {
    document_id: String,
    index: usize,
    text: String,
}

impl PendingChunk {
    fn into_record(self, vector: Embedding) -> VectorRecord {
        VectorRecord {
            id: format!("{}#{}", self.document_id, self.index),
            document_id: self.document_id,
            chunk: self.text,
            vector,
        }
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn validate_prompt(prompt: &str) -> Result<(), PipelineError> {
    if prompt.trim().is_empty() {
        return Err(PipelineError::validation("prompt must be a non-empty string"));
    }
    Ok(())
}

fn check_vector_count(expected: usize, vectors: &[Embedding]) -> Result<(), PipelineError> {
    if vectors.len() == expected {
        Ok(())
    } else {
        Err(StageContractError::new(
            "embed",
            format!("{expected} vectors"),
            format!("{} vectors", vectors.len()),
        )
        .into())
    }
}

impl Inner {
    /// Runs one collaborator call under the retry policy.
    async fn stage<T, F, Fut>(&self, stage: &'static str, op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.logged(stage, with_retry(&self.retry, op)).await
    }

    async fn logged<T>(
        &self,
        stage: &'static str,
        work: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        let start = Instant::now();
        let result = work.await;
        if self.config.use_logging {
            match &result {
                Ok(_) => debug!(stage, duration_ms = elapsed_ms(start), "Stage completed"),
                Err(error) => warn!(stage, error = %error, "Stage failed"),
            }
        }
        result
    }

    fn reranker_enabled(&self) -> Option<&Arc<dyn Reranker>> {
        if self.config.use_reranker {
            self.reranker.as_ref()
        } else {
            None
        }
    }

    async fn load_chunks(&self, path: &str) -> Result<(usize, Vec<PendingChunk>), PipelineError> {
        if path.trim().is_empty() {
            return Err(PipelineError::validation("path must be a non-empty string"));
        }

        let documents = self.stage("load", || self.loader.load(path)).await?;
        if documents.is_empty() {
            return Err(StageContractError::new(
                "load",
                "at least one document",
                format!("no documents found at '{path}'"),
            )
            .into());
        }

        let chunks: Vec<PendingChunk> = documents
            .iter()
            .flat_map(|doc| {
                doc.chunk()
                    .into_iter()
                    .enumerate()
                    .map(move |(index, text)| PendingChunk {
                        document_id: doc.id.clone(),
                        index,
                        text,
                    })
            })
            .collect();
        if chunks.is_empty() {
            return Err(StageContractError::new(
                "chunk",
                "at least one chunk",
                format!("no chunks produced from {} documents", documents.len()),
            )
            .into());
        }
        Ok((documents.len(), chunks))
    }

    async fn embed_chunks(&self, texts: Vec<String>) -> Result<Vec<Embedding>, PipelineError> {
        let expected = texts.len();
        let vectors = if self.config.use_parallel_processing {
            // Retried per batch inside embed_batch.
            let work = embed_batch(&self.batch, &self.retry, self.embedder.clone(), texts);
            self.logged("embed", work).await?
        } else {
            self.stage("embed", || self.embedder.embed(&texts)).await?
        };
        check_vector_count(expected, &vectors)?;
        Ok(vectors)
    }

    async fn ingest(&self, path: &str) -> Result<IngestSummary, PipelineError> {
        let start = Instant::now();
        if self.config.use_logging {
            info!(path, "Ingestion started");
        }

        let (documents, chunks) = self.load_chunks(path).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_chunks(texts).await?;

        let count = chunks.len();
        let records: Vec<VectorRecord> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| chunk.into_record(vector))
            .collect();
        self.stage("store", || self.retriever.store(records.clone()))
            .await?;

        let summary = IngestSummary {
            documents,
            chunks: count,
            duration_ms: elapsed_ms(start),
        };
        if self.config.use_logging {
            info!(
                path,
                documents = summary.documents,
                chunks = summary.chunks,
                duration_ms = summary.duration_ms,
                "Ingestion completed"
            );
        }
        Ok(summary)
    }

    async fn ingest_chunk(&self, chunk: PendingChunk) -> Result<(), PipelineError> {
        let texts = vec![chunk.text.clone()];
        let mut vectors = self.stage("embed", || self.embedder.embed(&texts)).await?;
        check_vector_count(1, &vectors)?;
        let record = chunk.into_record(vectors.remove(0));
        self.stage("store", || self.retriever.store(vec![record.clone()]))
            .await
    }

    async fn rerank(&self, prompt: &str, documents: Vec<Document>) -> Result<Vec<Document>, PipelineError> {
        let Some(reranker) = self.reranker_enabled() else {
            return Ok(documents);
        };
        let expected = documents.len();
        let reranked = self
            .stage("rerank", || reranker.rerank(prompt, documents.clone()))
            .await?;
        if reranked.len() != expected {
            return Err(StageContractError::new(
                "rerank",
                format!("{expected} documents"),
                format!("{} documents", reranked.len()),
            )
            .into());
        }
        Ok(reranked)
    }

    async fn retrieve_context(&self, prompt: &str) -> Result<Vec<Document>, PipelineError> {
        validate_prompt(prompt)?;
        let vector = self
            .stage("embed_query", || self.embedder.embed_query(prompt))
            .await?;
        let documents = self
            .stage("retrieve", || self.retriever.retrieve(&vector))
            .await?;
        self.rerank(prompt, documents).await
    }

    async fn generate(&self, prompt: &str, context: &[Document]) -> Result<String, PipelineError> {
        let answer = self
            .stage("generate", || self.llm.generate(prompt, context))
            .await?;
        if answer.trim().is_empty() {
            return Err(StageContractError::new("generate", "a non-empty answer", "an empty string").into());
        }
        Ok(answer)
    }

    async fn query(&self, prompt: &str) -> Result<QueryAnswer, PipelineError> {
        let start = Instant::now();
        let documents = self.retrieve_context(prompt).await?;
        if self.config.use_logging {
            info!(documents = documents.len(), "Context retrieved");
        }
        let answer = self.generate(prompt, &documents).await?;
        Ok(QueryAnswer {
            answer,
            documents,
            duration_ms: elapsed_ms(start),
        })
    }

    async fn produce_ingest(&self, path: &str, tx: &BackpressuredSender<IngestEvent>, guard: &StreamGuard) {
        let start = Instant::now();
        let chunks = match self.load_chunks(path).await {
            Ok((_, chunks)) => chunks,
            Err(error) => {
                let message = error.with_action("Ingestion").to_string();
                emit(tx, guard, IngestEvent::Error { message }, 0).await;
                return;
            }
        };

        let mut progress = IngestProgress {
            total: chunks.len(),
            ..IngestProgress::default()
        };
        for chunk in chunks {
            let chunk_start = Instant::now();
            let bytes = chunk.text.len() as u64;
            let error = match self.ingest_chunk(chunk).await {
                Ok(()) => {
                    progress.processed += 1;
                    None
                }
                Err(error) if error.is_fatal() => {
                    let message = error.with_action("Ingestion").to_string();
                    emit(tx, guard, IngestEvent::Error { message }, 0).await;
                    return;
                }
                Err(error) => {
                    progress.failed += 1;
                    Some(error.to_string())
                }
            };

            let event = IngestEvent::ChunkProcessed {
                processed: error.is_none(),
                duration_ms: elapsed_ms(chunk_start),
                progress,
                memory: tx.controller().status().memory,
                error,
            };
            if !emit(tx, guard, event, bytes).await {
                debug!(path, "Ingestion stream consumer went away");
                return;
            }
        }

        let complete = IngestEvent::Complete {
            total: progress.total,
            processed: progress.processed,
            failed: progress.failed,
            success_rate: progress.success_rate(),
            duration_ms: elapsed_ms(start),
        };
        emit(tx, guard, complete, 0).await;
    }

    async fn produce_answer(
        &self,
        prompt: &str,
        tx: &BackpressuredSender<Result<QueryEvent, PipelineError>>,
        guard: &StreamGuard,
    ) -> Result<(), PipelineError> {
        let start = Instant::now();
        let context = self.retrieve_context(prompt).await?;
        let limit = self
            .config
            .use_streaming_safeguards
            .then_some(self.config.performance.token_limit);

        let mut tokens = 0;
        let stream = self
            .stage("generate", || self.llm.generate_stream(prompt, &context))
            .await?;
        match stream {
            None => {
                let text = self.generate(prompt, &context).await?;
                tokens = 1;
                let bytes = text.len() as u64;
                if !emit(tx, guard, Ok(QueryEvent::Delta { text }), bytes).await {
                    return Ok(());
                }
            }
            Some(mut stream) => {
                while let Some(token) = stream.next().await {
                    let text = token?;
                    if let Some(limit) = limit {
                        if tokens >= limit {
                            if self.config.use_logging {
                                warn!(limit, "Token limit reached, truncating generation");
                            }
                            emit(tx, guard, Ok(QueryEvent::Truncated { tokens, limit }), 0).await;
                            return Ok(());
                        }
                    }
                    tokens += 1;
                    let bytes = text.len() as u64;
                    if !emit(tx, guard, Ok(QueryEvent::Delta { text }), bytes).await {
                        return Ok(());
                    }
                }
            }
        }

        let complete = QueryEvent::Complete {
            tokens,
            duration_ms: elapsed_ms(start),
        };
        emit(tx, guard, Ok(complete), 0).await;
        Ok(())
    }
}

/// Sends one stream item; false once the consumer is gone.
async fn emit<T>(tx: &BackpressuredSender<T>, guard: &StreamGuard, item: T, bytes: u64) -> bool {
    match tx.send(item, bytes).await {
        Ok(()) => {
            guard.record_event();
            true
        }
        Err(_) => false,
    }
}

/// Composes loader, embedder, retriever, optional reranker, and LLM.
///
/// Cheap to clone; clones share collaborators and statistics.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("has_reranker", &self.inner.reranker.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Builds an orchestrator from named plugins.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownPlugin`] for an unregistered name and
    /// [`PipelineError::Config`] for invalid settings.
    pub fn from_registry(
        registry: &PluginRegistry,
        selection: &PluginSelection,
        config: OrchestratorConfig,
    ) -> Result<Self, PipelineError> {
        let plugins = registry.resolve(selection)?;
        Self::builder(config).plugins(plugins).build()
    }

    /// Ingests every document at `path` into the retriever.
    pub async fn ingest(&self, path: &str) -> Result<IngestSummary, PipelineError> {
        self.inner
            .ingest(path)
            .await
            .map_err(|e| e.with_action("Ingestion"))
    }

    /// Answers `prompt` from retrieved context.
    ///
    /// An empty prompt is rejected before any collaborator is called.
    pub async fn query(&self, prompt: &str) -> Result<QueryAnswer, PipelineError> {
        self.inner
            .query(prompt)
            .await
            .map_err(|e| e.with_action("Query"))
    }

    /// Ingests chunk by chunk, yielding an event per chunk and then `Complete`.
    ///
    /// Chunk failures are reported in their event. A fatal failure ends the
    /// stream with `Error`. Dropping the stream stops the producer at its next
    /// chunk boundary. Must be called inside a tokio runtime.
    pub fn ingest_stream(&self, path: &str) -> IngestStream {
        let guard = self.inner.streams.open(self.inner.config.backpressure());
        let (tx, rx) = backpressured_channel(guard.controller());
        let stream = PipelineStream::new(rx, guard.clone());
        let inner = self.inner.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            inner.produce_ingest(&path, &tx, &guard).await;
        });
        stream
    }

    /// Streams the answer to `prompt`.
    ///
    /// Falls back to a single `Delta` when the LLM cannot stream. Must be
    /// called inside a tokio runtime.
    pub fn query_stream(&self, prompt: &str) -> QueryStream {
        let guard = self.inner.streams.open(self.inner.config.backpressure());
        let (tx, rx) = backpressured_channel(guard.controller());
        let stream = PipelineStream::new(rx, guard.clone());
        let inner = self.inner.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            if let Err(error) = inner.produce_answer(&prompt, &tx, &guard).await {
                emit(&tx, &guard, Err(error.with_action("Query")), 0).await;
            }
        });
        stream
    }

    /// The query path as a validated graph.
    ///
    /// Built and validated on first use, then shared by every later call.
    /// The graph expects a seed of the form `{"prompt": "..."}`; the rerank
    /// node is present only when reranking is enabled, and is optional.
    pub fn query_graph(&self) -> Result<Arc<Graph>, PipelineError> {
        if let Some(graph) = self.inner.query_graph.get() {
            return Ok(graph.clone());
        }
        let graph = Arc::new(graph::build_query_graph(&self.inner)?);
        Ok(self.inner.query_graph.get_or_init(|| graph).clone())
    }

    /// Answers `prompt` by executing [`Orchestrator::query_graph`].
    pub async fn query_via_graph(&self, prompt: &str) -> Result<QueryAnswer, PipelineError> {
        self.run_query_graph(prompt)
            .await
            .map_err(|e| e.with_action("Query"))
    }

    async fn run_query_graph(&self, prompt: &str) -> Result<QueryAnswer, PipelineError> {
        let start = Instant::now();
        validate_prompt(prompt)?;

        let mut scheduler = Scheduler::new(self.query_graph()?);
        if self.inner.config.use_logging {
            scheduler.add_listener(Arc::new(LoggingEventSink::debug()));
        }
        let options =
            ExecuteOptions::new().with_concurrency(self.inner.config.performance.max_concurrency);
        let report = scheduler
            .execute(json!({ "prompt": prompt }), options)
            .await?;

        let mut answer: QueryAnswer = graph::decode(GENERATE_NODE, report.output(GENERATE_NODE))?;
        answer.duration_ms = elapsed_ms(start);
        Ok(answer)
    }

    /// The active configuration and capability flags.
    pub fn get_config(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            config: self.inner.config.clone(),
            has_reranker: self.inner.reranker.is_some(),
            supports_streaming: self.inner.llm.supports_streaming(),
        }
    }

    /// Counters for streams and batch processing.
    pub fn get_performance_stats(&self) -> PerformanceStats {
        let threshold = self.inner.config.backpressure().memory_threshold_bytes;
        PerformanceStats {
            streaming: self.inner.streams.streaming(),
            parallel: self.inner.batch.stats(),
            memory: self.inner.streams.memory(threshold),
        }
    }
}

#[cfg(test)]
mod orchestrator_tests;
