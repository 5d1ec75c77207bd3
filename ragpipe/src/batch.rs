//! Bounded batch processing.
//!
//! Items are split into fixed-size batches and at most `max_concurrency`
//! batches run at once. Outputs are always returned in input order regardless
//! of completion order.

use crate::config::PerformanceConfig;
use crate::errors::{PipelineError, StageContractError};
use crate::plugins::{Document, Embedder, Embedding, Retriever};
use crate::retry::{with_retry, RetryPolicy};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrency() -> usize {
    3
}

/// Batch sizing and failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Items per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batches in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Report failed batches per item instead of failing the call.
    #[serde(default)]
    pub tolerate_partial_failure: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            tolerate_partial_failure: false,
        }
    }
}

impl BatchConfig {
    /// Takes sizing from the performance settings.
    #[must_use]
    pub fn from_performance(performance: &PerformanceConfig) -> Self {
        Self {
            batch_size: performance.batch_size,
            max_concurrency: performance.max_concurrency,
            tolerate_partial_failure: false,
        }
    }

    /// Enables or disables partial failure.
    #[must_use]
    pub fn with_partial_failure(mut self, tolerate: bool) -> Self {
        self.tolerate_partial_failure = tolerate;
        self
    }
}

/// Cumulative counters shared by clones of a processor.
#[derive(Debug, Default)]
pub struct BatchStats {
    batches_run: AtomicU64,
    batches_failed: AtomicU64,
    items_processed: AtomicU64,
}

/// A point-in-time copy of [`BatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStatsSnapshot {
    /// Batches completed, successfully or not.
    pub batches_run: u64,
    /// Batches that failed.
    pub batches_failed: u64,
    /// Items in successful batches.
    pub items_processed: u64,
}

impl BatchStats {
    fn record(&self, items: usize, ok: bool) {
        self.batches_run.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.items_processed
                .fetch_add(u64::try_from(items).unwrap_or(u64::MAX), Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the current counters.
    #[must_use]
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            batches_run: self.batches_run.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
        }
    }
}

/// Runs a batch operation over items with bounded concurrency.
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
    stats: Arc<BatchStats>,
}

impl BatchProcessor {
    /// Creates a processor. Zero sizes are raised to one.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                max_concurrency: config.max_concurrency.max(1),
                ..config
            },
            stats: Arc::default(),
        }
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Returns the counters.
    #[must_use]
    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Processes all items; any failed batch fails the call.
    ///
    /// Batches still in flight when a failure arrives are dropped.
    ///
    /// # Errors
    ///
    /// Returns the first batch error, or [`StageContractError`] when a batch
    /// returns a different number of outputs than it was given.
    pub async fn process<I, O, F, Fut>(&self, items: Vec<I>, op: F) -> Result<Vec<O>, PipelineError>
    where
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<Vec<O>, PipelineError>>,
    {
        let total = items.len();
        let batches = split_batches(items, self.config.batch_size);
        let mut slots: Vec<Option<Vec<O>>> = (0..batches.len()).map(|_| None).collect();

        let mut results = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| {
                let len = batch.len();
                let run = op(batch);
                async move { (index, len, run.await) }
            })
            .buffer_unordered(self.config.max_concurrency);

        while let Some((index, len, result)) = results.next().await {
            match result.and_then(|outputs| check_count(index, len, outputs)) {
                Ok(outputs) => {
                    self.stats.record(len, true);
                    slots[index] = Some(outputs);
                }
                Err(error) => {
                    self.stats.record(len, false);
                    debug!(batch = index, error = %error, "Batch failed");
                    return Err(error);
                }
            }
        }

        let mut outputs = Vec::with_capacity(total);
        for slot in slots.into_iter().flatten() {
            outputs.extend(slot);
        }
        Ok(outputs)
    }

    /// Processes all items; a failed batch yields `Err` for exactly its items.
    pub async fn process_partial<I, O, F, Fut>(
        &self,
        items: Vec<I>,
        op: F,
    ) -> Vec<Result<O, PipelineError>>
    where
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<Vec<O>, PipelineError>>,
    {
        let batches = split_batches(items, self.config.batch_size);
        let mut slots: Vec<Vec<Result<O, PipelineError>>> =
            (0..batches.len()).map(|_| Vec::new()).collect();

        let mut results = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| {
                let len = batch.len();
                let run = op(batch);
                async move { (index, len, run.await) }
            })
            .buffer_unordered(self.config.max_concurrency);

        while let Some((index, len, result)) = results.next().await {
            slots[index] = match result.and_then(|outputs| check_count(index, len, outputs)) {
                Ok(outputs) => {
                    self.stats.record(len, true);
                    outputs.into_iter().map(Ok).collect()
                }
                Err(error) => {
                    self.stats.record(len, false);
                    debug!(batch = index, error = %error, "Batch failed, continuing");
                    (0..len).map(|_| Err(error.clone())).collect()
                }
            };
        }

        slots.into_iter().flatten().collect()
    }

    /// Runs [`Self::process`] or [`Self::process_partial`] per the configuration.
    ///
    /// # Errors
    ///
    /// Only when partial failure is not tolerated; see [`Self::process`].
    pub async fn run<I, O, F, Fut>(
        &self,
        items: Vec<I>,
        op: F,
    ) -> Result<Vec<Result<O, PipelineError>>, PipelineError>
    where
        F: Fn(Vec<I>) -> Fut,
        Fut: Future<Output = Result<Vec<O>, PipelineError>>,
    {
        if self.config.tolerate_partial_failure {
            Ok(self.process_partial(items, op).await)
        } else {
            let outputs = self.process(items, op).await?;
            Ok(outputs.into_iter().map(Ok).collect())
        }
    }
}

fn split_batches<I>(items: Vec<I>, size: usize) -> Vec<Vec<I>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter();
    loop {
        let batch: Vec<I> = iter.by_ref().take(size).collect();
        if batch.is_empty() {
            return batches;
        }
        batches.push(batch);
    }
}

fn check_count<O>(index: usize, expected: usize, outputs: Vec<O>) -> Result<Vec<O>, PipelineError> {
    if outputs.len() == expected {
        Ok(outputs)
    } else {
        Err(StageContractError::new(
            format!("batch {index}"),
            format!("{expected} outputs"),
            format!("{} outputs", outputs.len()),
        )
        .into())
    }
}

/// Embeds chunks in bounded parallel batches.
///
/// Each batch is retried on its own under `retry`, so a transient failure
/// re-embeds only the batch that failed.
///
/// # Errors
///
/// Returns the first embedder error or a count mismatch.
pub async fn embed_batch(
    processor: &BatchProcessor,
    retry: &RetryPolicy,
    embedder: Arc<dyn Embedder>,
    chunks: Vec<String>,
) -> Result<Vec<Embedding>, PipelineError> {
    processor
        .process(chunks, |batch| {
            let embedder = embedder.clone();
            async move { with_retry(retry, || embedder.embed(&batch)).await }
        })
        .await
}

/// Retrieves documents for many query vectors in bounded parallel batches.
///
/// The result holds one document list per query, in query order. Each
/// retrieval is retried on its own under `retry`.
///
/// # Errors
///
/// Returns the first retriever error.
pub async fn retrieve_batch(
    processor: &BatchProcessor,
    retry: &RetryPolicy,
    retriever: Arc<dyn Retriever>,
    queries: Vec<Embedding>,
) -> Result<Vec<Vec<Document>>, PipelineError> {
    processor
        .process(queries, |batch| {
            let retriever = retriever.clone();
            async move {
                let mut results = Vec::with_capacity(batch.len());
                for query in &batch {
                    results.push(with_retry(retry, || retriever.retrieve(query)).await?);
                }
                Ok(results)
            }
        })
        .await
}
