//! Events yielded by streaming ingestion and generation.

use super::MemoryStatus;
use serde::Serialize;

/// Running totals of a streaming ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestProgress {
    /// Chunks stored so far.
    pub processed: usize,
    /// Chunks that failed so far.
    pub failed: usize,
    /// Chunks in the ingestion.
    pub total: usize,
}

impl IngestProgress {
    /// Percentage of chunks that succeeded out of those attempted.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed + self.failed;
        if attempted == 0 {
            0.0
        } else {
            self.processed as f64 / attempted as f64 * 100.0
        }
    }
}

/// One event of [`crate::orchestrator::Orchestrator::ingest_stream`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    /// A chunk was handled.
    ChunkProcessed {
        /// Whether the chunk was stored.
        processed: bool,
        /// Time spent on the chunk.
        duration_ms: f64,
        /// Totals after this chunk.
        progress: IngestProgress,
        /// Backpressure memory at this point.
        memory: MemoryStatus,
        /// The chunk's error, if it failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The ingestion finished.
    #[serde(rename = "ingest_complete")]
    Complete {
        /// Chunks in the ingestion.
        total: usize,
        /// Chunks stored.
        processed: usize,
        /// Chunks that failed.
        failed: usize,
        /// Percentage stored.
        success_rate: f64,
        /// Total time.
        duration_ms: f64,
    },
    /// The ingestion could not continue.
    #[serde(rename = "ingest_error")]
    Error {
        /// The wrapped error message.
        message: String,
    },
}

impl IngestEvent {
    /// Returns true for `Complete` and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// One event of [`crate::orchestrator::Orchestrator::query_stream`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    /// Generated text.
    Delta {
        /// The text fragment.
        text: String,
    },
    /// Generation stopped at the token limit.
    Truncated {
        /// Tokens yielded before stopping.
        tokens: usize,
        /// The configured limit.
        limit: usize,
    },
    /// Generation finished.
    Complete {
        /// Tokens yielded.
        tokens: usize,
        /// Total time.
        duration_ms: f64,
    },
}

impl QueryEvent {
    /// Returns the text of a `Delta`.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Delta { text } => Some(text),
            _ => None,
        }
    }
}
