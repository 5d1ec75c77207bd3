//! Collaborator contracts for the five plugin kinds.
//!
//! The engine never implements loading, embedding, retrieval, reranking, or
//! generation itself; it composes whatever implements these traits.

mod registry;

pub use registry::{PluginKind, PluginRegistry, PluginSelection, ResolvedPlugins};

use crate::errors::PipelineError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A dense vector.
pub type Embedding = Vec<f32>;

/// Incremental generation output.
pub type TokenStream = BoxStream<'static, Result<String, PipelineError>>;

/// A loaded or retrieved document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Full text.
    pub content: String,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Pre-split chunks; empty means split on blank lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,
    /// Relevance score set by retrievers and rerankers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Document {
    /// Creates a document.
    #[must_use]
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    /// Sets pre-split chunks.
    #[must_use]
    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the relevance score.
    #[must_use]
    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    /// Returns the document's chunks.
    ///
    /// Pre-split chunks win; otherwise the content is split into paragraphs
    /// separated by blank lines. Whitespace-only paragraphs are dropped.
    #[must_use]
    pub fn chunk(&self) -> Vec<String> {
        if !self.chunks.is_empty() {
            return self.chunks.clone();
        }

        let mut paragraphs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        for line in self.content.lines() {
            if line.trim().is_empty() {
                flush_paragraph(&mut current, &mut paragraphs);
            } else {
                current.push(line.trim_end());
            }
        }
        flush_paragraph(&mut current, &mut paragraphs);
        paragraphs
    }
}

fn flush_paragraph(lines: &mut Vec<&str>, out: &mut Vec<String>) {
    if !lines.is_empty() {
        out.push(lines.join("\n").trim().to_string());
        lines.clear();
    }
}

/// A chunk and its vector, as handed to [`Retriever::store`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// `<document id>#<chunk index>`.
    pub id: String,
    /// Owning document.
    pub document_id: String,
    /// Chunk text.
    pub chunk: String,
    /// The chunk's embedding.
    pub vector: Embedding,
}

/// Loads documents from a path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads every document at `path`.
    async fn load(&self, path: &str) -> Result<Vec<Document>, PipelineError>;
}

/// Turns text into vectors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds chunks; the result has one vector per chunk, in order.
    async fn embed(&self, chunks: &[String]) -> Result<Vec<Embedding>, PipelineError>;

    /// Embeds a query.
    async fn embed_query(&self, text: &str) -> Result<Embedding, PipelineError>;
}

/// Stores vectors and finds documents near a query vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Stores records.
    async fn store(&self, records: Vec<VectorRecord>) -> Result<(), PipelineError>;

    /// Returns documents relevant to `query`.
    async fn retrieve(&self, query: &[f32]) -> Result<Vec<Document>, PipelineError>;
}

/// Reorders retrieved documents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns the same documents in relevance order.
    async fn rerank(&self, query: &str, documents: Vec<Document>)
        -> Result<Vec<Document>, PipelineError>;
}

/// Generates answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Llm: Send + Sync {
    /// Generates a complete answer.
    async fn generate(&self, prompt: &str, context: &[Document]) -> Result<String, PipelineError>;

    /// Generates incrementally; `None` means streaming is unsupported.
    async fn generate_stream(
        &self,
        _prompt: &str,
        _context: &[Document],
    ) -> Result<Option<TokenStream>, PipelineError> {
        Ok(None)
    }

    /// Whether [`Llm::generate_stream`] yields a stream.
    fn supports_streaming(&self) -> bool {
        false
    }
}
