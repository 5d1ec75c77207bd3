//! In-memory collaborators for tests and benches.

use async_trait::async_trait;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::PipelineError;
use crate::plugins::{
    Document, Embedder, Embedding, Llm, Loader, Reranker, Retriever, TokenStream, VectorRecord,
};

/// Queued failures shared by the in-memory collaborators.
///
/// Queued errors are returned one per call before the persistent one is
/// considered.
#[derive(Debug, Default)]
pub struct FailurePlan {
    queued: Mutex<VecDeque<PipelineError>>,
    persistent: Mutex<Option<PipelineError>>,
}

impl FailurePlan {
    /// Fails the next call with `error`.
    pub fn fail_next(&self, error: PipelineError) {
        self.queued.lock().push_back(error);
    }

    /// Fails the next `times` calls with `error`.
    pub fn fail_times(&self, times: usize, error: &PipelineError) {
        let mut queued = self.queued.lock();
        for _ in 0..times {
            queued.push_back(error.clone());
        }
    }

    /// Fails every call with `error` until cleared.
    pub fn fail_always(&self, error: PipelineError) {
        *self.persistent.lock() = Some(error);
    }

    /// Clears all planned failures.
    pub fn clear(&self) {
        self.queued.lock().clear();
        *self.persistent.lock() = None;
    }

    fn check(&self) -> Result<(), PipelineError> {
        if let Some(error) = self.queued.lock().pop_front() {
            return Err(error);
        }
        match self.persistent.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// A loader returning a fixed set of documents.
#[derive(Debug, Default)]
pub struct StaticLoader {
    documents: Vec<Document>,
    paths: Mutex<Vec<String>>,
    /// Planned failures.
    pub failures: FailurePlan,
}

impl StaticLoader {
    /// Creates a loader.
    #[must_use]
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    /// Creates a loader that finds nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.paths.lock().len()
    }

    /// Returns the requested paths.
    #[must_use]
    pub fn recorded_paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

#[async_trait]
impl Loader for StaticLoader {
    async fn load(&self, path: &str) -> Result<Vec<Document>, PipelineError> {
        self.paths.lock().push(path.to_string());
        self.failures.check()?;
        Ok(self.documents.clone())
    }
}

/// A deterministic embedder hashing bytes into a small vector.
#[derive(Debug)]
pub struct HashEmbedder {
    dimensions: usize,
    call_count: AtomicUsize,
    embedded: AtomicUsize,
    drop_last: bool,
    /// Planned failures.
    pub failures: FailurePlan,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

impl HashEmbedder {
    /// Creates an embedder producing `dimensions`-long vectors.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            call_count: AtomicUsize::new(0),
            embedded: AtomicUsize::new(0),
            drop_last: false,
            failures: FailurePlan::default(),
        }
    }

    /// Returns one vector fewer than requested from every `embed` call.
    #[must_use]
    pub fn dropping_last(mut self) -> Self {
        self.drop_last = true;
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Returns the number of texts embedded.
    #[must_use]
    pub fn embedded_count(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    /// Embeds one text.
    #[must_use]
    pub fn vector(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0_f32; self.dimensions];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % self.dimensions] += f32::from(byte) / 255.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, chunks: &[String]) -> Result<Vec<Embedding>, PipelineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        self.embedded.fetch_add(chunks.len(), Ordering::SeqCst);
        let mut vectors: Vec<Embedding> = chunks.iter().map(|c| self.vector(c)).collect();
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding, PipelineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        Ok(self.vector(text))
    }
}

/// A retriever keeping records in memory and ranking by dot product.
#[derive(Debug)]
pub struct InMemoryRetriever {
    records: RwLock<Vec<VectorRecord>>,
    top_k: usize,
    store_calls: AtomicUsize,
    retrieve_calls: AtomicUsize,
    /// Planned failures for `store`.
    pub store_failures: FailurePlan,
    /// Planned failures for `retrieve`.
    pub retrieve_failures: FailurePlan,
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new(3)
    }
}

impl InMemoryRetriever {
    /// Creates a retriever returning at most `top_k` documents.
    #[must_use]
    pub fn new(top_k: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            top_k,
            store_calls: AtomicUsize::new(0),
            retrieve_calls: AtomicUsize::new(0),
            store_failures: FailurePlan::default(),
            retrieve_failures: FailurePlan::default(),
        }
    }

    /// Returns the stored records.
    #[must_use]
    pub fn records(&self) -> Vec<VectorRecord> {
        self.records.read().clone()
    }

    /// Returns the number of `store` calls.
    #[must_use]
    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of `retrieve` calls.
    #[must_use]
    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn store(&self, records: Vec<VectorRecord>) -> Result<(), PipelineError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        self.store_failures.check()?;
        self.records.write().extend(records);
        Ok(())
    }

    async fn retrieve(&self, query: &[f32]) -> Result<Vec<Document>, PipelineError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        self.retrieve_failures.check()?;

        let mut scored: Vec<Document> = self
            .records
            .read()
            .iter()
            .map(|record| {
                let score: f32 = record.vector.iter().zip(query).map(|(a, b)| a * b).sum();
                Document::new(record.id.clone(), record.chunk.clone())
                    .with_metadata("documentId", record.document_id.clone().into())
                    .with_score(score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .unwrap_or_default()
                .total_cmp(&a.score.unwrap_or_default())
        });
        scored.truncate(self.top_k);
        Ok(scored)
    }
}

/// A reranker that reverses the retrieved order.
#[derive(Debug, Default)]
pub struct ReversingReranker {
    call_count: AtomicUsize,
    /// Planned failures.
    pub failures: FailurePlan,
}

impl ReversingReranker {
    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reranker for ReversingReranker {
    async fn rerank(
        &self,
        _query: &str,
        mut documents: Vec<Document>,
    ) -> Result<Vec<Document>, PipelineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        documents.reverse();
        Ok(documents)
    }
}

/// An LLM that answers with the prompt and context size.
#[derive(Debug, Default)]
pub struct EchoLlm {
    streaming: bool,
    token_delay: Option<Duration>,
    response: Option<String>,
    call_count: AtomicUsize,
    /// Planned failures.
    pub failures: FailurePlan,
}

impl EchoLlm {
    /// Creates a non-streaming LLM.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an LLM that streams word by word.
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    /// Replaces the generated text.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Waits between streamed tokens.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn answer(&self, prompt: &str, context: &[Document]) -> String {
        self.response.clone().unwrap_or_else(|| {
            format!("Answer to '{prompt}' using {} documents", context.len())
        })
    }
}

#[async_trait]
impl Llm for EchoLlm {
    async fn generate(&self, prompt: &str, context: &[Document]) -> Result<String, PipelineError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;
        Ok(self.answer(prompt, context))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        context: &[Document],
    ) -> Result<Option<TokenStream>, PipelineError> {
        if !self.streaming {
            return Ok(None);
        }
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.failures.check()?;

        let tokens: Vec<String> = self
            .answer(prompt, context)
            .split_inclusive(' ')
            .map(ToString::to_string)
            .collect();
        let delay = self.token_delay;
        let stream = stream::unfold(tokens.into_iter(), move |mut tokens| async move {
            let token = tokens.next()?;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, PipelineError>(token), tokens))
        });
        Ok(Some(Box::pin(stream)))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_failure_plan_order() {
        let loader = StaticLoader::new(vec![Document::new("a", "text")]);
        loader.failures.fail_next(PipelineError::TransientIo("blip".into()));

        assert!(loader.load("x").await.is_err());
        assert_eq!(loader.load("x").await.unwrap().len(), 1);
        assert_eq!(loader.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retriever_ranks_by_similarity() {
        let embedder = HashEmbedder::default();
        let retriever = InMemoryRetriever::new(1);
        retriever
            .store(vec![
                VectorRecord {
                    id: "d#0".into(),
                    document_id: "d".into(),
                    chunk: "rust ownership".into(),
                    vector: embedder.vector("rust ownership"),
                },
                VectorRecord {
                    id: "d#1".into(),
                    document_id: "d".into(),
                    chunk: "zzzz".into(),
                    vector: embedder.vector("zzzz"),
                },
            ])
            .await
            .unwrap();

        let hits = retriever
            .retrieve(&embedder.vector("rust ownership"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "rust ownership");
    }

    #[tokio::test]
    async fn test_streaming_llm_yields_words() {
        let llm = EchoLlm::streaming().with_response("one two three");
        let stream = llm.generate_stream("q", &[]).await.unwrap().unwrap();
        let tokens: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(tokens, vec!["one ", "two ", "three"]);
    }
}
