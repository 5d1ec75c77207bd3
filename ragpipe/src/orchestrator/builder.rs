//! Builder for [`Orchestrator`].

use super::{Inner, Orchestrator};
use crate::batch::{BatchConfig, BatchProcessor};
use crate::config::OrchestratorConfig;
use crate::errors::PipelineError;
use crate::plugins::{Embedder, Llm, Loader, PluginKind, Reranker, ResolvedPlugins, Retriever};
use crate::retry::{RetryPolicy, Sleeper};
use std::sync::{Arc, OnceLock};

/// Builder for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    loader: Option<Arc<dyn Loader>>,
    embedder: Option<Arc<dyn Embedder>>,
    retriever: Option<Arc<dyn Retriever>>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn Llm>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("has_loader", &self.loader.is_some())
            .field("has_embedder", &self.embedder.is_some())
            .field("has_retriever", &self.retriever.is_some())
            .field("has_reranker", &self.reranker.is_some())
            .field("has_llm", &self.llm.is_some())
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    pub(super) fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            loader: None,
            embedder: None,
            retriever: None,
            reranker: None,
            llm: None,
            sleeper: None,
        }
    }

    /// Sets the document loader.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Sets the embedder.
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Sets the retriever.
    #[must_use]
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Sets the reranker. It is only used when `use_reranker` is enabled.
    #[must_use]
    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Sets the LLM.
    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn Llm>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Replaces the sleeper used between retries.
    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Sets every plugin of a resolved selection.
    #[must_use]
    pub fn plugins(mut self, plugins: ResolvedPlugins) -> Self {
        self.loader = Some(plugins.loader);
        self.embedder = Some(plugins.embedder);
        self.retriever = Some(plugins.retriever);
        self.reranker = plugins.reranker;
        self.llm = Some(plugins.llm);
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for invalid settings or a missing
    /// collaborator.
    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        self.config.validate()?;

        let loader = require(self.loader, PluginKind::Loader)?;
        let embedder = require(self.embedder, PluginKind::Embedder)?;
        let retriever = require(self.retriever, PluginKind::Retriever)?;
        let llm = require(self.llm, PluginKind::Llm)?;

        let mut retry = if self.config.use_retry {
            RetryPolicy::from_settings(&self.config.retry)
        } else {
            RetryPolicy::none()
        };
        if let Some(sleeper) = self.sleeper {
            retry = retry.with_sleeper(sleeper);
        }

        let batch = BatchProcessor::new(BatchConfig::from_performance(&self.config.performance));

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                loader,
                embedder,
                retriever,
                reranker: self.reranker,
                llm,
                retry,
                batch,
                streams: Arc::default(),
                query_graph: OnceLock::new(),
            }),
        })
    }
}

fn require<T: ?Sized>(plugin: Option<Arc<T>>, kind: PluginKind) -> Result<Arc<T>, PipelineError> {
    plugin.ok_or_else(|| PipelineError::Config(format!("no {kind} configured")))
}
