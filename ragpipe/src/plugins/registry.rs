//! Typed plugin registry.

use super::{Embedder, Llm, Loader, Reranker, Retriever};
use crate::errors::PipelineError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The five collaborator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// [`Loader`].
    Loader,
    /// [`Embedder`].
    Embedder,
    /// [`Retriever`].
    Retriever,
    /// [`Reranker`].
    Reranker,
    /// [`Llm`].
    Llm,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loader => write!(f, "loader"),
            Self::Embedder => write!(f, "embedder"),
            Self::Retriever => write!(f, "retriever"),
            Self::Reranker => write!(f, "reranker"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// Names of the plugins to compose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSelection {
    /// Loader name.
    pub loader: String,
    /// Embedder name.
    pub embedder: String,
    /// Retriever name.
    pub retriever: String,
    /// Reranker name, if any.
    #[serde(default)]
    pub reranker: Option<String>,
    /// LLM name.
    pub llm: String,
}

impl PluginSelection {
    /// Selects the required plugins.
    #[must_use]
    pub fn new(
        loader: impl Into<String>,
        embedder: impl Into<String>,
        retriever: impl Into<String>,
        llm: impl Into<String>,
    ) -> Self {
        Self {
            loader: loader.into(),
            embedder: embedder.into(),
            retriever: retriever.into(),
            reranker: None,
            llm: llm.into(),
        }
    }

    /// Selects a reranker.
    #[must_use]
    pub fn with_reranker(mut self, name: impl Into<String>) -> Self {
        self.reranker = Some(name.into());
        self
    }
}

/// Plugins looked up from a [`PluginSelection`].
#[derive(Clone)]
pub struct ResolvedPlugins {
    /// The loader.
    pub loader: Arc<dyn Loader>,
    /// The embedder.
    pub embedder: Arc<dyn Embedder>,
    /// The retriever.
    pub retriever: Arc<dyn Retriever>,
    /// The reranker, if selected.
    pub reranker: Option<Arc<dyn Reranker>>,
    /// The LLM.
    pub llm: Arc<dyn Llm>,
}

impl fmt::Debug for ResolvedPlugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPlugins")
            .field("has_reranker", &self.reranker.is_some())
            .finish_non_exhaustive()
    }
}

/// Registry of named plugin instances, one map per kind.
///
/// Owned by whoever builds orchestrators from it; there is no global instance.
#[derive(Default)]
pub struct PluginRegistry {
    loaders: RwLock<HashMap<String, Arc<dyn Loader>>>,
    embedders: RwLock<HashMap<String, Arc<dyn Embedder>>>,
    retrievers: RwLock<HashMap<String, Arc<dyn Retriever>>>,
    rerankers: RwLock<HashMap<String, Arc<dyn Reranker>>>,
    llms: RwLock<HashMap<String, Arc<dyn Llm>>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("loaders", &self.names(PluginKind::Loader))
            .field("embedders", &self.names(PluginKind::Embedder))
            .field("retrievers", &self.names(PluginKind::Retriever))
            .field("rerankers", &self.names(PluginKind::Reranker))
            .field("llms", &self.names(PluginKind::Llm))
            .finish()
    }
}

fn lookup<T: ?Sized>(
    map: &RwLock<HashMap<String, Arc<T>>>,
    kind: PluginKind,
    name: &str,
) -> Result<Arc<T>, PipelineError> {
    map.read()
        .get(name)
        .cloned()
        .ok_or_else(|| PipelineError::UnknownPlugin {
            kind: kind.to_string(),
            name: name.to_string(),
        })
}

fn sorted_keys<T: ?Sized>(map: &RwLock<HashMap<String, Arc<T>>>) -> Vec<String> {
    let mut names: Vec<String> = map.read().keys().cloned().collect();
    names.sort();
    names
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loader, replacing any with the same name.
    pub fn register_loader(&self, name: impl Into<String>, loader: Arc<dyn Loader>) {
        self.loaders.write().insert(name.into(), loader);
    }

    /// Registers an embedder.
    pub fn register_embedder(&self, name: impl Into<String>, embedder: Arc<dyn Embedder>) {
        self.embedders.write().insert(name.into(), embedder);
    }

    /// Registers a retriever.
    pub fn register_retriever(&self, name: impl Into<String>, retriever: Arc<dyn Retriever>) {
        self.retrievers.write().insert(name.into(), retriever);
    }

    /// Registers a reranker.
    pub fn register_reranker(&self, name: impl Into<String>, reranker: Arc<dyn Reranker>) {
        self.rerankers.write().insert(name.into(), reranker);
    }

    /// Registers an LLM.
    pub fn register_llm(&self, name: impl Into<String>, llm: Arc<dyn Llm>) {
        self.llms.write().insert(name.into(), llm);
    }

    /// Looks up a loader.
    pub fn loader(&self, name: &str) -> Result<Arc<dyn Loader>, PipelineError> {
        lookup(&self.loaders, PluginKind::Loader, name)
    }

    /// Looks up an embedder.
    pub fn embedder(&self, name: &str) -> Result<Arc<dyn Embedder>, PipelineError> {
        lookup(&self.embedders, PluginKind::Embedder, name)
    }

    /// Looks up a retriever.
    pub fn retriever(&self, name: &str) -> Result<Arc<dyn Retriever>, PipelineError> {
        lookup(&self.retrievers, PluginKind::Retriever, name)
    }

    /// Looks up a reranker.
    pub fn reranker(&self, name: &str) -> Result<Arc<dyn Reranker>, PipelineError> {
        lookup(&self.rerankers, PluginKind::Reranker, name)
    }

    /// Looks up an LLM.
    pub fn llm(&self, name: &str) -> Result<Arc<dyn Llm>, PipelineError> {
        lookup(&self.llms, PluginKind::Llm, name)
    }

    /// Returns sorted names registered for a kind.
    #[must_use]
    pub fn names(&self, kind: PluginKind) -> Vec<String> {
        match kind {
            PluginKind::Loader => sorted_keys(&self.loaders),
            PluginKind::Embedder => sorted_keys(&self.embedders),
            PluginKind::Retriever => sorted_keys(&self.retrievers),
            PluginKind::Reranker => sorted_keys(&self.rerankers),
            PluginKind::Llm => sorted_keys(&self.llms),
        }
    }

    /// Returns true if a plugin is registered.
    #[must_use]
    pub fn contains(&self, kind: PluginKind, name: &str) -> bool {
        match kind {
            PluginKind::Loader => self.loaders.read().contains_key(name),
            PluginKind::Embedder => self.embedders.read().contains_key(name),
            PluginKind::Retriever => self.retrievers.read().contains_key(name),
            PluginKind::Reranker => self.rerankers.read().contains_key(name),
            PluginKind::Llm => self.llms.read().contains_key(name),
        }
    }

    /// Looks up every plugin in a selection.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownPlugin`] for the first missing name.
    pub fn resolve(&self, selection: &PluginSelection) -> Result<ResolvedPlugins, PipelineError> {
        Ok(ResolvedPlugins {
            loader: self.loader(&selection.loader)?,
            embedder: self.embedder(&selection.embedder)?,
            retriever: self.retriever(&selection.retriever)?,
            reranker: selection
                .reranker
                .as_deref()
                .map(|name| self.reranker(name))
                .transpose()?,
            llm: self.llm(&selection.llm)?,
        })
    }
}
