//! Orchestrator configuration.
//!
//! Keys follow the camelCase names of the plain options object consumed by
//! the orchestrator (`useRetry`, `performance.maxConcurrency`, ...). Every
//! field has a default, so partial JSON documents are valid.

use crate::errors::PipelineError;
use crate::streaming::BackpressureConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Performance tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceConfig {
    /// Maximum concurrently running batches or graph nodes.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Items per batch for parallel embedding.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Memory budget for streaming buffers.
    #[serde(default = "default_max_memory_mb", rename = "maxMemoryMB")]
    pub max_memory_mb: usize,
    /// Maximum tokens yielded by a guarded query stream.
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
}

fn default_max_concurrency() -> usize {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_max_memory_mb() -> usize {
    512
}

fn default_token_limit() -> usize {
    100_000
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            batch_size: default_batch_size(),
            max_memory_mb: default_max_memory_mb(),
            token_limit: default_token_limit(),
        }
    }
}

/// Retry settings applied at every stage boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// Maximum additional attempts.
    #[serde(default = "default_retries")]
    pub retries: usize,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff multiplier.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Wrap stage boundaries in retry middleware.
    #[serde(default = "default_true")]
    pub use_retry: bool,
    /// Emit tracing events for stage boundaries.
    #[serde(default = "default_true")]
    pub use_logging: bool,
    /// Rerank retrieved documents when a reranker is configured.
    #[serde(default)]
    pub use_reranker: bool,
    /// Embed chunks through the bounded batch processor.
    #[serde(default)]
    pub use_parallel_processing: bool,
    /// Apply backpressure and token limits to streams.
    #[serde(default)]
    pub use_streaming_safeguards: bool,
    /// Performance tuning.
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Retry tuning.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            use_retry: true,
            use_logging: true,
            use_reranker: false,
            use_parallel_processing: false,
            use_streaming_safeguards: false,
            performance: PerformanceConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Config(format!("invalid configuration JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let perf = &self.performance;
        if perf.max_concurrency == 0 {
            return Err(PipelineError::Config("performance.maxConcurrency must be at least 1".into()));
        }
        if perf.batch_size == 0 {
            return Err(PipelineError::Config("performance.batchSize must be at least 1".into()));
        }
        if perf.max_memory_mb == 0 {
            return Err(PipelineError::Config("performance.maxMemoryMB must be at least 1".into()));
        }
        if perf.token_limit == 0 {
            return Err(PipelineError::Config("performance.tokenLimit must be at least 1".into()));
        }
        if !(self.retry.factor.is_finite() && self.retry.factor >= 1.0) {
            return Err(PipelineError::Config("retry.factor must be a finite number >= 1".into()));
        }
        Ok(())
    }

    /// Enables or disables retries.
    #[must_use]
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.use_retry = enabled;
        self
    }

    /// Enables or disables logging.
    #[must_use]
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.use_logging = enabled;
        self
    }

    /// Enables or disables reranking.
    #[must_use]
    pub fn with_reranker(mut self, enabled: bool) -> Self {
        self.use_reranker = enabled;
        self
    }

    /// Enables or disables batched embedding.
    #[must_use]
    pub fn with_parallel_processing(mut self, enabled: bool) -> Self {
        self.use_parallel_processing = enabled;
        self
    }

    /// Enables or disables streaming safeguards.
    #[must_use]
    pub fn with_streaming_safeguards(mut self, enabled: bool) -> Self {
        self.use_streaming_safeguards = enabled;
        self
    }

    /// Replaces the performance settings.
    #[must_use]
    pub fn with_performance(mut self, performance: PerformanceConfig) -> Self {
        self.performance = performance;
        self
    }

    /// Replaces the retry settings.
    #[must_use]
    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Backpressure thresholds for guarded streams.
    #[must_use]
    pub fn backpressure(&self) -> BackpressureConfig {
        if self.use_streaming_safeguards {
            BackpressureConfig::with_memory_mb(self.performance.max_memory_mb)
        } else {
            BackpressureConfig::unbounded()
        }
    }
}
