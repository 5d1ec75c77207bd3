//! Retry middleware with exponential backoff and jitter.
//!
//! [`with_retry`] wraps any fallible async operation. The backoff value for
//! retry *n* is `base_delay * factor^(n-1)`; that deterministic value is what
//! the [`Sleeper`] receives. Jitter is applied by [`TokioSleeper`] at sleep
//! time only, so an injected sleeper observes exact delays.

use crate::config::RetrySettings;
use crate::errors::PipelineError;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Jitter strategy applied on top of the deterministic backoff.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Adds a uniform random amount in `[0, delay * ratio]`.
    Proportional(f64),
    /// Adds a uniform random amount in `[0, max]` milliseconds.
    #[default]
    Small,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(&self, delay: Duration) -> Duration {
        let extra_ms = match self {
            Self::None => 0,
            Self::Proportional(ratio) => {
                let upper = (delay.as_millis() as f64 * ratio.max(0.0)) as u64;
                if upper == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=upper)
                }
            }
            Self::Small => rand::thread_rng().gen_range(0..=100),
        };
        delay + Duration::from_millis(extra_ms)
    }
}

/// Suspends the retry loop between attempts.
///
/// Injecting a sleeper hands ownership of time semantics to the caller.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for (at least) the given backoff.
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio clock after applying jitter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper {
    jitter: JitterStrategy,
}

impl TokioSleeper {
    /// Creates a sleeper with the given jitter.
    #[must_use]
    pub fn new(jitter: JitterStrategy) -> Self {
        Self { jitter }
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(self.jitter.apply(delay)).await;
    }
}

/// A sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: parking_lot::Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Creates a new recording sleeper.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the delays requested so far.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}

/// Details of a scheduled retry, passed to `on_delay`.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-indexed retry number.
    pub retry: usize,
    /// Deterministic backoff before the retry.
    pub delay: Duration,
    /// The error that triggered the retry.
    pub error: PipelineError,
}

/// Predicate deciding whether an error is retried.
pub type RetryPredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Observer called before each backoff.
pub type DelayObserver = Arc<dyn Fn(&RetryAttempt) + Send + Sync>;

/// Retry configuration for a single operation boundary.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum additional attempts after the first.
    pub retries: usize,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier.
    pub factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    should_retry: Option<RetryPredicate>,
    on_delay: Option<DelayObserver>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(1000),
            factor: 2.0,
            max_delay: Duration::from_millis(30_000),
            should_retry: None,
            on_delay: None,
            sleeper: Arc::new(TokioSleeper::default()),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("base_delay", &self.base_delay)
            .field("factor", &self.factor)
            .field("max_delay", &self.max_delay)
            .field("custom_predicate", &self.should_retry.is_some())
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::default().with_retries(0)
    }

    /// Builds a policy from configuration.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::default()
            .with_retries(settings.retries)
            .with_base_delay(Duration::from_millis(settings.base_delay_ms))
            .with_factor(settings.factor)
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
    }

    /// Sets the number of retries.
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Overrides the retry predicate.
    #[must_use]
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Registers an observer called before each backoff.
    #[must_use]
    pub fn with_on_delay<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryAttempt) + Send + Sync + 'static,
    {
        self.on_delay = Some(Arc::new(observer));
        self
    }

    /// Replaces the sleeper.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the deterministic delay before retry `retry` (1-indexed).
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Returns true if `error` should be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &PipelineError) -> bool {
        self.should_retry
            .as_ref()
            .map_or_else(|| error.is_transient(), |predicate| predicate(error))
    }
}

/// Executes an operation with retry logic.
///
/// The operation runs up to `policy.retries + 1` times. Attempts are strictly
/// sequential. When retries are exhausted, or the error is not retryable, the
/// last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if retry >= policy.retries || !policy.is_retryable(&error) {
                    return Err(error);
                }
                retry += 1;
                let delay = policy.backoff(retry);

                tracing::debug!(
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after error"
                );

                if let Some(observer) = &policy.on_delay {
                    observer(&RetryAttempt {
                        retry,
                        delay,
                        error,
                    });
                }
                policy.sleeper.sleep(delay).await;
            }
        }
    }
}
