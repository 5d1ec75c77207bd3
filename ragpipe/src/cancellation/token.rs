//! Cancellation token for scheduler runs.

use crate::errors::PipelineError;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::debug;

/// A token for cooperative cancellation.
///
/// The first reason wins; later calls to [`CancellationToken::cancel`] are
/// no-ops. A scheduler given a token aborts its in-flight nodes as soon as
/// the token fires.
#[derive(Debug, Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new shared token.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Requests cancellation. Returns false if the token had already fired.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.reason.set(reason).is_err() {
            return false;
        }
        debug!(reason = self.reason.get().map(String::as_str), "Cancellation requested");
        self.notify.notify_waiters();
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// The error a cancelled operation reports.
    #[must_use]
    pub fn error(&self) -> Option<PipelineError> {
        self.reason().map(|r| PipelineError::Cancelled(r.to_string()))
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
