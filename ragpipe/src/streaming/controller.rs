//! Backpressure controller shared by a producer and its consumer.

use crate::errors::PipelineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, warn};

const MB: u64 = 1024 * 1024;

fn default_high_water_items() -> usize {
    100
}

fn default_low_water_items() -> usize {
    50
}

fn default_memory_threshold_bytes() -> u64 {
    512 * MB
}

fn default_memory_high_percent() -> f64 {
    80.0
}

fn default_memory_low_percent() -> f64 {
    60.0
}

/// Pause and resume thresholds.
///
/// The producer pauses when either the buffer or memory crosses its high
/// mark and resumes only once both are back at or below their low marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
    /// Buffer size that pauses the producer.
    #[serde(default = "default_high_water_items")]
    pub high_water_items: usize,
    /// Buffer size at or below which the producer may resume.
    #[serde(default = "default_low_water_items")]
    pub low_water_items: usize,
    /// Memory budget that percentages are computed against.
    #[serde(default = "default_memory_threshold_bytes")]
    pub memory_threshold_bytes: u64,
    /// Memory percentage that pauses the producer.
    #[serde(default = "default_memory_high_percent")]
    pub memory_high_percent: f64,
    /// Memory percentage at or below which the producer may resume.
    #[serde(default = "default_memory_low_percent")]
    pub memory_low_percent: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_items: default_high_water_items(),
            low_water_items: default_low_water_items(),
            memory_threshold_bytes: default_memory_threshold_bytes(),
            memory_high_percent: default_memory_high_percent(),
            memory_low_percent: default_memory_low_percent(),
        }
    }
}

impl BackpressureConfig {
    /// Default thresholds with a memory budget in megabytes.
    #[must_use]
    pub fn with_memory_mb(mb: usize) -> Self {
        Self {
            memory_threshold_bytes: u64::try_from(mb).unwrap_or(u64::MAX).saturating_mul(MB),
            ..Self::default()
        }
    }

    /// Thresholds that never pause.
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            high_water_items: usize::MAX,
            low_water_items: usize::MAX,
            memory_threshold_bytes: u64::MAX,
            memory_high_percent: 100.0,
            memory_low_percent: 100.0,
        }
    }

    /// Sets the buffer water marks.
    #[must_use]
    pub fn with_water_marks(mut self, high: usize, low: usize) -> Self {
        self.high_water_items = high;
        self.low_water_items = low.min(high);
        self
    }

    /// Sets the memory percentage marks.
    #[must_use]
    pub fn with_memory_percent(mut self, high: f64, low: f64) -> Self {
        self.memory_high_percent = high;
        self.memory_low_percent = low.min(high);
        self
    }
}

/// Approximate memory held by queued items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryStatus {
    /// Bytes currently queued.
    pub current_bytes: u64,
    /// The configured budget.
    pub threshold_bytes: u64,
    /// `current / threshold * 100`.
    pub usage_percentage: f64,
}

/// Snapshot read by producers once per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackpressureStatus {
    /// Items currently queued.
    pub buffer_size: usize,
    /// Memory usage.
    pub memory: MemoryStatus,
    /// Whether the producer must wait.
    pub is_paused: bool,
}

/// Counters kept across the controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackpressureMetrics {
    /// Times the producer was paused.
    pub pauses: u64,
    /// Total time spent paused.
    pub total_paused_ms: f64,
    /// Largest buffer size observed.
    pub peak_buffer_size: usize,
    /// Items enqueued.
    pub enqueued: u64,
    /// Items dequeued.
    pub dequeued: u64,
}

#[derive(Debug, Default)]
struct State {
    buffer_size: usize,
    current_bytes: u64,
    paused: bool,
    paused_at: Option<Instant>,
    closed: bool,
    metrics: BackpressureMetrics,
}

/// Tracks an in-flight buffer and its memory, and suspends the producer.
///
/// All state lives behind one lock, so every chunk boundary updates buffer,
/// memory, and pause state together.
#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    state: Mutex<State>,
    resumed: Notify,
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(BackpressureConfig::default())
    }
}

impl BackpressureController {
    /// Creates a controller.
    #[must_use]
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            resumed: Notify::new(),
        }
    }

    /// Creates a shared controller.
    #[must_use]
    pub fn shared(config: BackpressureConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Returns the thresholds.
    #[must_use]
    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> BackpressureStatus {
        let state = self.state.lock();
        BackpressureStatus {
            buffer_size: state.buffer_size,
            memory: self.memory(state.current_bytes),
            is_paused: state.paused,
        }
    }

    /// Returns true while the producer must wait.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Returns true once the consumer is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> BackpressureMetrics {
        let state = self.state.lock();
        let mut metrics = state.metrics.clone();
        if let Some(since) = state.paused_at {
            metrics.total_paused_ms += since.elapsed().as_secs_f64() * 1000.0;
        }
        metrics
    }

    /// Records an item entering the buffer.
    pub fn record_enqueued(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.buffer_size += 1;
        state.current_bytes = state.current_bytes.saturating_add(bytes);
        state.metrics.enqueued += 1;
        state.metrics.peak_buffer_size = state.metrics.peak_buffer_size.max(state.buffer_size);

        if !state.paused && self.should_pause(&state) {
            state.paused = true;
            state.paused_at = Some(Instant::now());
            state.metrics.pauses += 1;
            warn!(
                buffer_size = state.buffer_size,
                memory_bytes = state.current_bytes,
                "Backpressure engaged, pausing producer"
            );
        }
    }

    /// Records an item leaving the buffer.
    pub fn record_dequeued(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.buffer_size = state.buffer_size.saturating_sub(1);
        state.current_bytes = state.current_bytes.saturating_sub(bytes);
        state.metrics.dequeued += 1;

        if state.paused && self.may_resume(&state) {
            Self::resume(&mut state);
            debug!(buffer_size = state.buffer_size, "Backpressure released");
            drop(state);
            self.resumed.notify_waiters();
        }
    }

    /// Marks the consumer as gone and wakes any waiting producer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if state.paused {
            Self::resume(&mut state);
        }
        drop(state);
        self.resumed.notify_waiters();
    }

    /// Suspends until the producer may enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] if the consumer went away.
    pub async fn wait_for_capacity(&self) -> Result<(), PipelineError> {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.closed {
                    return Err(PipelineError::Cancelled(
                        "stream consumer dropped".to_string(),
                    ));
                }
                if !state.paused {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    fn memory(&self, current_bytes: u64) -> MemoryStatus {
        let usage_percentage = if self.config.memory_threshold_bytes == 0 {
            0.0
        } else {
            current_bytes as f64 / self.config.memory_threshold_bytes as f64 * 100.0
        };
        MemoryStatus {
            current_bytes,
            threshold_bytes: self.config.memory_threshold_bytes,
            usage_percentage,
        }
    }

    fn should_pause(&self, state: &State) -> bool {
        state.buffer_size >= self.config.high_water_items
            || self.memory(state.current_bytes).usage_percentage >= self.config.memory_high_percent
    }

    fn may_resume(&self, state: &State) -> bool {
        state.buffer_size <= self.config.low_water_items
            && self.memory(state.current_bytes).usage_percentage <= self.config.memory_low_percent
    }

    fn resume(state: &mut State) {
        state.paused = false;
        if let Some(since) = state.paused_at.take() {
            state.metrics.total_paused_ms += since.elapsed().as_secs_f64() * 1000.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    fn small() -> BackpressureController {
        BackpressureController::new(BackpressureConfig::default().with_water_marks(3, 1))
    }

    #[test]
    fn test_pauses_at_high_water_and_resumes_at_low_water() {
        let controller = small();
        controller.record_enqueued(10);
        controller.record_enqueued(10);
        assert!(!controller.status().is_paused);

        controller.record_enqueued(10);
        assert!(controller.status().is_paused);

        // Still above the low mark: stays paused.
        controller.record_dequeued(10);
        assert!(controller.status().is_paused);

        controller.record_dequeued(10);
        let status = controller.status();
        assert!(!status.is_paused);
        assert_eq!(status.buffer_size, 1);
        assert_eq!(status.memory.current_bytes, 10);
    }

    #[test]
    fn test_memory_threshold_pauses() {
        let controller = BackpressureController::new(
            BackpressureConfig {
                memory_threshold_bytes: 1000,
                ..BackpressureConfig::default()
            }
            .with_memory_percent(50.0, 20.0),
        );

        controller.record_enqueued(600);
        let status = controller.status();
        assert!(status.is_paused);
        assert!((status.memory.usage_percentage - 60.0).abs() < f64::EPSILON);

        controller.record_enqueued(100);
        controller.record_dequeued(600);
        assert!(!controller.is_paused());
    }

    #[test]
    fn test_wait_for_capacity_suspends_until_drained() {
        let controller = small();
        for _ in 0..3 {
            controller.record_enqueued(1);
        }

        let mut wait = task::spawn(controller.wait_for_capacity());
        assert_pending!(wait.poll());

        controller.record_dequeued(1);
        assert_pending!(wait.poll());

        controller.record_dequeued(1);
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
    }

    #[test]
    fn test_close_releases_waiting_producer() {
        let controller = small();
        for _ in 0..3 {
            controller.record_enqueued(1);
        }

        let mut wait = task::spawn(controller.wait_for_capacity());
        assert_pending!(wait.poll());

        controller.close();
        assert!(wait.is_woken());
        assert_ready_err!(wait.poll());
    }

    #[test]
    fn test_metrics_track_pauses_and_peak() {
        let controller = small();
        for _ in 0..4 {
            controller.record_enqueued(1);
        }
        for _ in 0..4 {
            controller.record_dequeued(1);
        }
        controller.record_enqueued(1);

        let metrics = controller.metrics();
        assert_eq!(metrics.pauses, 1);
        assert_eq!(metrics.peak_buffer_size, 4);
        assert_eq!(metrics.enqueued, 5);
        assert_eq!(metrics.dequeued, 4);
    }

    #[test]
    fn test_unbounded_never_pauses() {
        let controller = BackpressureController::new(BackpressureConfig::unbounded());
        for _ in 0..10_000 {
            controller.record_enqueued(1024);
        }
        assert!(!controller.is_paused());
    }

    #[test]
    fn test_with_memory_mb() {
        let config = BackpressureConfig::with_memory_mb(64);
        assert_eq!(config.memory_threshold_bytes, 64 * 1024 * 1024);
        assert_eq!(config.high_water_items, 100);
    }
}
