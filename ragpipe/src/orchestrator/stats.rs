//! Streaming bookkeeping and performance statistics.

use crate::batch::BatchStatsSnapshot;
use crate::streaming::{
    BackpressureConfig, BackpressureController, BackpressureMetrics, BackpressuredReceiver,
};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Statistics returned by [`crate::orchestrator::Orchestrator::get_performance_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    /// Stream counters.
    pub streaming: StreamingStats,
    /// Batch processor counters.
    pub parallel: BatchStatsSnapshot,
    /// Memory held by live streams.
    pub memory: MemorySnapshot,
}

/// Stream counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStats {
    /// Streams whose producer or consumer is still alive.
    pub active_streams: usize,
    /// Streams opened so far.
    pub total_streams: u64,
    /// Events delivered to consumers.
    pub events_emitted: u64,
    /// Backpressure counters across all streams.
    pub backpressure: BackpressureMetrics,
}

/// Memory held by live streams.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    /// Items buffered.
    pub buffered_items: usize,
    /// Bytes buffered.
    pub current_bytes: u64,
    /// Budget per stream.
    pub threshold_bytes: u64,
    /// `current / threshold * 100`.
    pub usage_percentage: f64,
}

fn accumulate(total: &mut BackpressureMetrics, other: &BackpressureMetrics) {
    total.pauses += other.pauses;
    total.total_paused_ms += other.total_paused_ms;
    total.peak_buffer_size = total.peak_buffer_size.max(other.peak_buffer_size);
    total.enqueued += other.enqueued;
    total.dequeued += other.dequeued;
}

/// Tracks the controllers of every stream an orchestrator opened.
#[derive(Debug, Default)]
pub(crate) struct StreamTracker {
    live: Mutex<Vec<Weak<BackpressureController>>>,
    finished: Mutex<BackpressureMetrics>,
    active: AtomicUsize,
    total: AtomicU64,
    events: AtomicU64,
}

impl StreamTracker {
    /// Opens a stream with its own controller.
    ///
    /// The guard is shared by the producer and the [`PipelineStream`]; the
    /// stream stays live until both have dropped it.
    pub(crate) fn open(self: &Arc<Self>, config: BackpressureConfig) -> Arc<StreamGuard> {
        let controller = BackpressureController::shared(config);
        {
            let mut live = self.live.lock();
            live.retain(|weak| weak.strong_count() > 0);
            live.push(Arc::downgrade(&controller));
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Arc::new(StreamGuard {
            tracker: self.clone(),
            controller,
        })
    }

    pub(crate) fn streaming(&self) -> StreamingStats {
        let mut backpressure = self.finished.lock().clone();
        for controller in self.live_controllers() {
            accumulate(&mut backpressure, &controller.metrics());
        }
        StreamingStats {
            active_streams: self.active.load(Ordering::SeqCst),
            total_streams: self.total.load(Ordering::SeqCst),
            events_emitted: self.events.load(Ordering::SeqCst),
            backpressure,
        }
    }

    pub(crate) fn memory(&self, threshold_bytes: u64) -> MemorySnapshot {
        let mut snapshot = MemorySnapshot {
            threshold_bytes,
            ..MemorySnapshot::default()
        };
        for controller in self.live_controllers() {
            let status = controller.status();
            snapshot.buffered_items += status.buffer_size;
            snapshot.current_bytes = snapshot
                .current_bytes
                .saturating_add(status.memory.current_bytes);
        }
        if threshold_bytes > 0 {
            snapshot.usage_percentage =
                snapshot.current_bytes as f64 / threshold_bytes as f64 * 100.0;
        }
        snapshot
    }

    fn live_controllers(&self) -> Vec<Arc<BackpressureController>> {
        self.live.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

/// A stream's registration, held by its producer and its consumer.
#[derive(Debug)]
pub(crate) struct StreamGuard {
    tracker: Arc<StreamTracker>,
    controller: Arc<BackpressureController>,
}

impl StreamGuard {
    pub(crate) fn controller(&self) -> Arc<BackpressureController> {
        self.controller.clone()
    }

    pub(crate) fn record_event(&self) {
        self.tracker.events.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        accumulate(&mut self.tracker.finished.lock(), &self.controller.metrics());
        {
            let mut live = self.tracker.live.lock();
            live.retain(|weak| !std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.controller)));
        }
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A stream handed out by the orchestrator.
///
/// Keeps the stream registered while undelivered events are still buffered,
/// so statistics see them even after the producer has finished.
#[derive(Debug)]
pub struct PipelineStream<T> {
    rx: BackpressuredReceiver<T>,
    _guard: Arc<StreamGuard>,
}

impl<T> PipelineStream<T> {
    pub(crate) fn new(rx: BackpressuredReceiver<T>, guard: Arc<StreamGuard>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Receives the next event.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns the stream's backpressure controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<BackpressureController> {
        self.rx.controller()
    }
}

impl<T> Stream for PipelineStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_next_unpin(cx)
    }
}
