//! Channel-backed producer/consumer pipe governed by a [`BackpressureController`].

use super::BackpressureController;
use crate::errors::PipelineError;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Creates a lazy pipe whose producer waits while the controller is paused.
///
/// The channel itself is unbounded; the controller's water marks are the
/// only bound. Dropping the receiver closes the controller, which fails any
/// pending [`BackpressuredSender::send`] with `Cancelled`.
#[must_use]
pub fn backpressured_channel<T>(
    controller: Arc<BackpressureController>,
) -> (BackpressuredSender<T>, BackpressuredReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        BackpressuredSender {
            tx,
            controller: controller.clone(),
        },
        BackpressuredReceiver {
            inner: UnboundedReceiverStream::new(rx),
            controller,
        },
    )
}

/// Producer half.
#[derive(Debug)]
pub struct BackpressuredSender<T> {
    tx: mpsc::UnboundedSender<(T, u64)>,
    controller: Arc<BackpressureController>,
}

impl<T> Clone for BackpressuredSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            controller: self.controller.clone(),
        }
    }
}

impl<T> BackpressuredSender<T> {
    /// Waits for capacity, then enqueues an item of approximately `bytes` size.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Cancelled`] once the receiver is gone.
    pub async fn send(&self, item: T, bytes: u64) -> Result<(), PipelineError> {
        self.controller.wait_for_capacity().await?;
        self.controller.record_enqueued(bytes);
        if self.tx.send((item, bytes)).is_err() {
            self.controller.record_dequeued(bytes);
            return Err(PipelineError::Cancelled(
                "stream consumer dropped".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<BackpressureController> {
        &self.controller
    }

    /// Returns true once the receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.controller.is_closed()
    }
}

/// Consumer half; a [`Stream`] of items.
#[derive(Debug)]
pub struct BackpressuredReceiver<T> {
    inner: UnboundedReceiverStream<(T, u64)>,
    controller: Arc<BackpressureController>,
}

impl<T> BackpressuredReceiver<T> {
    /// Receives the next item.
    pub async fn recv(&mut self) -> Option<T> {
        self.next().await
    }

    /// Returns the controller.
    #[must_use]
    pub fn controller(&self) -> &Arc<BackpressureController> {
        &self.controller
    }
}

impl<T> Unpin for BackpressuredReceiver<T> {}

impl<T> Stream for BackpressuredReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some((item, bytes))) => {
                self.controller.record_dequeued(bytes);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for BackpressuredReceiver<T> {
    fn drop(&mut self) {
        self.controller.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::BackpressureConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_items_flow_in_order() {
        let controller = BackpressureController::shared(BackpressureConfig::default());
        let (tx, rx) = backpressured_channel(controller.clone());

        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i, 8).await.unwrap();
            }
        });

        let items: Vec<i32> = rx.collect().await;
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert_eq!(controller.status().buffer_size, 0);
    }

    #[tokio::test]
    async fn test_producer_waits_for_slow_consumer() {
        let controller = BackpressureController::shared(
            BackpressureConfig::default().with_water_marks(2, 0),
        );
        let (tx, mut rx) = backpressured_channel(controller.clone());

        let producer = tokio::spawn(async move {
            for i in 0..6 {
                tx.send(i, 1).await.unwrap();
            }
        });

        let mut received = Vec::new();
        while let Some(item) = rx.recv().await {
            assert!(controller.status().buffer_size <= 2);
            received.push(item);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        producer.await.unwrap();

        assert_eq!(received, vec![0, 1, 2, 3, 4, 5]);
        assert!(controller.metrics().pauses >= 1);
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let controller = BackpressureController::shared(BackpressureConfig::default());
        let (tx, rx) = backpressured_channel::<u8>(controller);
        drop(rx);

        let result = tx.send(1, 1).await;
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        assert!(tx.is_closed());
    }
}
