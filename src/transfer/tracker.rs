//! Event-based completion tracking.
//!
//! Markers are recorded against a queue's tail and later polled or waited on.
//! `wait` always polls first so an already-retired transfer never pays for a
//! blocking driver call. Buffer recycling rides the same queue: the release
//! callback registered by [`CompletionTracker::on_complete`] is FIFO-ordered
//! behind the transfer's device copy, so a buffer can only return to the pool
//! after its contents have been fully consumed or written by the device.

use futures::FutureExt;
use metrics::histogram;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

use crate::driver::{MarkerStatus, TransferDriver};
use crate::error::Result;
use crate::staging::StagingLease;
use crate::transfer::handle::{StateCell, TransferState};

/// Creates, polls and waits on completion markers, and schedules the
/// queue-ordered release of staging buffers.
pub struct CompletionTracker<D: TransferDriver> {
    driver: Arc<D>,
}

impl<D: TransferDriver> CompletionTracker<D> {
    pub fn new(driver: Arc<D>) -> Self {
        CompletionTracker { driver }
    }

    /// Allocate a marker and record it against the current tail of `queue`.
    pub fn create_marker(&self, queue: &D::Queue) -> Result<D::Marker> {
        let marker = self.driver.create_marker()?;
        self.driver.record_marker(&marker, queue)?;
        Ok(marker)
    }

    /// Non-blocking completion query.
    pub fn poll(&self, marker: &D::Marker) -> Result<MarkerStatus> {
        self.driver.query_marker(marker)
    }

    /// Block until the queue has processed all work enqueued before `marker`.
    /// A marker that already reports complete costs one query, no
    /// synchronization call.
    pub fn wait(&self, marker: &D::Marker) -> Result<()> {
        if self.driver.query_marker(marker)? == MarkerStatus::Pending {
            self.driver.wait_marker(marker)?;
        }
        Ok(())
    }

    /// Schedule the staging buffer's release behind everything currently
    /// enqueued on `queue`. The lease moves into the callback; its drop is
    /// the release.
    pub(crate) fn on_complete(
        &self,
        queue: &D::Queue,
        lease: StagingLease,
        state: Arc<StateCell>,
        enqueued_at: Instant,
    ) -> Result<()> {
        self.driver.add_callback(
            queue,
            Box::new(move || {
                state.advance(TransferState::Completed);
                drop(lease);
                state.advance(TransferState::Released);
                histogram!("staging_completion_seconds")
                    .record(enqueued_at.elapsed().as_secs_f64());
            }),
        )
    }
}

/// Future that resolves when a marker completes.
///
/// Polls the marker once inline; if still pending, spawns a task that polls
/// to completion and signals back through a oneshot channel.
pub(crate) struct MarkerWaiter<D: TransferDriver> {
    driver: Arc<D>,
    marker: Arc<D::Marker>,
    receiver: Option<oneshot::Receiver<Result<()>>>,
}

impl<D: TransferDriver> MarkerWaiter<D> {
    pub(crate) fn new(driver: Arc<D>, marker: Arc<D::Marker>) -> Self {
        MarkerWaiter {
            driver,
            marker,
            receiver: None,
        }
    }
}

impl<D: TransferDriver> Future for MarkerWaiter<D> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.driver.query_marker(&self.marker) {
            Ok(MarkerStatus::Complete) => return Poll::Ready(Ok(())),
            Ok(MarkerStatus::Pending) => {}
            Err(error) => return Poll::Ready(Err(error)),
        }

        if self.receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            let driver = Arc::clone(&self.driver);
            let marker = Arc::clone(&self.marker);
            let waker = cx.waker().clone();

            tokio::spawn(async move {
                loop {
                    match driver.query_marker(&marker) {
                        Ok(MarkerStatus::Complete) => {
                            let _ = tx.send(Ok(()));
                            waker.wake();
                            break;
                        }
                        Ok(MarkerStatus::Pending) => {
                            tokio::task::yield_now().await;
                        }
                        Err(error) => {
                            let _ = tx.send(Err(error));
                            waker.wake();
                            break;
                        }
                    }
                }
            });

            self.receiver = Some(rx);
        }

        match self.receiver.as_mut().unwrap().poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(crate::error::TransferError::DriverOperationFailed {
                operation: crate::error::DriverOp::MarkerQuery,
                code: -1,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::HostDriver;
    use std::time::Duration;

    #[test]
    fn fresh_unrecorded_marker_is_pending() {
        let driver = Arc::new(HostDriver::new());
        let tracker = CompletionTracker::new(Arc::clone(&driver));
        let marker = driver.create_marker().unwrap();
        assert_eq!(tracker.poll(&marker).unwrap(), MarkerStatus::Pending);
    }

    #[test]
    fn wait_then_poll_is_idempotently_complete() {
        let driver = Arc::new(HostDriver::with_op_delay(Duration::from_millis(5)));
        let tracker = CompletionTracker::new(Arc::clone(&driver));
        let queue = driver.create_queue();

        let marker = tracker.create_marker(&queue).unwrap();
        tracker.wait(&marker).unwrap();

        for _ in 0..10 {
            assert_eq!(tracker.poll(&marker).unwrap(), MarkerStatus::Complete);
        }
        // waiting again is a no-op
        tracker.wait(&marker).unwrap();
    }

    #[tokio::test]
    async fn marker_waiter_resolves() {
        let driver = Arc::new(HostDriver::with_op_delay(Duration::from_millis(10)));
        let tracker = CompletionTracker::new(Arc::clone(&driver));
        let queue = driver.create_queue();

        let marker = Arc::new(tracker.create_marker(&queue).unwrap());
        MarkerWaiter::new(Arc::clone(&driver), Arc::clone(&marker))
            .await
            .unwrap();
        assert_eq!(tracker.poll(&marker).unwrap(), MarkerStatus::Complete);
    }
}
