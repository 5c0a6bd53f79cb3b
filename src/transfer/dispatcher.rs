//! The transfer dispatcher.
//!
//! Owns the staging pool and the completion tracker, and exposes the four
//! transfer operations: fire-and-forget and tracked host-to-device writes,
//! blocking and deferred device-to-host reads. All element types share one
//! byte-level code path; the typed entry points are thin wrappers over the
//! tagged-view core.
//!
//! Failure handling is strict: every driver result is checked and surfaced to
//! the caller, and a staging buffer acquired for a failed dispatch always
//! returns to the pool. When a failure leaves an async copy possibly in
//! flight, the queue is drained before the buffer is released so its memory
//! is never recycled under the device.

use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::driver::{DevicePtr, TransferDriver};
use crate::element::{HostPod, HostView, HostViewMut};
use crate::error::Result;
use crate::staging::{StagingLease, StagingPool};
use crate::transfer::handle::{Direction, Readback, StateCell, Transfer, TransferState};
use crate::transfer::tracker::CompletionTracker;

/// Dispatches asynchronous transfers through pooled staging buffers.
///
/// The dispatcher is `Sync`; any number of caller threads may dispatch
/// concurrently onto any queues they own.
pub struct TransferDispatcher<D: TransferDriver> {
    driver: Arc<D>,
    pool: Arc<StagingPool>,
    tracker: CompletionTracker<D>,
}

impl<D: TransferDriver> TransferDispatcher<D> {
    /// Create a dispatcher over `driver`, taking ownership of `pool`.
    pub fn new(driver: Arc<D>, pool: StagingPool) -> Self {
        TransferDispatcher {
            tracker: CompletionTracker::new(Arc::clone(&driver)),
            pool: Arc::new(pool),
            driver,
        }
    }

    /// The staging pool backing this dispatcher.
    pub fn pool(&self) -> &StagingPool {
        &self.pool
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// The completion tracker for direct marker use.
    pub fn tracker(&self) -> &CompletionTracker<D> {
        &self.tracker
    }

    /// Fire-and-forget asynchronous host-to-device copy.
    ///
    /// Stages `length` bytes from `src` at byte offset `src_offset`, enqueues
    /// the device copy on `queue` and returns once it is enqueued. The staging
    /// buffer is recycled by a queue-ordered callback after the copy retires.
    pub fn copy_host_to_device<T: HostPod>(
        &self,
        dst: DevicePtr,
        dst_offset: u64,
        length: usize,
        src: &[T],
        src_offset: usize,
        queue: &D::Queue,
    ) -> Result<()> {
        self.copy_host_to_device_view(dst, dst_offset, length, HostView::new(src), src_offset, queue)
    }

    /// Tag-dispatched variant of [`copy_host_to_device`] for callers carrying
    /// a runtime element type.
    ///
    /// [`copy_host_to_device`]: TransferDispatcher::copy_host_to_device
    pub fn copy_host_to_device_view(
        &self,
        dst: DevicePtr,
        dst_offset: u64,
        length: usize,
        src: HostView<'_>,
        src_offset: usize,
        queue: &D::Queue,
    ) -> Result<()> {
        let id = Uuid::new_v4();
        let (lease, enqueued_at) = self
            .stage_and_enqueue(dst, dst_offset, length, src, src_offset, queue)
            .map_err(|e| self.note_failure(Direction::HostToDevice, e))?;

        let state = Arc::new(StateCell::new());
        state.advance(TransferState::Enqueued);
        self.tracker
            .on_complete(queue, lease, Arc::clone(&state), enqueued_at)
            .map_err(|e| self.note_failure(Direction::HostToDevice, e))?;

        debug!(id = %id, length, "host-to-device transfer enqueued");
        Ok(())
    }

    /// Asynchronous host-to-device copy with an awaitable handle.
    ///
    /// Same dispatch as [`copy_host_to_device`], plus a completion marker
    /// recorded after the copy. The returned [`Transfer`] can be polled or
    /// waited; its `wait` also covers the buffer's return to the pool.
    ///
    /// [`copy_host_to_device`]: TransferDispatcher::copy_host_to_device
    pub fn copy_host_to_device_tracked<T: HostPod>(
        &self,
        dst: DevicePtr,
        dst_offset: u64,
        length: usize,
        src: &[T],
        src_offset: usize,
        queue: &D::Queue,
    ) -> Result<Transfer<D>> {
        self.copy_host_to_device_tracked_view(
            dst,
            dst_offset,
            length,
            HostView::new(src),
            src_offset,
            queue,
        )
    }

    /// Tag-dispatched variant of [`copy_host_to_device_tracked`].
    ///
    /// [`copy_host_to_device_tracked`]: TransferDispatcher::copy_host_to_device_tracked
    pub fn copy_host_to_device_tracked_view(
        &self,
        dst: DevicePtr,
        dst_offset: u64,
        length: usize,
        src: HostView<'_>,
        src_offset: usize,
        queue: &D::Queue,
    ) -> Result<Transfer<D>> {
        let id = Uuid::new_v4();
        let (lease, enqueued_at) = self
            .stage_and_enqueue(dst, dst_offset, length, src, src_offset, queue)
            .map_err(|e| self.note_failure(Direction::HostToDevice, e))?;

        let state = Arc::new(StateCell::new());
        state.advance(TransferState::Enqueued);

        let marker = match self.tracker.create_marker(queue) {
            Ok(marker) => Arc::new(marker),
            Err(error) => {
                // the copy may still be in flight; drain before the lease
                // drop hands the buffer back
                self.settle_queue(queue);
                drop(lease);
                return Err(self.note_failure(Direction::HostToDevice, error));
            }
        };
        state.advance(TransferState::MarkerRecorded);

        self.tracker
            .on_complete(queue, lease, Arc::clone(&state), enqueued_at)
            .map_err(|e| self.note_failure(Direction::HostToDevice, e))?;

        debug!(id = %id, length, "tracked host-to-device transfer enqueued");
        Ok(Transfer::new(
            id,
            Arc::clone(&self.driver),
            marker,
            state,
            length,
            enqueued_at,
        ))
    }

    /// Blocking device-to-host copy.
    ///
    /// Enqueues the device read into a staging buffer, waits for it to retire
    /// and copies the bytes into `dst` at byte offset `dst_offset`.
    pub fn copy_device_to_host<T: HostPod>(
        &self,
        src: DevicePtr,
        src_offset: u64,
        length: usize,
        dst: &mut [T],
        dst_offset: usize,
        queue: &D::Queue,
    ) -> Result<()> {
        // validate the destination before enqueuing any device work
        let dst_ptr = HostViewMut::new(dst).byte_range_mut(dst_offset, length)?;
        let readback = self.begin_copy_device_to_host(src, src_offset, length, queue)?;
        readback.finish_into(dst_ptr)
    }

    /// Tag-dispatched variant of [`copy_device_to_host`].
    ///
    /// [`copy_device_to_host`]: TransferDispatcher::copy_device_to_host
    pub fn copy_device_to_host_view(
        &self,
        src: DevicePtr,
        src_offset: u64,
        length: usize,
        dst: &HostViewMut<'_>,
        dst_offset: usize,
        queue: &D::Queue,
    ) -> Result<()> {
        let dst_ptr = dst.byte_range_mut(dst_offset, length)?;
        let readback = self.begin_copy_device_to_host(src, src_offset, length, queue)?;
        readback.finish_into(dst_ptr)
    }

    /// Non-blocking device-to-host copy.
    ///
    /// Returns a [`Readback`] owning the staging buffer; completion, the copy
    /// into the caller's array and the buffer's release all happen in
    /// [`Readback::wait_into`].
    pub fn begin_copy_device_to_host(
        &self,
        src: DevicePtr,
        src_offset: u64,
        length: usize,
        queue: &D::Queue,
    ) -> Result<Readback<D>> {
        let id = Uuid::new_v4();
        let lease = self
            .pool
            .acquire(length)
            .map_err(|e| self.note_failure(Direction::DeviceToHost, e))?;

        let enqueued_at = Instant::now();
        if let Err(error) = unsafe {
            self.driver
                .copy_to_host_async(lease.as_mut_ptr(), src.offset(src_offset), length, queue)
        } {
            // nothing was enqueued; the buffer can go straight back
            drop(lease);
            return Err(self.note_failure(Direction::DeviceToHost, error));
        }

        let state = Arc::new(StateCell::new());
        state.advance(TransferState::Enqueued);

        let marker = match self.tracker.create_marker(queue) {
            Ok(marker) => Arc::new(marker),
            Err(error) => {
                self.settle_queue(queue);
                drop(lease);
                return Err(self.note_failure(Direction::DeviceToHost, error));
            }
        };
        state.advance(TransferState::MarkerRecorded);

        counter!("staging_transfers_total", "direction" => Direction::DeviceToHost.label())
            .increment(1);
        counter!("staging_transfer_bytes_total", "direction" => Direction::DeviceToHost.label())
            .increment(length as u64);

        debug!(id = %id, length, "device-to-host transfer enqueued");
        Ok(Readback::new(
            id,
            Arc::clone(&self.driver),
            marker,
            state,
            lease,
            length,
            enqueued_at,
        ))
    }

    /// Shared host-to-device prolog: validate, stage, enqueue.
    fn stage_and_enqueue(
        &self,
        dst: DevicePtr,
        dst_offset: u64,
        length: usize,
        src: HostView<'_>,
        src_offset: usize,
        queue: &D::Queue,
    ) -> Result<(StagingLease, Instant)> {
        let src_ptr = src.byte_range(src_offset, length)?;
        let mut lease = self.pool.acquire(length)?;

        let copy_started = Instant::now();
        unsafe { lease.copy_in(src_ptr, length) };
        histogram!("staging_host_copy_seconds").record(copy_started.elapsed().as_secs_f64());

        let enqueued_at = Instant::now();
        unsafe {
            // on failure nothing was enqueued and the lease drop releases
            self.driver
                .copy_to_device_async(dst.offset(dst_offset), lease.as_ptr(), length, queue)?;
        }

        counter!("staging_transfers_total", "direction" => Direction::HostToDevice.label())
            .increment(1);
        counter!("staging_transfer_bytes_total", "direction" => Direction::HostToDevice.label())
            .increment(length as u64);

        Ok((lease, enqueued_at))
    }

    /// Best-effort drain of `queue`, used before recycling a buffer on a
    /// failure path that may have left a copy in flight.
    fn settle_queue(&self, queue: &D::Queue) {
        let marker = match self.driver.create_marker() {
            Ok(marker) => marker,
            Err(error) => {
                warn!(error = %error, "could not settle queue after dispatch failure");
                return;
            }
        };
        if let Err(error) = self.driver.record_marker(&marker, queue) {
            warn!(error = %error, "could not settle queue after dispatch failure");
            return;
        }
        if let Err(error) = self.driver.wait_marker(&marker) {
            warn!(error = %error, "queue settle wait failed");
        }
    }

    fn note_failure(
        &self,
        direction: Direction,
        error: crate::error::TransferError,
    ) -> crate::error::TransferError {
        counter!("staging_transfers_failed_total", "direction" => direction.label()).increment(1);
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;
    use crate::driver::host::{HostDriver, HostMarker, HostQueue};
    use crate::driver::MarkerStatus;
    use crate::error::{DriverOp, TransferError};

    fn pool(initial: usize, max: usize) -> StagingPool {
        StagingPool::new(StagingConfig {
            buffer_capacity: 4096,
            initial_buffers: initial,
            max_buffers: max,
            ..Default::default()
        })
        .unwrap()
    }

    /// Delegates everything to a real loopback driver but fails all copies.
    struct FaultyDriver {
        inner: HostDriver,
    }

    impl TransferDriver for FaultyDriver {
        type Queue = HostQueue;
        type Marker = HostMarker;

        unsafe fn copy_to_device_async(
            &self,
            _dst: DevicePtr,
            _src: *const u8,
            _len: usize,
            _queue: &Self::Queue,
        ) -> Result<()> {
            Err(TransferError::DriverOperationFailed {
                operation: DriverOp::HostToDeviceCopy,
                code: 700,
            })
        }

        unsafe fn copy_to_host_async(
            &self,
            _dst: *mut u8,
            _src: DevicePtr,
            _len: usize,
            _queue: &Self::Queue,
        ) -> Result<()> {
            Err(TransferError::DriverOperationFailed {
                operation: DriverOp::DeviceToHostCopy,
                code: 700,
            })
        }

        fn create_marker(&self) -> Result<Self::Marker> {
            self.inner.create_marker()
        }

        fn record_marker(&self, marker: &Self::Marker, queue: &Self::Queue) -> Result<()> {
            self.inner.record_marker(marker, queue)
        }

        fn query_marker(&self, marker: &Self::Marker) -> Result<MarkerStatus> {
            self.inner.query_marker(marker)
        }

        fn wait_marker(&self, marker: &Self::Marker) -> Result<()> {
            self.inner.wait_marker(marker)
        }

        fn add_callback(
            &self,
            queue: &Self::Queue,
            callback: Box<dyn FnOnce() + Send>,
        ) -> Result<()> {
            self.inner.add_callback(queue, callback)
        }
    }

    #[test]
    fn invalid_length_is_rejected_before_dispatch() {
        let driver = Arc::new(HostDriver::new());
        let dispatcher = TransferDispatcher::new(Arc::clone(&driver), pool(1, 1));
        let queue = driver.create_queue();
        let dst = driver.alloc(64);

        let src = [0.0f32; 16];
        // 10 bytes of 4-byte elements must fail, never truncate
        let err = dispatcher
            .copy_host_to_device(dst, 0, 10, &src[..], 0, &queue)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidLength {
                length: 10,
                element_size: 4
            }
        ));
        // nothing was acquired
        assert_eq!(dispatcher.pool().stats().in_use, 0);
    }

    #[test]
    fn host_range_is_bounds_checked() {
        let driver = Arc::new(HostDriver::new());
        let dispatcher = TransferDispatcher::new(Arc::clone(&driver), pool(1, 1));
        let queue = driver.create_queue();
        let dst = driver.alloc(64);

        let src = [0u8; 16];
        let err = dispatcher
            .copy_host_to_device(dst, 0, 32, &src[..], 0, &queue)
            .unwrap_err();
        assert!(matches!(err, TransferError::RangeOutOfBounds { .. }));
    }

    #[test]
    fn failed_write_propagates_and_releases_buffer() {
        let faulty = Arc::new(FaultyDriver {
            inner: HostDriver::new(),
        });
        let dispatcher = TransferDispatcher::new(Arc::clone(&faulty), pool(1, 1));
        let queue = faulty.inner.create_queue();
        let dst = DevicePtr::new(0);

        let src = [1u8; 64];
        let err = dispatcher
            .copy_host_to_device(dst, 0, 64, &src[..], 0, &queue)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::DriverOperationFailed {
                operation: DriverOp::HostToDeviceCopy,
                code: 700
            }
        ));
        // the staging buffer went back to the pool despite the failure
        let stats = dispatcher.pool().stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, stats.total_buffers);
    }

    #[test]
    fn failed_read_propagates_and_releases_buffer() {
        let faulty = Arc::new(FaultyDriver {
            inner: HostDriver::new(),
        });
        let dispatcher = TransferDispatcher::new(Arc::clone(&faulty), pool(1, 1));
        let queue = faulty.inner.create_queue();

        let mut dst = [0u8; 64];
        let err = dispatcher
            .copy_device_to_host(DevicePtr::new(0), 0, 64, &mut dst[..], 0, &queue)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::DriverOperationFailed {
                operation: DriverOp::DeviceToHostCopy,
                ..
            }
        ));
        assert_eq!(dispatcher.pool().stats().in_use, 0);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let driver = Arc::new(HostDriver::new());
        let dispatcher = TransferDispatcher::new(Arc::clone(&driver), pool(1, 1));
        let queue = driver.create_queue();
        let dst = driver.alloc(64);

        let src = [0i64; 8];
        let err = dispatcher
            .copy_host_to_device(dst, 0, 16, &src[..], 4, &queue)
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidLength { .. }));
    }
}
