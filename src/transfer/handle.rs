//! Transfer handles and their lifecycle state machine.
//!
//! Every transfer moves through
//! `Created -> Enqueued -> MarkerRecorded -> Completed -> Released`, with
//! `MarkerRecorded` skipped by fire-and-forget writes and `Failed` as the
//! other terminal state. Transitions are forward-only and a terminal state is
//! reached exactly once.

use metrics::histogram;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use crate::driver::{MarkerStatus, TransferDriver};
use crate::element::{HostPod, HostViewMut};
use crate::error::{Result, TransferError};
use crate::staging::StagingLease;
use crate::transfer::tracker::MarkerWaiter;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl Direction {
    /// Stable label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Direction::HostToDevice => "host_to_device",
            Direction::DeviceToHost => "device_to_host",
        }
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Enqueued,
    MarkerRecorded,
    Completed,
    Released,
    Failed,
}

fn rank(state: TransferState) -> u8 {
    match state {
        TransferState::Created => 0,
        TransferState::Enqueued => 1,
        TransferState::MarkerRecorded => 2,
        TransferState::Completed => 3,
        TransferState::Released => 4,
        TransferState::Failed => 5,
    }
}

/// Observable status of an in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Complete,
    Failed,
}

struct StateSlot {
    state: TransferState,
    error: Option<TransferError>,
}

/// Shared lifecycle cell, advanced by the dispatcher and by completion
/// callbacks running on driver threads.
pub(crate) struct StateCell {
    slot: Mutex<StateSlot>,
    changed: Condvar,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell {
            slot: Mutex::new(StateSlot {
                state: TransferState::Created,
                error: None,
            }),
            changed: Condvar::new(),
        }
    }

    /// Move forward to `next`; transitions backwards or out of a terminal
    /// state are ignored.
    pub(crate) fn advance(&self, next: TransferState) {
        let mut slot = self.slot.lock();
        if matches!(slot.state, TransferState::Released | TransferState::Failed) {
            return;
        }
        if rank(next) > rank(slot.state) {
            slot.state = next;
            self.changed.notify_all();
        }
    }

    /// Enter the failed terminal state, recording the cause.
    pub(crate) fn fail(&self, error: TransferError) {
        let mut slot = self.slot.lock();
        if matches!(slot.state, TransferState::Released | TransferState::Failed) {
            return;
        }
        slot.state = TransferState::Failed;
        slot.error = Some(error);
        self.changed.notify_all();
    }

    pub(crate) fn get(&self) -> TransferState {
        self.slot.lock().state
    }

    pub(crate) fn failure(&self) -> Option<TransferError> {
        self.slot.lock().error.clone()
    }

    /// Block until a terminal state is reached.
    pub(crate) fn wait_terminal(&self) -> TransferState {
        let mut slot = self.slot.lock();
        while !matches!(slot.state, TransferState::Released | TransferState::Failed) {
            self.changed.wait(&mut slot);
        }
        slot.state
    }
}

/// Handle to a tracked host-to-device transfer.
///
/// The staging buffer was handed to the completion path at dispatch; the
/// handle only observes progress. `wait` returns once the device copy has
/// retired *and* the buffer is back in the pool.
pub struct Transfer<D: TransferDriver> {
    id: Uuid,
    driver: Arc<D>,
    marker: Arc<D::Marker>,
    state: Arc<StateCell>,
    length: usize,
    enqueued_at: Instant,
}

impl<D: TransferDriver> Transfer<D> {
    pub(crate) fn new(
        id: Uuid,
        driver: Arc<D>,
        marker: Arc<D::Marker>,
        state: Arc<StateCell>,
        length: usize,
        enqueued_at: Instant,
    ) -> Self {
        Transfer {
            id,
            driver,
            marker,
            state,
            length,
            enqueued_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        Direction::HostToDevice
    }

    /// Byte length of the transfer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        self.state.get()
    }

    /// Time since the device copy was enqueued.
    pub fn elapsed(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// Non-blocking completion query.
    pub fn poll(&self) -> Result<TransferStatus> {
        if self.state.failure().is_some() {
            return Ok(TransferStatus::Failed);
        }
        match self.driver.query_marker(&self.marker)? {
            MarkerStatus::Pending => Ok(TransferStatus::Pending),
            MarkerStatus::Complete => Ok(TransferStatus::Complete),
        }
    }

    /// Block until the transfer has retired and its staging buffer has been
    /// released back to the pool.
    pub fn wait(&self) -> Result<()> {
        // skip the blocking driver call when the marker already reports done
        if self.driver.query_marker(&self.marker)? == MarkerStatus::Pending {
            self.driver.wait_marker(&self.marker)?;
        }
        self.state.wait_terminal();
        if let Some(error) = self.state.failure() {
            return Err(error);
        }
        Ok(())
    }

    /// Tokio-friendly variant of [`wait`](Transfer::wait).
    pub async fn wait_async(&self) -> Result<()> {
        MarkerWaiter::new(Arc::clone(&self.driver), Arc::clone(&self.marker)).await?;
        loop {
            match self.state.get() {
                TransferState::Released => return Ok(()),
                TransferState::Failed => {
                    return Err(self
                        .state
                        .failure()
                        .unwrap_or(TransferError::DriverOperationFailed {
                            operation: crate::error::DriverOp::MarkerWait,
                            code: -1,
                        }))
                }
                _ => tokio::task::yield_now().await,
            }
        }
    }
}

/// Send-safe destination pointer carried across `.await` points.
#[derive(Clone, Copy)]
struct SendMutPtr(*mut u8);
unsafe impl Send for SendMutPtr {}

/// Handle to an in-flight device-to-host transfer.
///
/// The readback owns its staging buffer until completion: `wait_into` waits
/// for the device copy to retire, copies the staged bytes into the caller's
/// array, and releases the buffer. An abandoned readback synchronizes before
/// releasing so the buffer is never recycled under an in-flight write.
pub struct Readback<D: TransferDriver> {
    id: Uuid,
    driver: Arc<D>,
    marker: Arc<D::Marker>,
    state: Arc<StateCell>,
    lease: Option<StagingLease>,
    length: usize,
    enqueued_at: Instant,
}

impl<D: TransferDriver> Readback<D> {
    pub(crate) fn new(
        id: Uuid,
        driver: Arc<D>,
        marker: Arc<D::Marker>,
        state: Arc<StateCell>,
        lease: StagingLease,
        length: usize,
        enqueued_at: Instant,
    ) -> Self {
        Readback {
            id,
            driver,
            marker,
            state,
            lease: Some(lease),
            length,
            enqueued_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        Direction::DeviceToHost
    }

    /// Byte length of the transfer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        self.state.get()
    }

    /// Non-blocking completion query.
    pub fn poll(&self) -> Result<TransferStatus> {
        if self.state.failure().is_some() {
            return Ok(TransferStatus::Failed);
        }
        match self.driver.query_marker(&self.marker)? {
            MarkerStatus::Pending => Ok(TransferStatus::Pending),
            MarkerStatus::Complete => Ok(TransferStatus::Complete),
        }
    }

    /// Block until the device copy retires, then copy the staged bytes into
    /// `dst` starting at `dst_offset` (a byte offset) and release the buffer.
    pub fn wait_into<T: HostPod>(mut self, dst: &mut [T], dst_offset: usize) -> Result<()> {
        let view = HostViewMut::new(dst);
        let dst_ptr = match view.byte_range_mut(dst_offset, self.length) {
            Ok(ptr) => ptr,
            Err(error) => {
                self.abort(error.clone());
                return Err(error);
            }
        };
        self.finish_into(dst_ptr)
    }

    /// Byte-level completion used by the dispatcher's blocking path. `dst`
    /// must point to `length` writable bytes.
    pub(crate) fn finish_into(mut self, dst: *mut u8) -> Result<()> {
        if let Err(error) = self.synchronize() {
            self.abort(error.clone());
            return Err(error);
        }
        self.complete_into(dst);
        Ok(())
    }

    /// Tokio-friendly variant of [`wait_into`](Readback::wait_into).
    pub async fn wait_into_async<T: HostPod>(
        mut self,
        dst: &mut [T],
        dst_offset: usize,
    ) -> Result<()> {
        let view = HostViewMut::new(dst);
        let dst_ptr = match view.byte_range_mut(dst_offset, self.length) {
            Ok(ptr) => SendMutPtr(ptr),
            Err(error) => {
                self.abort(error.clone());
                return Err(error);
            }
        };

        let waiter = MarkerWaiter::new(Arc::clone(&self.driver), Arc::clone(&self.marker));
        if let Err(error) = waiter.await {
            self.abort(error.clone());
            return Err(error);
        }
        self.complete_into(dst_ptr.0);
        Ok(())
    }

    /// Poll-first marker synchronization.
    fn synchronize(&self) -> Result<()> {
        if self.driver.query_marker(&self.marker)? == MarkerStatus::Pending {
            self.driver.wait_marker(&self.marker)?;
        }
        Ok(())
    }

    fn complete_into(&mut self, dst: *mut u8) {
        self.state.advance(TransferState::Completed);
        if let Some(lease) = self.lease.take() {
            unsafe { lease.copy_out(dst, self.length) };
            drop(lease);
        }
        self.state.advance(TransferState::Released);
        histogram!("staging_completion_seconds").record(self.enqueued_at.elapsed().as_secs_f64());
    }

    /// Release the buffer and record the failure. The copy never reaches the
    /// caller's array.
    fn abort(&mut self, error: TransferError) {
        if let Some(lease) = self.lease.take() {
            drop(lease);
        }
        self.state.fail(error);
    }
}

impl<D: TransferDriver> Drop for Readback<D> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            // never recycle a buffer the device may still be writing into
            if self.driver.wait_marker(&self.marker).is_err() {
                warn!(id = %self.id, "abandoned readback could not be synchronized before release");
            }
            drop(lease);
            self.state.advance(TransferState::Released);
        }
    }
}
