//! Device driver abstraction for asynchronous copies and queue-ordered markers.
//!
//! The transfer engine never talks to a concrete driver API directly. Everything it
//! needs from the device side is captured by [`TransferDriver`]: asynchronous copies
//! in both directions, completion markers that can be recorded/polled/waited, and
//! queue-ordered host callbacks. Queues are created and owned by the caller; the
//! engine only enqueues work on them.
//!
//! Two implementations ship with the crate:
//!
//! - [`host::HostDriver`] simulates an ordered device queue in-process, which keeps
//!   the whole engine exercisable without hardware.
//! - `cuda::CudaDriver` (behind the `cuda` feature) binds the same surface to the
//!   CUDA driver API through a small C shim.

pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

use crate::error::Result;

/// Opaque device memory address.
///
/// For the CUDA driver this is a raw device pointer; for the loopback driver it is
/// an offset into the simulated device arena. Byte offsets are applied with
/// [`DevicePtr::offset`] in either case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Wrap a raw device address.
    pub const fn new(raw: u64) -> Self {
        DevicePtr(raw)
    }

    /// The raw device address.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Address `bytes` past this one.
    pub const fn offset(self, bytes: u64) -> Self {
        DevicePtr(self.0 + bytes)
    }
}

/// Non-blocking completion marker query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Work enqueued before the marker has not yet retired.
    Pending,
    /// The queue has processed everything enqueued before the marker.
    Complete,
}

/// The driver surface consumed by the transfer engine.
///
/// Same-queue operations execute in FIFO submission order; operations on
/// different queues may overlap. Callbacks registered with [`add_callback`]
/// run after every operation enqueued before them on the same queue and
/// before every operation enqueued after.
///
/// [`add_callback`]: TransferDriver::add_callback
pub trait TransferDriver: Send + Sync + 'static {
    /// Ordered command submission channel, created and owned by the caller.
    type Queue: Send + Sync;
    /// Completion marker recordable against a queue.
    type Marker: Send + Sync + 'static;

    /// Enqueue an asynchronous host-to-device copy of `len` bytes on `queue`.
    ///
    /// # Safety
    ///
    /// `src` must point to `len` readable bytes that stay valid and unmodified
    /// until the copy has retired on `queue`.
    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()>;

    /// Enqueue an asynchronous device-to-host copy of `len` bytes on `queue`.
    ///
    /// # Safety
    ///
    /// `dst` must point to `len` writable bytes that stay valid and otherwise
    /// untouched until the copy has retired on `queue`.
    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()>;

    /// Allocate a completion marker. A marker that was never recorded reports
    /// [`MarkerStatus::Pending`].
    fn create_marker(&self) -> Result<Self::Marker>;

    /// Record `marker` against the current tail of `queue`.
    fn record_marker(&self, marker: &Self::Marker, queue: &Self::Queue) -> Result<()>;

    /// Non-blocking completion query.
    fn query_marker(&self, marker: &Self::Marker) -> Result<MarkerStatus>;

    /// Block the calling thread until the queue has processed all work
    /// enqueued before `marker` was recorded.
    fn wait_marker(&self, marker: &Self::Marker) -> Result<()>;

    /// Register a host callback ordered behind everything currently enqueued
    /// on `queue`.
    ///
    /// If registration fails, the implementation must drop `callback` (running
    /// its destructors) only after draining work already enqueued on `queue`,
    /// so resources owned by the callback are not recycled under an in-flight
    /// operation.
    fn add_callback(&self, queue: &Self::Queue, callback: Box<dyn FnOnce() + Send>) -> Result<()>;
}
