//! CUDA driver API binding.
//!
//! Binds [`TransferDriver`] to CUDA streams and events through a small C shim
//! (`cuda_shim.cu`) compiled by the build script. Streams map to queues and
//! events map to completion markers; host callbacks use `cuStreamAddCallback`
//! with a boxed-closure trampoline.

use std::os::raw::{c_int, c_void};
use tracing::warn;

use crate::driver::{DevicePtr, MarkerStatus, TransferDriver};
use crate::error::{check_driver, DriverOp, Result, TransferError};

/// `CUDA_ERROR_NOT_READY`: the only non-zero event query code that does not
/// indicate a failure.
const CUDA_ERROR_NOT_READY: c_int = 600;

extern "C" {
    fn staging_stream_create(stream: *mut *mut c_void) -> c_int;
    fn staging_stream_destroy(stream: *mut c_void) -> c_int;
    fn staging_stream_synchronize(stream: *mut c_void) -> c_int;
    fn staging_event_create(event: *mut *mut c_void) -> c_int;
    fn staging_event_destroy(event: *mut c_void) -> c_int;
    fn staging_event_record(event: *mut c_void, stream: *mut c_void) -> c_int;
    fn staging_event_query(event: *mut c_void) -> c_int;
    fn staging_event_synchronize(event: *mut c_void) -> c_int;
    fn staging_memcpy_htod_async(dst: u64, src: *const c_void, len: usize, stream: *mut c_void) -> c_int;
    fn staging_memcpy_dtoh_async(dst: *mut c_void, src: u64, len: usize, stream: *mut c_void) -> c_int;
    fn staging_stream_add_callback(
        stream: *mut c_void,
        callback: extern "C" fn(*mut c_void),
        user_data: *mut c_void,
    ) -> c_int;
}

/// Trampoline invoked by the shim on the driver's callback thread.
extern "C" fn run_boxed_callback(user_data: *mut c_void) {
    let callback = unsafe { Box::from_raw(user_data as *mut Box<dyn FnOnce() + Send>) };
    callback();
}

/// A CUDA stream owned by the caller.
pub struct CudaStream {
    raw: *mut c_void,
}

unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl CudaStream {
    /// The raw stream handle.
    pub fn raw_handle(&self) -> *mut c_void {
        self.raw
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            let code = unsafe { staging_stream_destroy(self.raw) };
            if code != 0 {
                warn!(code, "failed to destroy CUDA stream");
            }
        }
    }
}

/// A CUDA event used as a completion marker.
pub struct CudaEvent {
    raw: *mut c_void,
}

unsafe impl Send for CudaEvent {}
unsafe impl Sync for CudaEvent {}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            let code = unsafe { staging_event_destroy(self.raw) };
            if code != 0 {
                warn!(code, "failed to destroy CUDA event");
            }
        }
    }
}

/// [`TransferDriver`] implementation over the CUDA driver API.
pub struct CudaDriver;

impl CudaDriver {
    pub fn new() -> Self {
        CudaDriver
    }

    /// Create a new stream. The stream is owned by the caller and only ever
    /// enqueued on by the engine.
    pub fn create_stream(&self) -> Result<CudaStream> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let code = unsafe { staging_stream_create(&mut raw) };
        check_driver(code, DriverOp::QueueCreate)?;
        Ok(CudaStream { raw })
    }
}

impl Default for CudaDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferDriver for CudaDriver {
    type Queue = CudaStream;
    type Marker = CudaEvent;

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()> {
        let code = staging_memcpy_htod_async(dst.raw(), src as *const c_void, len, queue.raw);
        check_driver(code, DriverOp::HostToDeviceCopy)
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()> {
        let code = staging_memcpy_dtoh_async(dst as *mut c_void, src.raw(), len, queue.raw);
        check_driver(code, DriverOp::DeviceToHostCopy)
    }

    fn create_marker(&self) -> Result<Self::Marker> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let code = unsafe { staging_event_create(&mut raw) };
        check_driver(code, DriverOp::MarkerCreate)?;
        Ok(CudaEvent { raw })
    }

    fn record_marker(&self, marker: &Self::Marker, queue: &Self::Queue) -> Result<()> {
        let code = unsafe { staging_event_record(marker.raw, queue.raw) };
        check_driver(code, DriverOp::MarkerRecord)
    }

    fn query_marker(&self, marker: &Self::Marker) -> Result<MarkerStatus> {
        let code = unsafe { staging_event_query(marker.raw) };
        match code {
            0 => Ok(MarkerStatus::Complete),
            CUDA_ERROR_NOT_READY => Ok(MarkerStatus::Pending),
            _ => Err(TransferError::DriverOperationFailed {
                operation: DriverOp::MarkerQuery,
                code,
            }),
        }
    }

    fn wait_marker(&self, marker: &Self::Marker) -> Result<()> {
        let code = unsafe { staging_event_synchronize(marker.raw) };
        check_driver(code, DriverOp::MarkerWait)
    }

    fn add_callback(&self, queue: &Self::Queue, callback: Box<dyn FnOnce() + Send>) -> Result<()> {
        let boxed: Box<Box<dyn FnOnce() + Send>> = Box::new(callback);
        let user_data = Box::into_raw(boxed) as *mut c_void;
        let code = unsafe { staging_stream_add_callback(queue.raw, run_boxed_callback, user_data) };
        if code != 0 {
            // drain the stream before dropping the callback so nothing it owns
            // is recycled under an in-flight copy
            let sync_code = unsafe { staging_stream_synchronize(queue.raw) };
            if sync_code != 0 {
                warn!(code = sync_code, "could not drain stream after callback failure");
            }
            drop(unsafe { Box::from_raw(user_data as *mut Box<dyn FnOnce() + Send>) });
            return Err(TransferError::DriverOperationFailed {
                operation: DriverOp::CallbackRegister,
                code,
            });
        }
        Ok(())
    }
}
