//! In-process loopback driver.
//!
//! Simulates a device with a flat byte arena and one worker thread per queue, so the
//! full transfer path (ordered async copies, markers, queue callbacks) runs without
//! hardware. Each queue drains its operations in submission order, which is exactly
//! the FIFO contract real command streams provide. An optional per-operation delay
//! makes the asynchrony observable in tests.

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::driver::{DevicePtr, MarkerStatus, TransferDriver};
use crate::error::Result;

/// Raw pointer wrappers that may cross into the queue worker thread.
///
/// Validity until the operation retires is the submitting caller's contract,
/// mirroring what a real DMA engine requires.
#[derive(Clone, Copy)]
struct ConstPtr(*const u8);
unsafe impl Send for ConstPtr {}

#[derive(Clone, Copy)]
struct MutPtr(*mut u8);
unsafe impl Send for MutPtr {}

/// One operation submitted to a queue worker.
enum QueueOp {
    CopyToDevice { dst: u64, src: ConstPtr, len: usize },
    CopyToHost { dst: MutPtr, src: u64, len: usize },
    Signal(Arc<MarkerState>),
    Callback(Box<dyn FnOnce() + Send>),
    Shutdown,
}

impl QueueOp {
    fn execute(self, arena: &Mutex<Vec<u8>>) {
        match self {
            QueueOp::CopyToDevice { dst, src, len } => {
                let mut mem = arena.lock();
                let dst = dst as usize;
                // an out-of-range address is the simulated equivalent of a device fault
                let slice = &mut mem[dst..dst + len];
                unsafe { std::ptr::copy_nonoverlapping(src.0, slice.as_mut_ptr(), len) };
            }
            QueueOp::CopyToHost { dst, src, len } => {
                let mem = arena.lock();
                let src = src as usize;
                let slice = &mem[src..src + len];
                unsafe { std::ptr::copy_nonoverlapping(slice.as_ptr(), dst.0, len) };
            }
            QueueOp::Signal(state) => state.signal(),
            QueueOp::Callback(callback) => callback(),
            QueueOp::Shutdown => unreachable!("shutdown handled by the worker loop"),
        }
    }
}

/// Shared flag behind a completion marker.
struct MarkerState {
    done: Mutex<bool>,
    cond: Condvar,
}

impl MarkerState {
    fn new() -> Self {
        MarkerState {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Completion marker for the loopback driver.
pub struct HostMarker {
    state: Arc<MarkerState>,
}

/// Ordered command queue backed by a dedicated worker thread.
pub struct HostQueue {
    ops: Sender<QueueOp>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    fn submit(&self, op: QueueOp) {
        // send only fails once the worker has shut down, at which point the
        // queue handle itself is already being torn down
        let _ = self.ops.send(op);
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        let _ = self.ops.send(QueueOp::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// In-process driver simulating an asynchronous device.
pub struct HostDriver {
    arena: Arc<Mutex<Vec<u8>>>,
    op_delay: Option<Duration>,
}

impl HostDriver {
    /// Create a driver with an empty device arena.
    pub fn new() -> Self {
        HostDriver {
            arena: Arc::new(Mutex::new(Vec::new())),
            op_delay: None,
        }
    }

    /// Create a driver that sleeps before executing each queued operation,
    /// making overlap and ordering observable from tests.
    pub fn with_op_delay(delay: Duration) -> Self {
        HostDriver {
            arena: Arc::new(Mutex::new(Vec::new())),
            op_delay: Some(delay),
        }
    }

    /// Allocate `len` bytes of simulated device memory.
    pub fn alloc(&self, len: usize) -> DevicePtr {
        let mut arena = self.arena.lock();
        let base = arena.len();
        arena.resize(base + len, 0);
        DevicePtr::new(base as u64)
    }

    /// Create a new ordered command queue.
    pub fn create_queue(&self) -> HostQueue {
        let (tx, rx) = unbounded::<QueueOp>();
        let arena = Arc::clone(&self.arena);
        let delay = self.op_delay;
        let worker = thread::Builder::new()
            .name("host-queue".to_string())
            .spawn(move || {
                for op in rx {
                    if matches!(op, QueueOp::Shutdown) {
                        break;
                    }
                    if let Some(delay) = delay {
                        thread::sleep(delay);
                    }
                    op.execute(&arena);
                }
            })
            .expect("failed to spawn host queue worker");

        HostQueue {
            ops: tx,
            worker: Some(worker),
        }
    }

    /// Snapshot `len` bytes of simulated device memory.
    ///
    /// Reads directly from the arena without queue ordering; synchronize the
    /// queue first when asserting on transfer results.
    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Vec<u8> {
        let arena = self.arena.lock();
        let base = ptr.raw() as usize;
        arena[base..base + len].to_vec()
    }

    /// Overwrite simulated device memory, bypassing queue ordering.
    pub fn write_bytes(&self, ptr: DevicePtr, data: &[u8]) {
        let mut arena = self.arena.lock();
        let base = ptr.raw() as usize;
        arena[base..base + data.len()].copy_from_slice(data);
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferDriver for HostDriver {
    type Queue = HostQueue;
    type Marker = HostMarker;

    unsafe fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: *const u8,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()> {
        queue.submit(QueueOp::CopyToDevice {
            dst: dst.raw(),
            src: ConstPtr(src),
            len,
        });
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        dst: *mut u8,
        src: DevicePtr,
        len: usize,
        queue: &Self::Queue,
    ) -> Result<()> {
        queue.submit(QueueOp::CopyToHost {
            dst: MutPtr(dst),
            src: src.raw(),
            len,
        });
        Ok(())
    }

    fn create_marker(&self) -> Result<Self::Marker> {
        Ok(HostMarker {
            state: Arc::new(MarkerState::new()),
        })
    }

    fn record_marker(&self, marker: &Self::Marker, queue: &Self::Queue) -> Result<()> {
        queue.submit(QueueOp::Signal(Arc::clone(&marker.state)));
        Ok(())
    }

    fn query_marker(&self, marker: &Self::Marker) -> Result<MarkerStatus> {
        Ok(if marker.state.is_done() {
            MarkerStatus::Complete
        } else {
            MarkerStatus::Pending
        })
    }

    fn wait_marker(&self, marker: &Self::Marker) -> Result<()> {
        marker.state.wait();
        Ok(())
    }

    fn add_callback(&self, queue: &Self::Queue, callback: Box<dyn FnOnce() + Send>) -> Result<()> {
        queue.submit(QueueOp::Callback(callback));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn alloc_and_direct_access() {
        let driver = HostDriver::new();
        let ptr = driver.alloc(16);
        driver.write_bytes(ptr, &[7u8; 16]);
        assert_eq!(driver.read_bytes(ptr, 16), vec![7u8; 16]);

        // a second allocation must not alias the first
        let other = driver.alloc(16);
        assert_ne!(ptr.raw(), other.raw());
        assert_eq!(driver.read_bytes(other, 16), vec![0u8; 16]);
    }

    #[test]
    fn queue_executes_copies_in_order() {
        let driver = HostDriver::new();
        let queue = driver.create_queue();
        let dst = driver.alloc(4);

        let first = [1u8, 1, 1, 1];
        let second = [2u8, 2, 2, 2];
        unsafe {
            driver
                .copy_to_device_async(dst, first.as_ptr(), 4, &queue)
                .unwrap();
            driver
                .copy_to_device_async(dst, second.as_ptr(), 4, &queue)
                .unwrap();
        }
        let marker = driver.create_marker().unwrap();
        driver.record_marker(&marker, &queue).unwrap();
        driver.wait_marker(&marker).unwrap();

        assert_eq!(driver.read_bytes(dst, 4), second);
    }

    #[test]
    fn unrecorded_marker_is_pending() {
        let driver = HostDriver::new();
        let marker = driver.create_marker().unwrap();
        assert_eq!(driver.query_marker(&marker).unwrap(), MarkerStatus::Pending);
    }

    #[test]
    fn marker_completes_after_queued_work() {
        let driver = HostDriver::with_op_delay(Duration::from_millis(10));
        let queue = driver.create_queue();
        let dst = driver.alloc(8);
        let data = [9u8; 8];

        unsafe {
            driver
                .copy_to_device_async(dst, data.as_ptr(), 8, &queue)
                .unwrap();
        }
        let marker = driver.create_marker().unwrap();
        driver.record_marker(&marker, &queue).unwrap();

        driver.wait_marker(&marker).unwrap();
        assert_eq!(driver.query_marker(&marker).unwrap(), MarkerStatus::Complete);
        // repeated queries stay complete
        assert_eq!(driver.query_marker(&marker).unwrap(), MarkerStatus::Complete);
        assert_eq!(driver.read_bytes(dst, 8), data);
    }

    #[test]
    fn callback_runs_after_prior_operations() {
        let driver = HostDriver::with_op_delay(Duration::from_millis(50));
        let queue = driver.create_queue();
        let dst = driver.alloc(4);
        let data = [3u8; 4];

        let fired = Arc::new(AtomicBool::new(false));

        unsafe {
            driver
                .copy_to_device_async(dst, data.as_ptr(), 4, &queue)
                .unwrap();
        }
        // the copy has not retired yet
        assert_eq!(driver.read_bytes(dst, 4), vec![0u8; 4]);
        {
            let fired = Arc::clone(&fired);
            driver
                .add_callback(
                    &queue,
                    Box::new(move || {
                        fired.store(true, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        let marker = driver.create_marker().unwrap();
        driver.record_marker(&marker, &queue).unwrap();
        driver.wait_marker(&marker).unwrap();

        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(driver.read_bytes(dst, 4), data);
    }
}
