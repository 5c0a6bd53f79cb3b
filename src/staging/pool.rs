//! The staging buffer pool.
//!
//! One mutex guards the slot table; a condvar wakes blocked acquirers when a
//! transfer releases its buffer. Release always funnels through the lease's
//! drop into [`PoolInner::release`], the pool's single mutation point, so a
//! driver callback firing on an internal thread touches pool state the same
//! way a caller thread does.

use metrics::gauge;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::{ExhaustionPolicy, StagingConfig};
use crate::error::{Result, TransferError};
use crate::staging::pinned::PinnedRegion;

struct Slot {
    region: PinnedRegion,
    busy: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    in_use: usize,
}

pub(crate) struct PoolInner {
    config: StagingConfig,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl PoolInner {
    /// Mark a buffer free and wake one blocked acquirer.
    ///
    /// This is the only mutation on the release path; completion callbacks
    /// reach pool state exclusively through here (via the lease's drop).
    fn release(&self, index: usize) {
        {
            let mut state = self.state.lock();
            let slot = &mut state.slots[index];
            debug_assert!(slot.busy, "release of a buffer that was not acquired");
            slot.busy = false;
            state.in_use -= 1;
            gauge!("staging_buffers_in_use").set(state.in_use as f64);
        }
        self.freed.notify_one();
        debug!(index, "staging buffer released");
    }
}

/// Pool of pinned staging buffers.
///
/// Grows on demand up to `max_buffers`; past that, `acquire` either blocks for
/// a release or fails fast depending on the configured [`ExhaustionPolicy`].
pub struct StagingPool {
    inner: Arc<PoolInner>,
}

impl StagingPool {
    /// Create a pool with `initial_buffers` regions allocated up front.
    pub fn new(config: StagingConfig) -> Result<Self> {
        config.validate()?;

        let mut slots = Vec::with_capacity(config.max_buffers);
        for _ in 0..config.initial_buffers {
            slots.push(Slot {
                region: PinnedRegion::new(config.buffer_capacity)?,
                busy: false,
            });
        }
        debug!(
            buffers = slots.len(),
            capacity = config.buffer_capacity,
            "staging pool initialized"
        );

        Ok(StagingPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState { slots, in_use: 0 }),
                freed: Condvar::new(),
            }),
        })
    }

    /// Acquire a free buffer with capacity of at least `length` bytes.
    ///
    /// Preference order: an existing free buffer that is large enough, then
    /// growth (the new buffer is sized `max(length, buffer_capacity)`), then
    /// the exhaustion policy. A request no existing or future buffer could
    /// satisfy fails with `PoolExhausted` instead of blocking forever.
    pub fn acquire(&self, length: usize) -> Result<StagingLease> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.acquire_timeout;
        let mut state = inner.state.lock();

        loop {
            if let Some(index) = state
                .slots
                .iter()
                .position(|slot| !slot.busy && slot.region.capacity() >= length)
            {
                return Ok(lease_out(inner, &mut state, index));
            }

            if state.slots.len() < inner.config.max_buffers {
                let capacity = inner.config.buffer_capacity.max(length);
                let region = PinnedRegion::new(capacity)?;
                state.slots.push(Slot {
                    region,
                    busy: false,
                });
                let index = state.slots.len() - 1;
                debug!(index, capacity, "staging pool grew");
                return Ok(lease_out(inner, &mut state, index));
            }

            // at the growth limit: a request larger than every buffer can
            // never be satisfied by waiting
            if state
                .slots
                .iter()
                .all(|slot| slot.region.capacity() < length)
            {
                return Err(TransferError::PoolExhausted {
                    requested: length,
                    max_buffers: inner.config.max_buffers,
                });
            }

            match inner.config.exhaustion {
                ExhaustionPolicy::Fail => {
                    return Err(TransferError::PoolExhausted {
                        requested: length,
                        max_buffers: inner.config.max_buffers,
                    });
                }
                ExhaustionPolicy::Block => {
                    if inner.freed.wait_until(&mut state, deadline).timed_out() {
                        return Err(TransferError::AcquireTimeout(
                            inner.config.acquire_timeout,
                        ));
                    }
                }
            }
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            total_buffers: state.slots.len(),
            in_use: state.in_use,
            available: state.slots.len() - state.in_use,
            max_buffers: self.inner.config.max_buffers,
        }
    }
}

fn lease_out(inner: &Arc<PoolInner>, state: &mut PoolState, index: usize) -> StagingLease {
    let slot = &mut state.slots[index];
    slot.busy = true;
    state.in_use += 1;
    gauge!("staging_buffers_in_use").set(state.in_use as f64);

    StagingLease {
        pool: Arc::clone(inner),
        index,
        ptr: slot.region.as_ptr(),
        capacity: slot.region.capacity(),
    }
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Buffers currently allocated.
    pub total_buffers: usize,
    /// Buffers owned by in-flight transfers.
    pub in_use: usize,
    /// Buffers free for acquisition.
    pub available: usize,
    /// Growth limit.
    pub max_buffers: usize,
}

/// Exclusive ownership of one staging buffer for the duration of a transfer.
///
/// The lease is the release token: dropping it returns the buffer to the pool,
/// exactly once. Moving the lease into a driver completion callback is how a
/// buffer stays owned across an in-flight asynchronous copy.
pub struct StagingLease {
    pool: Arc<PoolInner>,
    index: usize,
    // cached so in-flight copies never reach through the pool lock
    ptr: NonNull<u8>,
    capacity: usize,
}

unsafe impl Send for StagingLease {}

impl StagingLease {
    /// Capacity of the leased buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Host-side copy into the staging buffer.
    ///
    /// # Safety
    ///
    /// `src` must point to `len` readable bytes and `len` must not exceed the
    /// lease capacity.
    pub(crate) unsafe fn copy_in(&mut self, src: *const u8, len: usize) {
        debug_assert!(len <= self.capacity);
        std::ptr::copy_nonoverlapping(src, self.ptr.as_ptr(), len);
    }

    /// Host-side copy out of the staging buffer.
    ///
    /// # Safety
    ///
    /// `dst` must point to `len` writable bytes and `len` must not exceed the
    /// lease capacity.
    pub(crate) unsafe fn copy_out(&self, dst: *mut u8, len: usize) {
        debug_assert!(len <= self.capacity);
        std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), dst, len);
    }
}

impl fmt::Debug for StagingLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingLease")
            .field("index", &self.index)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for StagingLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    fn small_config(initial: usize, max: usize) -> StagingConfig {
        StagingConfig {
            buffer_capacity: 4096,
            initial_buffers: initial,
            max_buffers: max,
            acquire_timeout: Duration::from_secs(10),
            exhaustion: ExhaustionPolicy::Block,
        }
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let pool = StagingPool::new(small_config(2, 2)).unwrap();
        assert_eq!(pool.stats().available, 2);

        let lease = pool.acquire(1024).unwrap();
        assert!(lease.capacity() >= 1024);
        assert_eq!(pool.stats().in_use, 1);

        drop(lease);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn grows_up_to_max() {
        let pool = StagingPool::new(small_config(1, 3)).unwrap();
        let a = pool.acquire(4096).unwrap();
        let b = pool.acquire(4096).unwrap();
        let c = pool.acquire(4096).unwrap();
        assert_eq!(pool.stats().total_buffers, 3);
        assert_eq!(pool.stats().in_use, 3);
        drop((a, b, c));
    }

    #[test]
    fn oversized_request_gets_larger_buffer() {
        let pool = StagingPool::new(small_config(1, 2)).unwrap();
        let lease = pool.acquire(16384).unwrap();
        assert!(lease.capacity() >= 16384);
        assert_eq!(pool.stats().total_buffers, 2);
    }

    #[test]
    fn oversized_request_fails_at_growth_limit() {
        let pool = StagingPool::new(small_config(1, 1)).unwrap();
        // no buffer of this size exists or can be created, so blocking would
        // never succeed
        assert!(matches!(
            pool.acquire(1 << 20),
            Err(TransferError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn fail_policy_reports_exhaustion() {
        let config = StagingConfig {
            exhaustion: ExhaustionPolicy::Fail,
            ..small_config(1, 1)
        };
        let pool = StagingPool::new(config).unwrap();
        let held = pool.acquire(4096).unwrap();
        assert!(matches!(
            pool.acquire(4096),
            Err(TransferError::PoolExhausted { .. })
        ));
        drop(held);
    }

    #[test]
    fn block_policy_times_out() {
        let config = StagingConfig {
            acquire_timeout: Duration::from_millis(50),
            ..small_config(1, 1)
        };
        let pool = StagingPool::new(config).unwrap();
        let held = pool.acquire(4096).unwrap();
        assert!(matches!(
            pool.acquire(4096),
            Err(TransferError::AcquireTimeout(_))
        ));
        drop(held);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = Arc::new(StagingPool::new(small_config(1, 1)).unwrap());
        let held = pool.acquire(4096).unwrap();

        let contender = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(4096).map(|lease| lease.capacity()))
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);

        let capacity = contender.join().unwrap().unwrap();
        assert!(capacity >= 4096);
    }

    #[test]
    fn concurrent_acquirers_never_share_a_buffer() {
        const THREADS: usize = 8;
        const BUFFERS: usize = 3;
        const ITERATIONS: usize = 50;

        let pool = StagingPool::new(small_config(BUFFERS, BUFFERS)).unwrap();
        let live = Mutex::new(HashSet::new());

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ITERATIONS {
                        let lease = pool.acquire(1024).unwrap();
                        {
                            let mut live = live.lock();
                            // the same slot must never be live twice
                            assert!(live.insert(lease.index()));
                            assert!(live.len() <= BUFFERS);
                        }
                        thread::sleep(Duration::from_micros(200));
                        {
                            let mut live = live.lock();
                            assert!(live.remove(&lease.index()));
                        }
                        drop(lease);
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.total_buffers, BUFFERS);
    }
}
