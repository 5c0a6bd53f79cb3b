//! Page-locked host memory regions.
//!
//! True asynchronous DMA requires host memory that cannot be paged out while a
//! transfer is in flight. Regions are page-aligned and locked with `mlock` on
//! unix targets; when locking fails (resource limits), the region stays usable
//! but pageable and a warning is emitted.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use tracing::warn;

use crate::config::staging::PAGE_SIZE;
use crate::error::{Result, TransferError};

/// A fixed-capacity, page-aligned host memory region.
///
/// The backing allocation never moves or shrinks; raw pointers into it stay
/// valid for the region's whole lifetime.
pub struct PinnedRegion {
    ptr: NonNull<u8>,
    capacity: usize,
    locked: bool,
}

unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    /// Allocate a zeroed region of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TransferError::Config(
                "staging region capacity must be non-zero".to_string(),
            ));
        }

        let layout = Layout::from_size_align(capacity, PAGE_SIZE)
            .map_err(|e| TransferError::Config(format!("invalid staging layout: {}", e)))?;

        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(TransferError::HostAllocation(capacity))?;

        let locked = lock_pages(ptr.as_ptr(), capacity);

        Ok(PinnedRegion {
            ptr,
            capacity,
            locked,
        })
    }

    /// Capacity of the region in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the region is actually locked against paging.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Raw pointer to the region's memory.
    ///
    /// Exclusivity is enforced one level up: the pool hands the region to at
    /// most one lease at a time.
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        unlock_pages(self.ptr.as_ptr(), self.capacity, self.locked);
        if let Ok(layout) = Layout::from_size_align(self.capacity, PAGE_SIZE) {
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(unix)]
fn lock_pages(ptr: *mut u8, len: usize) -> bool {
    let rc = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
    if rc != 0 {
        warn!(len, "mlock failed; staging region stays pageable");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn lock_pages(_ptr: *mut u8, _len: usize) -> bool {
    false
}

#[cfg(unix)]
fn unlock_pages(ptr: *mut u8, len: usize, locked: bool) {
    if locked {
        let rc = unsafe { libc::munlock(ptr as *const libc::c_void, len) };
        if rc != 0 {
            warn!(len, "munlock failed");
        }
    }
}

#[cfg(not(unix))]
fn unlock_pages(_ptr: *mut u8, _len: usize, _locked: bool) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_zeroed_and_aligned() {
        let region = PinnedRegion::new(8192).unwrap();
        assert_eq!(region.capacity(), 8192);
        assert_eq!(region.as_ptr().as_ptr() as usize % PAGE_SIZE, 0);

        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr().as_ptr(), 8192) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            PinnedRegion::new(0),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn odd_sizes_are_fine() {
        let region = PinnedRegion::new(10_000).unwrap();
        assert_eq!(region.capacity(), 10_000);
    }
}
