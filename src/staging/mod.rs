//! Pinned staging memory and the staging buffer pool.
//!
//! Staging buffers are page-locked host regions used as intermediates for
//! asynchronous device transfers. The pool hands them out under an RAII lease:
//! a buffer acquired for a transfer is exclusively owned by that transfer until
//! the lease drops, which is the single release path back to the pool.

pub mod pinned;
pub mod pool;

pub use pinned::PinnedRegion;
pub use pool::{PoolStats, StagingLease, StagingPool};
