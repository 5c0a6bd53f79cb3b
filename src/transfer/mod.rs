//! Asynchronous transfer dispatch and completion tracking.
//!
//! The dispatcher stages host data through the pinned pool and enqueues device
//! copies on caller-owned queues; the tracker ties buffer recycling and caller
//! visibility to queue-ordered completion.

pub mod dispatcher;
pub mod handle;
pub mod tracker;

pub use dispatcher::TransferDispatcher;
pub use handle::{Direction, Readback, Transfer, TransferState, TransferStatus};
pub use tracker::CompletionTracker;
