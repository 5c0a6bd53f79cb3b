//! The `gpu_staging` core library.
//!
//! This crate provides the asynchronous transfer and staging-buffer
//! management layer between host arrays and device memory: a pool of pinned
//! host buffers, a dispatcher that issues overlapping host/device copies on
//! caller-owned queues, and event-based completion tracking that recycles
//! each buffer only after its transfer has observably retired.

pub mod config;
pub mod driver;
pub mod element;
pub mod error;
pub mod metrics;
pub mod staging;
pub mod transfer;

pub use config::{ExhaustionPolicy, StagingConfig};
pub use driver::host::HostDriver;
pub use driver::{DevicePtr, MarkerStatus, TransferDriver};
pub use element::{ElementType, HostPod, HostView, HostViewMut};
pub use error::{DriverOp, Result, TransferError};
pub use staging::{PoolStats, StagingLease, StagingPool};
pub use transfer::{
    CompletionTracker, Direction, Readback, Transfer, TransferDispatcher, TransferState,
    TransferStatus,
};
