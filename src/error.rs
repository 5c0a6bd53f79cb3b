//! Custom error types for the gpu-staging crate.
//!
//! This module provides a centralized error handling system using the `thiserror` crate
//! to define structured, typed errors with clear messages. Every driver-level failure
//! is surfaced to the caller of the enclosing transfer operation; nothing is logged
//! and swallowed.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identifies which driver operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    /// Asynchronous host-to-device copy.
    HostToDeviceCopy,
    /// Asynchronous device-to-host copy.
    DeviceToHostCopy,
    /// Completion marker allocation.
    MarkerCreate,
    /// Recording a marker against a queue.
    MarkerRecord,
    /// Non-blocking marker query.
    MarkerQuery,
    /// Blocking marker synchronization.
    MarkerWait,
    /// Queue-ordered host callback registration.
    CallbackRegister,
    /// Caller-side queue creation (outside the transfer path).
    QueueCreate,
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverOp::HostToDeviceCopy => "host-to-device copy",
            DriverOp::DeviceToHostCopy => "device-to-host copy",
            DriverOp::MarkerCreate => "marker create",
            DriverOp::MarkerRecord => "marker record",
            DriverOp::MarkerQuery => "marker query",
            DriverOp::MarkerWait => "marker wait",
            DriverOp::CallbackRegister => "callback register",
            DriverOp::QueueCreate => "queue create",
        };
        write!(f, "{}", name)
    }
}

/// Primary error type for the crate, covering all possible failure cases.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// A driver-level operation reported a failure code.
    #[error("driver {operation} failed with code {code}")]
    DriverOperationFailed { operation: DriverOp, code: i32 },

    /// No free staging buffer and the pool is not allowed to grow or wait.
    #[error("staging pool exhausted: {requested} bytes requested with all {max_buffers} buffers in use")]
    PoolExhausted { requested: usize, max_buffers: usize },

    /// A blocking acquire did not obtain a buffer within the configured timeout.
    #[error("timed out after {0:?} waiting for a free staging buffer")]
    AcquireTimeout(Duration),

    /// A byte count is not a whole multiple of the element size.
    #[error("invalid length: {length} bytes is not a whole multiple of element size {element_size}")]
    InvalidLength { length: usize, element_size: usize },

    /// A host-side range falls outside the referenced array.
    #[error("host range out of bounds: offset {offset} plus length {length} exceeds {available} bytes")]
    RangeOutOfBounds {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// A host memory allocation for a staging region failed.
    #[error("host allocation of {0} bytes failed")]
    HostAllocation(usize),

    /// Errors from invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Results with TransferError.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Check a raw driver return code, mapping non-zero codes to a typed error.
pub fn check_driver(code: i32, operation: DriverOp) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(TransferError::DriverOperationFailed { operation, code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_op_display_names() {
        assert_eq!(DriverOp::HostToDeviceCopy.to_string(), "host-to-device copy");
        assert_eq!(DriverOp::MarkerRecord.to_string(), "marker record");
    }

    #[test]
    fn check_driver_maps_codes() {
        assert!(check_driver(0, DriverOp::MarkerCreate).is_ok());
        let err = check_driver(700, DriverOp::MarkerCreate).unwrap_err();
        assert!(matches!(
            err,
            TransferError::DriverOperationFailed {
                operation: DriverOp::MarkerCreate,
                code: 700
            }
        ));
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = TransferError::InvalidLength {
            length: 10,
            element_size: 4,
        };
        assert_eq!(
            err.to_string(),
            "invalid length: 10 bytes is not a whole multiple of element size 4"
        );
    }
}
