//! Transfer status and driver error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Completion status reported by the transport for a failed transfer
///
/// Mirrors the status codes a host controller hands back with a completed
/// request. These never reach a client directly; the transfer engine either
/// retries them or translates them into a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum TransferError {
    /// Endpoint halted
    #[error("endpoint stalled")]
    Stall,
    /// Fewer bytes than required were transferred
    #[error("short transfer")]
    ShortTransfer,
    /// Device is gone
    #[error("no device")]
    NoDevice,
    /// Host controller or transport is shutting down
    #[error("transport shut down")]
    Shutdown,
    /// Request was cancelled before it completed
    #[error("transfer cancelled")]
    Cancelled,
    /// Device sent more data than requested
    #[error("overflow")]
    Overflow,
    /// Transport-level timeout
    #[error("timeout")]
    Timeout,
    /// Any other I/O failure
    #[error("I/O error")]
    Io,
}

impl TransferError {
    /// Transient errors eligible for automatic resubmission
    pub fn is_retryable(self) -> bool {
        matches!(self, TransferError::Stall | TransferError::ShortTransfer)
    }

    /// Bus-level errors meaning the device can no longer be reached
    pub fn is_bus_error(self) -> bool {
        matches!(self, TransferError::NoDevice | TransferError::Shutdown)
    }

    /// Statuses produced by unlinking a request rather than by the device
    pub fn is_unlink(self) -> bool {
        matches!(
            self,
            TransferError::Cancelled | TransferError::NoDevice | TransferError::Shutdown
        )
    }
}

/// Errors surfaced to clients of the driver
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// No device is registered behind the requested node
    #[error("no such device: {node}")]
    NoSuchDevice { node: String },

    /// Device cannot be driven (attach-time)
    #[error("unsupported device: {reason}")]
    UnsupportedDevice { reason: String },

    /// All device nodes are in use
    #[error("no free device node (limit {limit})")]
    NodeTableFull { limit: u32 },

    /// Device was disconnected
    #[error("device disconnected")]
    Disconnected,

    /// A bulk-in transfer is already in flight on this device
    #[error("a transfer is already pending")]
    AlreadyPending,

    /// Operation would have to wait
    #[error("device busy")]
    Busy,

    /// Waiting for a transfer exceeded the deadline
    #[error("timed out waiting for transfer")]
    TimedOut,

    /// Wait was interrupted by the caller
    #[error("interrupted")]
    Interrupted,

    /// Endpoint stalled and the retry budget is exhausted
    #[error("endpoint stalled")]
    Stall,

    /// Short transfer and the retry budget is exhausted
    #[error("short transfer")]
    ShortTransfer,

    /// Waking the bus link failed at open time
    #[error("failed to resume device: {0}")]
    PowerResumeFailed(TransferError),

    /// Any other transfer failure
    #[error("I/O error: {0}")]
    Io(TransferError),
}

impl DriverError {
    /// Caller-local conditions that may succeed when retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Busy
                | DriverError::TimedOut
                | DriverError::Interrupted
                | DriverError::AlreadyPending
        )
    }
}

impl From<TransferError> for DriverError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Stall => DriverError::Stall,
            TransferError::ShortTransfer => DriverError::ShortTransfer,
            TransferError::NoDevice | TransferError::Shutdown => DriverError::Disconnected,
            TransferError::Cancelled => DriverError::Interrupted,
            TransferError::Timeout => DriverError::TimedOut,
            TransferError::Overflow | TransferError::Io => DriverError::Io(err),
        }
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;
