//! Error types for StreamGrid execution.
//!
//! Backends report [`DeviceError`]; the engine converts those at the
//! resource-manager and synchronization boundaries into a single
//! [`ExecutionError`] that is returned to the caller.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Result type for device (backend) operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token was triggered.
    Requested,
    /// The advisory deadline passed between two chunk dispatches.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancellation requested"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors surfaced by one execution call.
///
/// At most one error is returned per call: the first one encountered, with
/// per-stream failures ordered by stream creation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    /// Tuning vector rejected during validation. No resources were acquired.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Problem size cannot be partitioned.
    #[error("Invalid partition: problem size {size} must be non-negative")]
    InvalidPartition {
        /// Requested problem size.
        size: i64,
    },

    /// Arrays or scalars do not match the kernel shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Device buffer allocation failed. Partial acquisitions were rolled back.
    #[error("Device out of memory: requested {requested} bytes, {available} available")]
    DeviceOutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes the device reported free.
        available: usize,
    },

    /// Host memory registration (pinning) failed. Partial acquisitions were rolled back.
    #[error("Host registration failed: {0}")]
    HostRegistrationFailed(String),

    /// The device reported a failed launch on a stream.
    #[error("Kernel launch failed on stream {stream}: {reason}")]
    KernelLaunchFailed {
        /// Stream index (creation order).
        stream: usize,
        /// Device-reported reason.
        reason: String,
    },

    /// A host/device copy failed.
    #[error("Transfer failed on stream {stream:?}: {reason}")]
    TransferFailed {
        /// Stream index, or `None` for synchronous broadcast copies.
        stream: Option<usize>,
        /// Device-reported reason.
        reason: String,
    },

    /// Stream creation or synchronization failed.
    #[error("Stream failure: {0}")]
    StreamFailure(String),

    /// Execution stopped between chunk dispatches.
    #[error("Execution cancelled: {0}")]
    Cancelled(CancelReason),

    /// Requested backend is not available.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// Releasing resources failed after an otherwise successful run.
    #[error("Teardown failed: {0}")]
    TeardownFailed(String),
}

impl ExecutionError {
    /// Whether the error was raised before any device resource was acquired.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            ExecutionError::InvalidParameter(_)
                | ExecutionError::InvalidPartition { .. }
                | ExecutionError::ShapeMismatch(_)
        )
    }

    /// Whether the error was a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled(_))
    }
}

/// Errors reported by a [`Device`](crate::device::Device) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Allocation exceeded available device memory.
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes available.
        available: usize,
    },

    /// Host memory could not be registered.
    #[error("host registration failed: {0}")]
    RegistrationFailed(String),

    /// Stream could not be created or destroyed.
    #[error("stream error: {0}")]
    Stream(String),

    /// Copy between host and device failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Kernel launch rejected or failed during execution.
    #[error("launch failed: {0}")]
    Launch(String),

    /// Handle does not refer to a live resource on this device.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Device-side region outside the bounds of its buffer.
    #[error("region out of bounds: offset {offset} + len {len} > {capacity}")]
    OutOfBounds {
        /// Region offset in elements.
        offset: usize,
        /// Region length in elements.
        len: usize,
        /// Buffer capacity in elements.
        capacity: usize,
    },

    /// Driver or backend failure not covered above.
    #[error("backend error: {0}")]
    Backend(String),
}
