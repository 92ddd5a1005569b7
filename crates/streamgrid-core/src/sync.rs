//! Final barrier and error reduction.
//!
//! Every stream is waited on in creation order, whether or not any chunk
//! was issued to it. The outcome of a call is then reduced to a single
//! error: the failure on the earliest-created stream wins, any device
//! failure outranks a cancellation, and a teardown failure is only
//! reported when nothing else went wrong.

use tracing::debug;

use crate::device::{Device, StreamHandle};
use crate::error::{DeviceError, ExecutionError, Result};
use crate::scheduler::DispatchStop;

/// A failure observed on one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFault {
    /// Stream index in creation order.
    pub stream: usize,
    /// Mapped error.
    pub error: ExecutionError,
}

/// Wait on every stream and collect the failures they report.
pub fn synchronize_all(device: &dyn Device, streams: &[StreamHandle]) -> Vec<StreamFault> {
    let mut faults = Vec::new();
    for (index, stream) in streams.iter().enumerate() {
        match device.synchronize(*stream) {
            Ok(()) => debug!(stream = index, "Stream synchronized"),
            Err(err) => {
                debug!(stream = index, error = %err, "Stream reported failure");
                faults.push(StreamFault {
                    stream: index,
                    error: map_stream_error(index, err),
                });
            }
        }
    }
    faults
}

/// Map an asynchronous device failure on stream `index` into the engine taxonomy.
pub fn map_stream_error(index: usize, err: DeviceError) -> ExecutionError {
    match err {
        DeviceError::Launch(reason) => ExecutionError::KernelLaunchFailed {
            stream: index,
            reason,
        },
        DeviceError::Transfer(reason) => ExecutionError::TransferFailed {
            stream: Some(index),
            reason,
        },
        DeviceError::OutOfBounds { .. } => ExecutionError::KernelLaunchFailed {
            stream: index,
            reason: err.to_string(),
        },
        other => ExecutionError::StreamFailure(format!("stream {}: {}", index, other)),
    }
}

/// Reduce everything that went wrong in one call to the error it returns.
pub fn resolve(
    dispatch: Option<DispatchStop>,
    faults: Vec<StreamFault>,
    teardown: Result<()>,
) -> Result<()> {
    let mut first_fault: Option<StreamFault> = None;
    let mut cancelled = None;

    match dispatch {
        Some(DispatchStop::Failed(stream, error)) => {
            first_fault = Some(StreamFault { stream, error });
        }
        Some(DispatchStop::Cancelled(reason)) => cancelled = Some(reason),
        None => {}
    }

    for fault in faults {
        let earlier = first_fault
            .as_ref()
            .map_or(true, |current| fault.stream < current.stream);
        if earlier {
            first_fault = Some(fault);
        }
    }

    if let Some(fault) = first_fault {
        return Err(fault.error);
    }
    if let Some(reason) = cancelled {
        return Err(ExecutionError::Cancelled(reason));
    }
    teardown
}
