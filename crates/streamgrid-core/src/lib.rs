//! StreamGrid Core - stream-parallel bulk array execution.
//!
//! This crate holds everything that does not depend on a particular
//! accelerator: the [`Device`](device::Device) trait backends implement,
//! partition planning, resource acquisition and teardown, the transfer and
//! launch scheduler, and the [`Engine`](engine::Engine) that ties them
//! together.
//!
//! # Pipeline
//!
//! ```text
//! ParameterVector ──► PartitionPlan ──► ResourceSet ──► Scheduler ──► sync + release
//!                                        (buffers,       (broadcast,
//!                                         streams,        per-chunk copies
//!                                         pinning)        and launches)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamgrid_core::prelude::*;
//!
//! let engine = Engine::new(Arc::new(my_device));
//! let x = vec![1.0; 1024];
//! let mut y = vec![0.0; 1024];
//! let params = ParameterVector::new(256, 4)?;
//! engine.execute_request(ExecutionRequest::axpy(2.0, &x, &mut y, params))?;
//! ```

#![warn(missing_docs)]

pub mod array;
pub mod cancel;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod params;
pub mod partition;
pub mod report;
pub mod resources;
pub mod scheduler;
pub mod sync;
pub mod tracking;
pub mod tuning;

#[cfg(test)]
mod testing;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::array::{AccessRole, ArrayDescriptor};
    pub use crate::cancel::{CancellationToken, ExecutionControl};
    pub use crate::config::{EngineConfig, EngineConfigBuilder};
    pub use crate::device::{
        BufferHandle, Device, DeviceLimits, HostSlice, HostSliceMut, RegistrationHandle,
        StreamHandle,
    };
    pub use crate::engine::{Engine, ExecutionRequest};
    pub use crate::error::{CancelReason, DeviceError, DeviceResult, ExecutionError, Result};
    pub use crate::kernel::{KernelArgs, KernelKind, KernelLaunch, LaunchGeometry};
    pub use crate::params::{CachePreference, ParameterVector, TuningConfig};
    pub use crate::partition::{Chunk, PartitionPlan, RemainderPolicy};
    pub use crate::report::{DispatchStats, ExecutionReport};
    pub use crate::tracking::{ResourceKind, ResourceTracker};
    pub use crate::tuning::{TuningSpace, TuningSpaceConfig};
}

pub use prelude::*;
