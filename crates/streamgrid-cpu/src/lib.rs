//! CPU backend for StreamGrid.
//!
//! [`CpuDevice`] implements [`Device`](streamgrid_core::device::Device)
//! without an accelerator. Device memory is a private heap allocation per
//! buffer, every stream is a worker thread that executes its queue in
//! order, and a launch spreads its blocks across the rayon pool. Streams
//! genuinely overlap, so the engine's ordering and teardown guarantees are
//! exercised the same way they are on hardware.
//!
//! Failures can be injected with [`FaultInjection`] to drive rollback and
//! error-propagation paths.

#![warn(missing_docs)]

mod device;
mod fault;
mod kernels;
mod memory;
mod stream;

pub use device::{CpuDevice, CpuDeviceConfig, CpuDeviceStats};
pub use fault::FaultInjection;
pub use memory::DeviceMemory;
