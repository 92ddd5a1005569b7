//! CUDA backend for StreamGrid.
//!
//! [`CudaDevice`] implements [`Device`](streamgrid_core::device::Device) on an
//! NVIDIA GPU through the CUDA driver API (via cudarc). Kernels are compiled
//! at device open with NVRTC from [`kernels::KERNEL_SOURCE`].
//!
//! # Features
//!
//! - `cuda`: enable the real backend. Without it, [`CudaDevice::new`] returns
//!   [`DeviceError::Backend`](streamgrid_core::error::DeviceError::Backend)
//!   and [`is_cuda_available`] is always false.
//!
//! # Requirements
//!
//! - NVIDIA GPU with double-precision support
//! - CUDA Toolkit 11.0+ with NVRTC

#![warn(missing_docs)]

#[cfg(feature = "cuda")]
mod device;
pub mod kernels;

#[cfg(feature = "cuda")]
pub use device::CudaDevice;

// Placeholder implementation when CUDA is not available
#[cfg(not(feature = "cuda"))]
mod stub {
    use streamgrid_core::device::{
        BufferHandle, Device, DeviceLimits, HostSlice, HostSliceMut, RegistrationHandle,
        StreamHandle,
    };
    use streamgrid_core::error::{DeviceError, DeviceResult};
    use streamgrid_core::kernel::KernelLaunch;

    /// Stub CUDA device when the `cuda` feature is disabled.
    pub struct CudaDevice {
        _private: (),
    }

    impl CudaDevice {
        /// Opening fails when CUDA support is not compiled in.
        pub fn new(_ordinal: usize) -> DeviceResult<Self> {
            Err(DeviceError::Backend("CUDA feature not enabled".to_string()))
        }

        fn unavailable<T>(&self) -> DeviceResult<T> {
            Err(DeviceError::Backend("CUDA feature not enabled".to_string()))
        }
    }

    impl Device for CudaDevice {
        fn name(&self) -> &str {
            "cuda-unavailable"
        }

        fn limits(&self) -> DeviceLimits {
            DeviceLimits::default()
        }

        fn available_memory(&self) -> usize {
            0
        }

        fn allocate(&self, _len: usize) -> DeviceResult<BufferHandle> {
            self.unavailable()
        }

        fn free(&self, _buffer: BufferHandle) -> DeviceResult<()> {
            self.unavailable()
        }

        unsafe fn register_host(&self, _region: HostSlice) -> DeviceResult<RegistrationHandle> {
            self.unavailable()
        }

        fn unregister_host(&self, _registration: RegistrationHandle) -> DeviceResult<()> {
            self.unavailable()
        }

        fn create_stream(&self) -> DeviceResult<StreamHandle> {
            self.unavailable()
        }

        fn destroy_stream(&self, _stream: StreamHandle) -> DeviceResult<()> {
            self.unavailable()
        }

        fn copy_to_device(
            &self,
            _dst: BufferHandle,
            _offset: usize,
            _src: &[f64],
        ) -> DeviceResult<()> {
            self.unavailable()
        }

        unsafe fn copy_to_device_async(
            &self,
            _stream: StreamHandle,
            _dst: BufferHandle,
            _offset: usize,
            _src: HostSlice,
        ) -> DeviceResult<()> {
            self.unavailable()
        }

        unsafe fn copy_to_host_async(
            &self,
            _stream: StreamHandle,
            _src: BufferHandle,
            _offset: usize,
            _dst: HostSliceMut,
        ) -> DeviceResult<()> {
            self.unavailable()
        }

        fn launch(&self, _stream: StreamHandle, _launch: &KernelLaunch) -> DeviceResult<()> {
            self.unavailable()
        }

        fn synchronize(&self, _stream: StreamHandle) -> DeviceResult<()> {
            self.unavailable()
        }
    }
}

#[cfg(not(feature = "cuda"))]
pub use stub::CudaDevice;

/// Check if CUDA is available at runtime.
///
/// False when the `cuda` feature is off, the driver libraries are missing,
/// or no device is present. cudarc panics when the libraries cannot be
/// loaded, so the availability check runs under `catch_unwind`.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

/// Number of CUDA devices, or 0 when CUDA is unavailable.
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        std::panic::catch_unwind(|| {
            cudarc::driver::CudaContext::device_count().unwrap_or(0) as usize
        })
        .unwrap_or(0)
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}
