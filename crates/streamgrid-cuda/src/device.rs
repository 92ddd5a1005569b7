//! CUDA device backed by the driver API.
//!
//! Buffers, streams and host registrations are raw driver objects owned by
//! the device and addressed through the opaque handles the engine passes
//! around. The kernel module is compiled from [`KERNEL_SOURCE`] with NVRTC
//! and loaded with `cuModuleLoadData`.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cudarc::driver::sys as cuda_sys;
use cudarc::driver::CudaContext;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use streamgrid_core::device::{
    BufferHandle, Device, DeviceLimits, HostSlice, HostSliceMut, RegistrationHandle, StreamHandle,
};
use streamgrid_core::error::{DeviceError, DeviceResult};
use streamgrid_core::kernel::{KernelArgs, KernelLaunch};
use streamgrid_core::params::CachePreference;

use crate::kernels::{AXPY_ENTRY, DIA_MATVEC_ENTRY, KERNEL_SOURCE};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Function, pointer arguments and trailing `(n, num_diagonals, unroll)` scalars.
type LaunchParts = (RawFunction, Vec<cuda_sys::CUdeviceptr>, (u64, u32, u32));

#[derive(Clone, Copy)]
struct RawStream(cuda_sys::CUstream);
// SAFETY: a CUstream may be used from any thread with the owning context current.
unsafe impl Send for RawStream {}

#[derive(Clone, Copy)]
struct RawFunction(cuda_sys::CUfunction);
// SAFETY: functions are immutable once loaded.
unsafe impl Send for RawFunction {}
unsafe impl Sync for RawFunction {}

struct RawModule(cuda_sys::CUmodule);
// SAFETY: the module is only unloaded in Drop.
unsafe impl Send for RawModule {}
unsafe impl Sync for RawModule {}

#[derive(Clone, Copy)]
struct Buffer {
    ptr: cuda_sys::CUdeviceptr,
    len: usize,
}

fn check(result: cuda_sys::CUresult, op: &str) -> Result<(), String> {
    if result == cuda_sys::CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(format!("{} failed: {:?}", op, result))
    }
}

fn backend(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Backend(e.to_string())
}

/// A CUDA GPU.
pub struct CudaDevice {
    ctx: Arc<CudaContext>,
    ordinal: usize,
    name: String,
    compute_capability: (u32, u32),
    limits: DeviceLimits,
    module: RawModule,
    axpy: RawFunction,
    dia_matvec: RawFunction,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<u64, Buffer>>,
    streams: Mutex<HashMap<u64, RawStream>>,
    registrations: Mutex<HashMap<u64, usize>>,
    // Issue order of launches changes the per-function cache configuration.
    launch_lock: Mutex<()>,
}

impl CudaDevice {
    /// Open device `ordinal` and compile the kernel module.
    pub fn new(ordinal: usize) -> DeviceResult<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            DeviceError::Backend(format!("Failed to create CUDA device {}: {}", ordinal, e))
        })?;
        let name = ctx
            .name()
            .map_err(|e| DeviceError::Backend(format!("Failed to get device name: {}", e)))?;
        let (major, minor) = ctx
            .compute_capability()
            .map_err(|e| DeviceError::Backend(format!("Failed to get compute capability: {}", e)))?;

        let attribute =
            |attr: cuda_sys::CUdevice_attribute| ctx.attribute(attr).map_err(backend);
        let limits = DeviceLimits {
            max_threads_per_block: attribute(
                cuda_sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
            )? as u32,
            max_streams: DeviceLimits::default().max_streams,
            max_grid_blocks: attribute(
                cuda_sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X,
            )? as u32,
            shared_mem_per_block: attribute(
                cuda_sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK,
            )? as usize,
        };

        let ptx = cudarc::nvrtc::compile_ptx(KERNEL_SOURCE)
            .map_err(|e| DeviceError::Backend(format!("NVRTC compilation failed: {:?}", e)))?;
        let ptx = CString::new(ptx.to_src())
            .map_err(|e| DeviceError::Backend(format!("Invalid PTX (contains null byte): {}", e)))?;

        ctx.bind_to_thread().map_err(backend)?;
        let mut module: cuda_sys::CUmodule = ptr::null_mut();
        // SAFETY: the context is current and `ptx` is a NUL-terminated image.
        unsafe {
            check(
                cuda_sys::cuModuleLoadData(&mut module, ptx.as_ptr() as *const _),
                "cuModuleLoadData",
            )
        }
        .map_err(DeviceError::Backend)?;
        let module = RawModule(module);
        let axpy = Self::function(&module, AXPY_ENTRY)?;
        let dia_matvec = Self::function(&module, DIA_MATVEC_ENTRY)?;

        info!(
            ordinal,
            name = %name,
            compute_capability = %format!("{}.{}", major, minor),
            max_threads = limits.max_threads_per_block,
            "Opened CUDA device"
        );

        Ok(Self {
            ctx,
            ordinal,
            name,
            compute_capability: (major as u32, minor as u32),
            limits,
            module,
            axpy,
            dia_matvec,
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            launch_lock: Mutex::new(()),
        })
    }

    fn function(module: &RawModule, name: &str) -> DeviceResult<RawFunction> {
        let cname = CString::new(name).map_err(backend)?;
        let mut func: cuda_sys::CUfunction = ptr::null_mut();
        // SAFETY: the module is loaded and outlives the returned handle.
        unsafe {
            check(
                cuda_sys::cuModuleGetFunction(&mut func, module.0, cname.as_ptr()),
                "cuModuleGetFunction",
            )
        }
        .map_err(|e| DeviceError::Backend(format!("{} ({})", e, name)))?;
        Ok(RawFunction(func))
    }

    /// Device ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Compute capability as (major, minor).
    pub fn compute_capability(&self) -> (u32, u32) {
        self.compute_capability
    }

    fn bind(&self) -> DeviceResult<()> {
        self.ctx.bind_to_thread().map_err(backend)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, handle: BufferHandle) -> DeviceResult<Buffer> {
        self.buffers
            .lock()
            .get(&handle.0)
            .copied()
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn region(
        &self,
        handle: BufferHandle,
        offset: usize,
        len: usize,
    ) -> DeviceResult<cuda_sys::CUdeviceptr> {
        let buffer = self.buffer(handle)?;
        match offset.checked_add(len) {
            Some(end) if end <= buffer.len => Ok(buffer.ptr + (offset * F64_BYTES) as u64),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                len,
                capacity: buffer.len,
            }),
        }
    }

    fn stream(&self, handle: StreamHandle) -> DeviceResult<RawStream> {
        self.streams
            .lock()
            .get(&handle.0)
            .copied()
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn cache_config(preference: CachePreference) -> cuda_sys::CUfunc_cache {
        match preference {
            CachePreference::PreferNone => cuda_sys::CUfunc_cache::CU_FUNC_CACHE_PREFER_NONE,
            CachePreference::PreferL1 => cuda_sys::CUfunc_cache::CU_FUNC_CACHE_PREFER_L1,
            CachePreference::PreferShared => cuda_sys::CUfunc_cache::CU_FUNC_CACHE_PREFER_SHARED,
        }
    }
}

impl Device for CudaDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn available_memory(&self) -> usize {
        if self.bind().is_err() {
            return 0;
        }
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: out-pointers are valid locals; context is current.
        match unsafe { check(cuda_sys::cuMemGetInfo_v2(&mut free, &mut total), "cuMemGetInfo") } {
            Ok(()) => free,
            Err(e) => {
                warn!(error = %e, "Could not query free device memory");
                0
            }
        }
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferHandle> {
        self.bind()?;
        let bytes = len.max(1) * F64_BYTES;
        let mut dptr: cuda_sys::CUdeviceptr = 0;
        // SAFETY: out-pointer is a valid local; context is current.
        let result = unsafe { cuda_sys::cuMemAlloc_v2(&mut dptr, bytes) };
        if result == cuda_sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                available: self.available_memory(),
            });
        }
        check(result, "cuMemAlloc").map_err(DeviceError::Backend)?;

        let handle = self.next_handle();
        self.buffers.lock().insert(handle, Buffer { ptr: dptr, len });
        debug!(buffer = handle, bytes, "Allocated device buffer");
        Ok(BufferHandle(handle))
    }

    fn free(&self, buffer: BufferHandle) -> DeviceResult<()> {
        let raw = self
            .buffers
            .lock()
            .remove(&buffer.0)
            .ok_or_else(|| DeviceError::InvalidHandle(buffer.to_string()))?;
        self.bind()?;
        // SAFETY: the pointer came from cuMemAlloc and was removed from the table.
        unsafe { check(cuda_sys::cuMemFree_v2(raw.ptr), "cuMemFree") }.map_err(DeviceError::Backend)
    }

    unsafe fn register_host(&self, region: HostSlice) -> DeviceResult<RegistrationHandle> {
        self.bind()?;
        let host = region.as_ptr() as *mut c_void;
        check(
            cuda_sys::cuMemHostRegister_v2(host, region.size_bytes().max(1), 0),
            "cuMemHostRegister",
        )
        .map_err(DeviceError::RegistrationFailed)?;

        let handle = self.next_handle();
        self.registrations.lock().insert(handle, host as usize);
        Ok(RegistrationHandle(handle))
    }

    fn unregister_host(&self, registration: RegistrationHandle) -> DeviceResult<()> {
        let host = self
            .registrations
            .lock()
            .remove(&registration.0)
            .ok_or_else(|| DeviceError::InvalidHandle(registration.to_string()))?;
        self.bind()?;
        // SAFETY: the address was registered by register_host.
        unsafe { check(cuda_sys::cuMemHostUnregister(host as *mut c_void), "cuMemHostUnregister") }
            .map_err(DeviceError::RegistrationFailed)
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        self.bind()?;
        let mut stream: cuda_sys::CUstream = ptr::null_mut();
        // SAFETY: out-pointer is a valid local; context is current.
        unsafe {
            check(
                cuda_sys::cuStreamCreate(
                    &mut stream,
                    cuda_sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                ),
                "cuStreamCreate",
            )
        }
        .map_err(DeviceError::Stream)?;

        let handle = self.next_handle();
        self.streams.lock().insert(handle, RawStream(stream));
        Ok(StreamHandle(handle))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        let raw = self
            .streams
            .lock()
            .remove(&stream.0)
            .ok_or_else(|| DeviceError::InvalidHandle(stream.to_string()))?;
        self.bind()?;
        // SAFETY: the stream was created by create_stream and removed from the table.
        unsafe { check(cuda_sys::cuStreamDestroy_v2(raw.0), "cuStreamDestroy") }
            .map_err(DeviceError::Stream)
    }

    fn copy_to_device(&self, dst: BufferHandle, offset: usize, src: &[f64]) -> DeviceResult<()> {
        let dptr = self.region(dst, offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        self.bind()?;
        // SAFETY: region bounds were checked; `src` is a live host slice.
        unsafe {
            check(
                cuda_sys::cuMemcpyHtoD_v2(
                    dptr,
                    src.as_ptr() as *const c_void,
                    src.len() * F64_BYTES,
                ),
                "cuMemcpyHtoD",
            )
        }
        .map_err(DeviceError::Transfer)
    }

    unsafe fn copy_to_device_async(
        &self,
        stream: StreamHandle,
        dst: BufferHandle,
        offset: usize,
        src: HostSlice,
    ) -> DeviceResult<()> {
        let dptr = self.region(dst, offset, src.len())?;
        let raw = self.stream(stream)?;
        if src.is_empty() {
            return Ok(());
        }
        self.bind()?;
        check(
            cuda_sys::cuMemcpyHtoDAsync_v2(
                dptr,
                src.as_ptr() as *const c_void,
                src.size_bytes(),
                raw.0,
            ),
            "cuMemcpyHtoDAsync",
        )
        .map_err(DeviceError::Transfer)
    }

    unsafe fn copy_to_host_async(
        &self,
        stream: StreamHandle,
        src: BufferHandle,
        offset: usize,
        dst: HostSliceMut,
    ) -> DeviceResult<()> {
        let dptr = self.region(src, offset, dst.len())?;
        let raw = self.stream(stream)?;
        if dst.is_empty() {
            return Ok(());
        }
        self.bind()?;
        check(
            cuda_sys::cuMemcpyDtoHAsync_v2(
                dst.as_mut_ptr() as *mut c_void,
                dptr,
                dst.size_bytes(),
                raw.0,
            ),
            "cuMemcpyDtoHAsync",
        )
        .map_err(DeviceError::Transfer)
    }

    fn launch(&self, stream: StreamHandle, launch: &KernelLaunch) -> DeviceResult<()> {
        let raw_stream = self.stream(stream)?;
        let geometry = launch.geometry;
        let mut chunk_offset = launch.chunk.offset as u64;
        let mut chunk_len = launch.chunk.len as u64;
        let shared = launch.shared_mem_bytes as u32;

        let (func, mut ptrs, mut extra): LaunchParts = match launch.args {
            KernelArgs::Axpy { scalars, x, y } => (
                self.axpy,
                vec![
                    self.buffer(scalars)?.ptr,
                    self.buffer(x)?.ptr,
                    self.buffer(y)?.ptr,
                ],
                (0, 0, 0),
            ),
            KernelArgs::SparseDia {
                scalars,
                values,
                x,
                y,
                num_diagonals,
            } => (
                self.dia_matvec,
                vec![
                    self.buffer(scalars)?.ptr,
                    self.buffer(values)?.ptr,
                    self.buffer(x)?.ptr,
                    self.buffer(y)?.ptr,
                ],
                (launch.problem_size as u64, num_diagonals, launch.unroll_factor),
            ),
        };

        let mut params: Vec<*mut c_void> = ptrs
            .iter_mut()
            .map(|p| p as *mut cuda_sys::CUdeviceptr as *mut c_void)
            .collect();
        params.push(&mut chunk_offset as *mut u64 as *mut c_void);
        params.push(&mut chunk_len as *mut u64 as *mut c_void);
        if matches!(launch.args, KernelArgs::SparseDia { .. }) {
            params.push(&mut extra.0 as *mut u64 as *mut c_void);
            params.push(&mut extra.1 as *mut u32 as *mut c_void);
            params.push(&mut extra.2 as *mut u32 as *mut c_void);
        }

        self.bind()?;
        let _issue = self.launch_lock.lock();
        // SAFETY: `func` belongs to the loaded module, every parameter
        // pointer refers to a local that outlives the call, and the types
        // match the kernel signatures in KERNEL_SOURCE.
        unsafe {
            check(
                cuda_sys::cuFuncSetCacheConfig(func.0, Self::cache_config(launch.cache_preference)),
                "cuFuncSetCacheConfig",
            )
            .map_err(DeviceError::Launch)?;
            check(
                cuda_sys::cuLaunchKernel(
                    func.0,
                    geometry.blocks,
                    1,
                    1,
                    geometry.threads_per_block,
                    1,
                    1,
                    shared,
                    raw_stream.0,
                    params.as_mut_ptr(),
                    ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
            .map_err(DeviceError::Launch)
        }
    }

    fn synchronize(&self, stream: StreamHandle) -> DeviceResult<()> {
        let raw = self.stream(stream)?;
        self.bind()?;
        // SAFETY: the stream is live.
        let result = unsafe { cuda_sys::cuStreamSynchronize(raw.0) };
        match result {
            cuda_sys::CUresult::CUDA_SUCCESS => Ok(()),
            cuda_sys::CUresult::CUDA_ERROR_LAUNCH_FAILED
            | cuda_sys::CUresult::CUDA_ERROR_ILLEGAL_ADDRESS
            | cuda_sys::CUresult::CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES
            | cuda_sys::CUresult::CUDA_ERROR_LAUNCH_TIMEOUT => {
                Err(DeviceError::Launch(format!("cuStreamSynchronize: {:?}", result)))
            }
            other => Err(DeviceError::Stream(format!("cuStreamSynchronize failed: {:?}", other))),
        }
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        if self.bind().is_err() {
            return;
        }
        // Errors are ignored during cleanup.
        unsafe {
            for (_, stream) in self.streams.lock().drain() {
                let _ = cuda_sys::cuStreamDestroy_v2(stream.0);
            }
            for (_, buffer) in self.buffers.lock().drain() {
                let _ = cuda_sys::cuMemFree_v2(buffer.ptr);
            }
            for (_, host) in self.registrations.lock().drain() {
                let _ = cuda_sys::cuMemHostUnregister(host as *mut c_void);
            }
            let _ = cuda_sys::cuModuleUnload(self.module.0);
        }
    }
}
