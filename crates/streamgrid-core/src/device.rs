//! Device abstraction implemented by every backend.
//!
//! The engine drives a [`Device`] through opaque handles. All sizes and
//! offsets are in `f64` elements, never bytes.

use std::fmt;

use crate::error::DeviceResult;
use crate::kernel::KernelLaunch;

/// Handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Handle to a stream (ordered execution queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

/// Handle to a page-locked host registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration#{}", self.0)
    }
}

/// Hardware limits a parameter vector is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum threads in one block.
    pub max_threads_per_block: u32,
    /// Maximum concurrent streams the backend supports.
    pub max_streams: u32,
    /// Maximum blocks in one grid dimension.
    pub max_grid_blocks: u32,
    /// Shared memory available to one block, in bytes.
    pub shared_mem_per_block: usize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_threads_per_block: 1024,
            max_streams: 32,
            max_grid_blocks: 65_535,
            shared_mem_per_block: 48 * 1024,
        }
    }
}

/// Read-only view of host memory handed to an asynchronous copy.
///
/// Carries a raw pointer because the copy completes after the call that
/// issued it returns. The issuer guarantees the memory stays valid and
/// unaliased by writers until the stream is synchronized.
#[derive(Debug, Clone, Copy)]
pub struct HostSlice {
    ptr: *const f64,
    len: usize,
}

// SAFETY: a HostSlice is only dereferenced under the contract of the unsafe
// copy methods, which require the memory to outlive the stream operation.
unsafe impl Send for HostSlice {}
unsafe impl Sync for HostSlice {}

impl HostSlice {
    /// View of an existing slice.
    pub fn from_slice(data: &[f64]) -> Self {
        Self {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    /// Sub-range `[offset, offset + len)`. Returns `None` when out of bounds.
    pub fn range(&self, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset <= self.len, so the result stays within (or one past) the allocation.
        let ptr = unsafe { self.ptr.add(offset) };
        Some(Self { ptr, len })
    }

    /// Raw pointer to the first element.
    pub fn as_ptr(&self) -> *const f64 {
        self.ptr
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }

    /// Reborrow as a slice.
    ///
    /// # Safety
    ///
    /// The memory must still be live and not concurrently written.
    pub unsafe fn as_slice<'a>(&self) -> &'a [f64] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// Writable view of host memory targeted by an asynchronous copy.
#[derive(Debug, Clone, Copy)]
pub struct HostSliceMut {
    ptr: *mut f64,
    len: usize,
}

// SAFETY: see HostSlice. Writers are confined to disjoint chunk ranges.
unsafe impl Send for HostSliceMut {}
unsafe impl Sync for HostSliceMut {}

impl HostSliceMut {
    /// View of an existing mutable slice.
    pub fn from_slice(data: &mut [f64]) -> Self {
        Self {
            ptr: data.as_mut_ptr(),
            len: data.len(),
        }
    }

    /// Sub-range `[offset, offset + len)`. Returns `None` when out of bounds.
    pub fn range(&self, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: offset <= self.len.
        let ptr = unsafe { self.ptr.add(offset) };
        Some(Self { ptr, len })
    }

    /// Read-only view of the same memory.
    pub fn as_const(&self) -> HostSlice {
        HostSlice {
            ptr: self.ptr,
            len: self.len,
        }
    }

    /// Raw pointer to the first element.
    pub fn as_mut_ptr(&self) -> *mut f64 {
        self.ptr
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }

    /// Reborrow as a mutable slice.
    ///
    /// # Safety
    ///
    /// The memory must still be live and no other reference may alias it.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [f64] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// An accelerator the engine can drive.
///
/// Operations enqueued on one stream execute in issue order; operations on
/// different streams may overlap. Failures of asynchronous work are sticky
/// per stream and reported by [`synchronize`](Device::synchronize).
pub trait Device: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Hardware limits.
    fn limits(&self) -> DeviceLimits;

    /// Free device memory in bytes.
    fn available_memory(&self) -> usize;

    /// Allocate a buffer of `len` elements.
    fn allocate(&self, len: usize) -> DeviceResult<BufferHandle>;

    /// Free a buffer.
    fn free(&self, buffer: BufferHandle) -> DeviceResult<()>;

    /// Page-lock host memory for direct transfers.
    ///
    /// # Safety
    ///
    /// `region` must stay valid until the matching
    /// [`unregister_host`](Device::unregister_host).
    unsafe fn register_host(&self, region: HostSlice) -> DeviceResult<RegistrationHandle>;

    /// Release a host registration.
    fn unregister_host(&self, registration: RegistrationHandle) -> DeviceResult<()>;

    /// Create a stream.
    fn create_stream(&self) -> DeviceResult<StreamHandle>;

    /// Destroy a stream. Pending work must already be synchronized.
    fn destroy_stream(&self, stream: StreamHandle) -> DeviceResult<()>;

    /// Blocking copy of `src` into `dst` at element `offset`.
    fn copy_to_device(&self, dst: BufferHandle, offset: usize, src: &[f64]) -> DeviceResult<()>;

    /// Enqueue a host to device copy on `stream`.
    ///
    /// # Safety
    ///
    /// `src` must stay valid and unwritten until `stream` is synchronized.
    unsafe fn copy_to_device_async(
        &self,
        stream: StreamHandle,
        dst: BufferHandle,
        offset: usize,
        src: HostSlice,
    ) -> DeviceResult<()>;

    /// Enqueue a device to host copy on `stream`.
    ///
    /// # Safety
    ///
    /// `dst` must stay valid and otherwise unaccessed until `stream` is synchronized.
    unsafe fn copy_to_host_async(
        &self,
        stream: StreamHandle,
        src: BufferHandle,
        offset: usize,
        dst: HostSliceMut,
    ) -> DeviceResult<()>;

    /// Enqueue a kernel launch on `stream`.
    ///
    /// An `Err` means the launch was rejected immediately; failures during
    /// execution surface at the next synchronize.
    fn launch(&self, stream: StreamHandle, launch: &KernelLaunch) -> DeviceResult<()>;

    /// Block until all work on `stream` has completed.
    fn synchronize(&self, stream: StreamHandle) -> DeviceResult<()>;
}
