//! Simulated device memory.
//!
//! A [`DeviceMemory`] is a raw, zero-initialized allocation that several
//! stream workers may touch concurrently. Access goes through unsafe,
//! bounds-checked region accessors; callers guarantee that concurrent
//! writers use disjoint regions, exactly as on a real device.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use streamgrid_core::error::{DeviceError, DeviceResult};

/// One device buffer of `f64` elements.
#[derive(Debug)]
pub struct DeviceMemory {
    ptr: NonNull<f64>,
    len: usize,
    layout: Option<Layout>,
}

// SAFETY: the allocation is plain memory owned by this value; concurrent
// access is governed by the unsafe region accessors below.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Allocate `len` zeroed elements.
    pub fn new(len: usize) -> DeviceResult<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
                layout: None,
            });
        }

        let layout = Layout::array::<f64>(len).map_err(|_| DeviceError::OutOfMemory {
            requested: len.saturating_mul(std::mem::size_of::<f64>()),
            available: 0,
        })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut f64).ok_or(DeviceError::OutOfMemory {
            requested: layout.size(),
            available: 0,
        })?;

        Ok(Self {
            ptr,
            len,
            layout: Some(layout),
        })
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f64>()
    }

    fn check(&self, offset: usize, len: usize) -> DeviceResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DeviceError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }

    /// Shared view of `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// No other thread may write the region while the view is alive.
    pub unsafe fn region(&self, offset: usize, len: usize) -> DeviceResult<&[f64]> {
        self.check(offset, len)?;
        Ok(std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len))
    }

    /// Exclusive view of `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// No other thread may read or write the region while the view is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn region_mut(&self, offset: usize, len: usize) -> DeviceResult<&mut [f64]> {
        self.check(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len))
    }

    /// Copy `src` into the buffer at `offset`.
    ///
    /// # Safety
    ///
    /// Same contract as [`region_mut`](Self::region_mut).
    pub unsafe fn write(&self, offset: usize, src: &[f64]) -> DeviceResult<()> {
        self.region_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    /// Copy `[offset, offset + dst.len())` into `dst`.
    ///
    /// # Safety
    ///
    /// Same contract as [`region`](Self::region).
    pub unsafe fn read(&self, offset: usize, dst: &mut [f64]) -> DeviceResult<()> {
        dst.copy_from_slice(self.region(offset, dst.len())?);
        Ok(())
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: ptr was returned by alloc_zeroed with this layout.
            unsafe { dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}
