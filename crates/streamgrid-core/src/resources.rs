//! Device resource management.
//!
//! A [`ResourceManager`] acquires everything one execution needs in a single
//! all-or-nothing step and hands back a [`ResourceSet`]. The set releases
//! itself on drop, so every exit path (success, error, cancellation or
//! unwinding) ends with zero live device resources.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::array::ArrayDescriptor;
use crate::device::{
    BufferHandle, Device, HostSlice, HostSliceMut, RegistrationHandle, StreamHandle,
};
use crate::error::{DeviceError, ExecutionError, Result};
use crate::kernel::{ArrayLayout, TransferMode};
use crate::tracking::{ResourceKind, ResourceTracker};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Device mirror of one array argument.
#[derive(Debug)]
pub struct DeviceArray {
    buffer: BufferHandle,
    layout: ArrayLayout,
    source: HostSlice,
    sink: Option<HostSliceMut>,
    staging: Option<Vec<f64>>,
}

impl DeviceArray {
    /// Device buffer.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Transfer layout.
    pub fn layout(&self) -> &ArrayLayout {
        &self.layout
    }

    /// Contiguous host memory the array is copied from.
    pub fn source(&self) -> HostSlice {
        self.source
    }

    /// Contiguous host memory results are copied into (outputs only).
    pub fn sink(&self) -> Option<HostSliceMut> {
        self.sink
    }

    /// Whether the array goes through an engine-owned staging copy.
    pub fn is_staged(&self) -> bool {
        self.staging.is_some()
    }

    /// Whether this array is copied whole before chunking starts.
    pub fn is_broadcast(&self) -> bool {
        self.layout.transfer == TransferMode::Broadcast
    }
}

/// Acquires per-call device resources.
pub struct ResourceManager<'d> {
    device: &'d dyn Device,
    tracker: Option<Arc<ResourceTracker>>,
}

impl<'d> ResourceManager<'d> {
    /// Manager for one execution on `device`.
    pub fn new(device: &'d dyn Device) -> Self {
        Self {
            device,
            tracker: None,
        }
    }

    /// Record acquisitions in `tracker`.
    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<ResourceTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Acquire buffers, streams and (optionally) host registrations.
    ///
    /// Output arrays and strided inputs are packed into staging copies
    /// first; contiguous inputs are transferred straight from caller memory. On any failure
    /// everything acquired so far is released before the error is returned.
    pub fn acquire(
        &self,
        arrays: &mut [ArrayDescriptor<'_>],
        layouts: &[ArrayLayout],
        scalar_count: usize,
        stream_count: usize,
        pinned: bool,
    ) -> Result<ResourceSet<'d>> {
        let mut set = ResourceSet {
            device: self.device,
            tracker: self.tracker.clone(),
            arrays: Vec::with_capacity(arrays.len()),
            buffers: Vec::with_capacity(arrays.len() + 1),
            scalar_block: None,
            streams: Vec::with_capacity(stream_count),
            registrations: Vec::new(),
            released: false,
        };

        match self.populate(&mut set, arrays, layouts, scalar_count, stream_count, pinned) {
            Ok(()) => {
                debug!(
                    device = self.device.name(),
                    buffers = set.buffers.len(),
                    streams = set.streams.len(),
                    registrations = set.registrations.len(),
                    "Acquired execution resources"
                );
                Ok(set)
            }
            Err(err) => {
                debug!(error = %err, "Acquisition failed, rolling back");
                if let Err(release_err) = set.release() {
                    warn!(error = %release_err, "Rollback after failed acquisition was incomplete");
                }
                Err(err)
            }
        }
    }

    fn populate(
        &self,
        set: &mut ResourceSet<'d>,
        arrays: &mut [ArrayDescriptor<'_>],
        layouts: &[ArrayLayout],
        scalar_count: usize,
        stream_count: usize,
        pinned: bool,
    ) -> Result<()> {
        if arrays.len() != layouts.len() {
            return Err(ExecutionError::ShapeMismatch(format!(
                "{} arrays but {} layouts",
                arrays.len(),
                layouts.len()
            )));
        }

        for (index, (desc, layout)) in arrays.iter_mut().zip(layouts).enumerate() {
            let buffer = self.allocate(set, layout.len, &format!("array {}", index))?;

            let (source, sink, staging) = if layout.is_output() {
                // Outputs land in an engine-owned copy; the caller's array is
                // only written by `write_back` after a clean synchronization.
                let mut packed = desc.gather();
                let sink = HostSliceMut::from_slice(&mut packed);
                // Moving the Vec keeps its heap allocation, so both views stay valid.
                (sink.as_const(), Some(sink), Some(packed))
            } else if desc.is_contiguous() {
                (desc.host_slice(), None, None)
            } else {
                let packed = desc.gather();
                (HostSlice::from_slice(&packed), None, Some(packed))
            };

            set.arrays.push(DeviceArray {
                buffer,
                layout: *layout,
                source,
                sink,
                staging,
            });
        }

        if scalar_count > 0 {
            let block = self.allocate(set, scalar_count, "scalar block")?;
            set.scalar_block = Some(block);
        }

        for index in 0..stream_count {
            let stream = self
                .device
                .create_stream()
                .map_err(|e| ExecutionError::StreamFailure(e.to_string()))?;
            set.streams.push(stream);
            set.track(ResourceKind::Stream, stream.0, 0, &format!("stream {}", index));
        }

        if pinned {
            for index in 0..set.arrays.len() {
                let region = set.arrays[index].source;
                // SAFETY: the region is either caller memory borrowed for the
                // whole call or a staging vector owned by `set`; both outlive
                // the registration, which `set` removes on release.
                let registration = unsafe { self.device.register_host(region) }
                    .map_err(|e| ExecutionError::HostRegistrationFailed(e.to_string()))?;
                set.registrations.push(registration);
                set.track(
                    ResourceKind::HostRegistration,
                    registration.0,
                    region.size_bytes(),
                    &format!("array {}", index),
                );
            }
        }

        Ok(())
    }

    fn allocate(&self, set: &mut ResourceSet<'d>, len: usize, label: &str) -> Result<BufferHandle> {
        let buffer = self.device.allocate(len).map_err(|e| match e {
            DeviceError::OutOfMemory {
                requested,
                available,
            } => ExecutionError::DeviceOutOfMemory {
                requested,
                available,
            },
            _ => ExecutionError::DeviceOutOfMemory {
                requested: len * F64_BYTES,
                available: self.device.available_memory(),
            },
        })?;
        set.buffers.push(buffer);
        set.track(ResourceKind::DeviceBuffer, buffer.0, len * F64_BYTES, label);
        Ok(buffer)
    }
}

/// Resources owned by one execution call.
///
/// Dropping the set releases it. [`release`](Self::release) may also be
/// called explicitly to observe teardown errors; later calls are no-ops.
pub struct ResourceSet<'d> {
    device: &'d dyn Device,
    tracker: Option<Arc<ResourceTracker>>,
    arrays: Vec<DeviceArray>,
    buffers: Vec<BufferHandle>,
    scalar_block: Option<BufferHandle>,
    streams: Vec<StreamHandle>,
    registrations: Vec<RegistrationHandle>,
    released: bool,
}

impl<'d> ResourceSet<'d> {
    /// Device the resources live on.
    pub fn device(&self) -> &'d dyn Device {
        self.device
    }

    /// Array mirrors in argument order.
    pub fn arrays(&self) -> &[DeviceArray] {
        &self.arrays
    }

    /// Buffer holding the scalar parameters, if any.
    pub fn scalar_block(&self) -> Option<BufferHandle> {
        self.scalar_block
    }

    /// Streams in creation order.
    pub fn streams(&self) -> &[StreamHandle] {
        &self.streams
    }

    /// Number of host registrations.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Whether the set has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Copy staged outputs back into the caller's host arrays.
    ///
    /// Only called after every stream synchronized without error, so a
    /// failed or cancelled call never leaves partial results behind.
    pub fn write_back(&self, arrays: &mut [ArrayDescriptor<'_>]) -> Result<()> {
        for (mirror, desc) in self.arrays.iter().zip(arrays.iter_mut()) {
            if let (true, Some(staging)) = (mirror.layout.is_output(), &mirror.staging) {
                desc.scatter(staging)?;
            }
        }
        Ok(())
    }

    /// Release everything: synchronize streams, destroy streams,
    /// unregister host memory, free buffers.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned as [`ExecutionError::TeardownFailed`]. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut first_error: Option<String> = None;
        let mut note = |what: &str, err: DeviceError| {
            warn!(error = %err, "Failed to {}", what);
            if first_error.is_none() {
                first_error = Some(format!("{}: {}", what, err));
            }
        };

        // Errors here were already reported by the synchronization phase.
        for stream in &self.streams {
            if let Err(err) = self.device.synchronize(*stream) {
                debug!(stream = %stream, error = %err, "Stream error observed during release");
            }
        }

        for stream in self.streams.drain(..) {
            match self.device.destroy_stream(stream) {
                Ok(()) => untrack(&self.tracker, ResourceKind::Stream, stream.0),
                Err(err) => note("destroy stream", err),
            }
        }

        for registration in self.registrations.drain(..) {
            match self.device.unregister_host(registration) {
                Ok(()) => untrack(&self.tracker, ResourceKind::HostRegistration, registration.0),
                Err(err) => note("unregister host memory", err),
            }
        }

        for buffer in self.buffers.drain(..) {
            match self.device.free(buffer) {
                Ok(()) => untrack(&self.tracker, ResourceKind::DeviceBuffer, buffer.0),
                Err(err) => note("free device buffer", err),
            }
        }

        self.scalar_block = None;
        self.arrays.clear();

        match first_error {
            Some(reason) => Err(ExecutionError::TeardownFailed(reason)),
            None => Ok(()),
        }
    }

    fn track(&self, kind: ResourceKind, handle: u64, size: usize, label: &str) {
        if let Some(tracker) = &self.tracker {
            tracker.track_acquire(kind, handle, size, label);
        }
    }
}

fn untrack(tracker: &Option<Arc<ResourceTracker>>, kind: ResourceKind, handle: u64) {
    if let Some(tracker) = tracker {
        tracker.track_release(kind, handle);
    }
}

impl Drop for ResourceSet<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "Resource release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelKind;
    use crate::testing::{Fault, RecordingDevice};

    fn axpy_layouts(arrays: &[ArrayDescriptor<'_>], n: usize) -> Vec<ArrayLayout> {
        KernelKind::Axpy.layout(arrays, &[1.0], n).unwrap()
    }

    #[test]
    fn test_acquire_and_release() {
        let device = RecordingDevice::new();
        let tracker = Arc::new(ResourceTracker::new());
        let x = vec![1.0; 8];
        let mut y = vec![0.0; 8];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 8);

        let manager = ResourceManager::new(&device).with_tracker(tracker.clone());
        let mut set = manager.acquire(&mut arrays, &layouts, 1, 4, true).unwrap();

        assert_eq!(set.arrays().len(), 2);
        assert_eq!(set.streams().len(), 4);
        assert_eq!(set.registration_count(), 2);
        assert!(set.scalar_block().is_some());
        assert!(set.arrays()[1].sink().is_some());
        assert!(set.arrays()[0].sink().is_none());
        assert_eq!(device.live_buffers(), 3);
        assert_eq!(tracker.live_count(), 9);

        set.release().unwrap();
        assert!(set.is_released());
        assert_eq!(device.live_total(), 0);
        assert!(tracker.detect_leaks().is_none());

        // Idempotent.
        set.release().unwrap();
        assert_eq!(device.count("free"), 3);
    }

    #[test]
    fn test_release_order() {
        let device = RecordingDevice::new();
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 4);

        let set = ResourceManager::new(&device)
            .acquire(&mut arrays, &layouts, 1, 2, true)
            .unwrap();
        device.clear_log();
        drop(set);

        let ops: Vec<String> = device
            .log()
            .into_iter()
            .map(|op| op.split(' ').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            ops,
            vec![
                "synchronize",
                "synchronize",
                "destroy_stream",
                "destroy_stream",
                "unregister_host",
                "unregister_host",
                "free",
                "free",
                "free"
            ]
        );
    }

    #[test]
    fn test_rollback_on_allocation_failure() {
        let device = RecordingDevice::with_fault(Fault::Allocation { nth: 2 });
        let tracker = Arc::new(ResourceTracker::new());
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 4);

        let err = ResourceManager::new(&device)
            .with_tracker(tracker.clone())
            .acquire(&mut arrays, &layouts, 1, 2, false)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::DeviceOutOfMemory { .. }));
        assert_eq!(device.live_total(), 0);
        assert!(tracker.detect_leaks().is_none());
        assert_eq!(device.count("create_stream"), 0);
    }

    #[test]
    fn test_rollback_on_registration_failure() {
        let device = RecordingDevice::with_fault(Fault::Registration { nth: 1 });
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 4);

        let err = ResourceManager::new(&device)
            .acquire(&mut arrays, &layouts, 1, 3, true)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::HostRegistrationFailed(_)));
        assert_eq!(device.live_total(), 0);
        assert_eq!(device.count("destroy_stream"), 3);
    }

    #[test]
    fn test_rollback_on_stream_failure() {
        let device = RecordingDevice::with_fault(Fault::StreamCreation { nth: 1 });
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 4);

        let err = ResourceManager::new(&device)
            .acquire(&mut arrays, &layouts, 1, 3, false)
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::StreamFailure(_)));
        assert_eq!(device.live_total(), 0);
    }

    #[test]
    fn test_strided_output_is_staged_and_written_back() {
        let device = RecordingDevice::new();
        let x = vec![1.0; 3];
        let mut y_host = vec![0.0, -1.0, 0.0, -1.0, 0.0];
        {
            let mut arrays = [
                ArrayDescriptor::input(&x),
                ArrayDescriptor::in_out_strided(&mut y_host, 3, 2).unwrap(),
            ];
            let layouts = axpy_layouts(&arrays, 3);
            let set = ResourceManager::new(&device)
                .acquire(&mut arrays, &layouts, 1, 1, false)
                .unwrap();
            assert!(set.arrays()[1].is_staged());
            assert!(!set.arrays()[0].is_staged());

            let sink = set.arrays()[1].sink().unwrap();
            unsafe { sink.as_mut_slice() }.copy_from_slice(&[5.0, 6.0, 7.0]);
            set.write_back(&mut arrays).unwrap();
        }
        assert_eq!(y_host, vec![5.0, -1.0, 6.0, -1.0, 7.0]);
    }

    #[test]
    fn test_contiguous_output_untouched_until_write_back() {
        let device = RecordingDevice::new();
        let x = vec![1.0; 4];
        let mut y = vec![0.0; 4];
        {
            let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
            let layouts = axpy_layouts(&arrays, 4);
            let set = ResourceManager::new(&device)
                .acquire(&mut arrays, &layouts, 1, 1, false)
                .unwrap();
            assert!(set.arrays()[1].is_staged());

            let sink = set.arrays()[1].sink().unwrap();
            assert_eq!(sink.as_const().as_ptr(), set.arrays()[1].source().as_ptr());
            unsafe { sink.as_mut_slice() }.copy_from_slice(&[3.0; 4]);
            // Dropped without write_back, as after a failed synchronization.
        }
        assert_eq!(y, vec![0.0; 4]);
    }

    #[test]
    fn test_teardown_failure_reported() {
        let device = RecordingDevice::with_fault(Fault::Free);
        let x = vec![1.0; 2];
        let mut y = vec![0.0; 2];
        let mut arrays = [ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
        let layouts = axpy_layouts(&arrays, 2);

        let mut set = ResourceManager::new(&device)
            .acquire(&mut arrays, &layouts, 1, 1, false)
            .unwrap();
        let err = set.release().unwrap_err();
        assert!(matches!(err, ExecutionError::TeardownFailed(_)));
        assert_eq!(device.live_streams(), 0);
        assert!(set.release().is_ok());
    }
}
