//! Failure paths: every one must leave the device with nothing allocated.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use streamgrid::prelude::*;
use streamgrid::{CpuDevice, CpuDeviceConfig, FaultInjection};

fn faulty(faults: FaultInjection) -> (Arc<CpuDevice>, StreamGrid) {
    let device = Arc::new(CpuDevice::with_config(
        CpuDeviceConfig::default().with_faults(faults),
    ));
    let grid = StreamGrid::builder().device(device.clone()).build().unwrap();
    (device, grid)
}

fn assert_clean(device: &CpuDevice, grid: &StreamGrid) {
    let stats = device.stats();
    assert!(stats.is_idle(), "leaked: {:?}", stats);
    assert_eq!(stats.bytes_in_use, 0);
    assert!(grid.tracker().detect_leaks().is_none());
}

fn pinned(threads: i64, streams: i64) -> ParameterVector {
    ParameterVector::builder()
        .threads_per_block(threads)
        .stream_count(streams)
        .use_pinned_host(true)
        .build()
        .unwrap()
}

#[test]
fn test_success_leaves_nothing() {
    let (device, grid) = faulty(FaultInjection::none());
    let x = vec![1.0; 4096];
    let mut y = vec![0.0; 4096];
    grid.axpy(1.0, &x, &mut y, &pinned(64, 4)).unwrap();
    assert_clean(&device, &grid);
    assert_eq!(grid.tracker().stats().total_acquisitions, grid.tracker().stats().total_releases);
}

#[test]
fn test_invalid_threads_acquires_nothing() {
    let (device, grid) = faulty(FaultInjection::none());
    let x = vec![1.0; 64];
    let mut y = vec![0.0; 64];
    let tuning = ParameterVector::new(4096, 2).unwrap();

    let err = grid.axpy(1.0, &x, &mut y, &tuning).unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidParameter(_)));
    assert!(err.is_validation_error());
    assert_eq!(grid.tracker().stats().total_acquisitions, 0);
    assert_clean(&device, &grid);
}

#[test]
fn test_non_positive_parameters_rejected() {
    assert!(matches!(
        ParameterVector::new(0, 4),
        Err(ExecutionError::InvalidParameter(_))
    ));
    assert!(matches!(
        ParameterVector::new(32, -1),
        Err(ExecutionError::InvalidParameter(_))
    ));
}

#[test]
fn test_negative_problem_size() {
    let (device, grid) = faulty(FaultInjection::none());
    let err = grid
        .execute(KernelKind::Axpy, Vec::new(), &[1.0], -5, &pinned(32, 2))
        .unwrap_err();
    assert_eq!(err, ExecutionError::InvalidPartition { size: -5 });
    assert_clean(&device, &grid);
}

#[test]
fn test_shape_mismatch() {
    let (device, grid) = faulty(FaultInjection::none());
    let x = vec![1.0; 10];
    let mut y = vec![0.0; 11];
    let arrays = vec![ArrayDescriptor::input(&x), ArrayDescriptor::in_out(&mut y)];
    let err = grid
        .execute(KernelKind::Axpy, arrays, &[1.0], 11, &pinned(32, 2))
        .unwrap_err();
    assert!(matches!(err, ExecutionError::ShapeMismatch(_)));
    assert_clean(&device, &grid);
}

#[test]
fn test_out_of_memory_rolls_back() {
    let device = Arc::new(CpuDevice::with_config(
        CpuDeviceConfig::default().with_memory_capacity(1000 * 8),
    ));
    let grid = StreamGrid::builder().device(device.clone()).build().unwrap();
    let x = vec![1.0; 800];
    let mut y = vec![0.0; 800];

    let err = grid.axpy(1.0, &x, &mut y, &pinned(32, 2)).unwrap_err();
    assert!(matches!(err, ExecutionError::DeviceOutOfMemory { .. }));
    assert_clean(&device, &grid);
}

#[test]
fn test_registration_failure_rolls_back() {
    let (device, grid) = faulty(FaultInjection::none().fail_registration_at(2));
    let x = vec![1.0; 256];
    let mut y = vec![0.0; 256];

    let err = grid.axpy(1.0, &x, &mut y, &pinned(32, 4)).unwrap_err();
    assert!(matches!(err, ExecutionError::HostRegistrationFailed(_)));
    assert!(y.iter().all(|&v| v == 0.0));
    assert_clean(&device, &grid);
}

#[test]
fn test_stream_creation_failure_rolls_back() {
    let (device, grid) = faulty(FaultInjection::none().fail_stream_creation_at(3));
    let x = vec![1.0; 256];
    let mut y = vec![0.0; 256];

    let err = grid.axpy(1.0, &x, &mut y, &pinned(32, 4)).unwrap_err();
    assert!(matches!(err, ExecutionError::StreamFailure(_)));
    assert_clean(&device, &grid);
}

#[test]
fn test_launch_rejection() {
    let (device, grid) = faulty(FaultInjection::none().reject_launch_at(2));
    let x = vec![1.0; 256];
    let mut y = vec![0.0; 256];

    let err = grid.axpy(1.0, &x, &mut y, &pinned(32, 4)).unwrap_err();
    assert!(matches!(err, ExecutionError::KernelLaunchFailed { stream: 1, .. }));
    assert_clean(&device, &grid);
}

#[test]
fn test_first_failing_stream_reported() {
    let (device, grid) = faulty(FaultInjection::none().fail_launches_on_stream(2));
    let a = DiaMatrix::laplacian_2d(8, 1);
    let x = vec![1.0; a.order()];
    let mut y = vec![0.0; a.order()];

    let err = grid.dia_matvec(&a, &x, &mut y, &pinned(16, 4)).unwrap_err();
    assert_eq!(
        err,
        ExecutionError::KernelLaunchFailed {
            stream: 2,
            reason: "injected failure in dia_matvec launch at offset 32".to_string(),
        }
    );
    assert_clean(&device, &grid);
}

#[test]
fn test_grid_usable_after_failure() {
    let (device, grid) = faulty(FaultInjection::none().reject_launch_at(1));
    let x = vec![1.0; 128];
    let mut y = vec![0.0; 128];
    assert!(grid.axpy(1.0, &x, &mut y, &pinned(32, 2)).is_err());

    let mut y = vec![0.0; 128];
    grid.axpy(1.0, &x, &mut y, &pinned(32, 2)).unwrap();
    assert!(y.iter().all(|&v| v == 1.0));
    assert_clean(&device, &grid);
}

#[test]
fn test_cancel_before_dispatch() {
    let (device, grid) = faulty(FaultInjection::none());
    let x = vec![1.0; 1024];
    let mut y = vec![0.0; 1024];
    let token = CancellationToken::new();
    token.cancel();
    let control = ExecutionControl::new().with_token(token);

    let err = grid
        .execute_with(ExecutionRequest::axpy(1.0, &x, &mut y, pinned(32, 4)), &control)
        .unwrap_err();
    assert_eq!(err, ExecutionError::Cancelled(CancelReason::Requested));
    assert!(err.is_cancelled());
    assert_eq!(device.stats().total_launches, 0);
    assert!(y.iter().all(|&v| v == 0.0));
    assert_clean(&device, &grid);
}

#[test]
fn test_deadline_already_passed() {
    let (device, grid) = faulty(FaultInjection::none());
    let x = vec![1.0; 1024];
    let mut y = vec![0.0; 1024];
    let control = ExecutionControl::new().with_deadline(Instant::now() - Duration::from_millis(1));

    let err = grid
        .execute_with(ExecutionRequest::axpy(1.0, &x, &mut y, pinned(32, 4)), &control)
        .unwrap_err();
    assert_eq!(err, ExecutionError::Cancelled(CancelReason::DeadlineExceeded));
    assert_clean(&device, &grid);
}

#[test]
fn test_stream_fault_fires_on_every_call() {
    let (device, grid) = faulty(FaultInjection::none().fail_launches_on_stream(1));
    let x = vec![1.0; 64];

    for _ in 0..2 {
        let mut y = vec![0.0; 64];
        let err = grid.axpy(1.0, &x, &mut y, &pinned(16, 4)).unwrap_err();
        assert!(matches!(err, ExecutionError::KernelLaunchFailed { stream: 1, .. }));
        assert!(y.iter().all(|&v| v == 0.0));
        assert_clean(&device, &grid);
    }
}

/// Triggers a cancellation token from inside the `after`-th launch.
struct CancelAfterLaunches {
    inner: Arc<CpuDevice>,
    token: CancellationToken,
    after: usize,
    launches: AtomicUsize,
}

impl Device for CancelAfterLaunches {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn limits(&self) -> DeviceLimits {
        self.inner.limits()
    }

    fn available_memory(&self) -> usize {
        self.inner.available_memory()
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferHandle> {
        self.inner.allocate(len)
    }

    fn free(&self, buffer: BufferHandle) -> DeviceResult<()> {
        self.inner.free(buffer)
    }

    unsafe fn register_host(&self, region: HostSlice) -> DeviceResult<RegistrationHandle> {
        self.inner.register_host(region)
    }

    fn unregister_host(&self, registration: RegistrationHandle) -> DeviceResult<()> {
        self.inner.unregister_host(registration)
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        self.inner.create_stream()
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        self.inner.destroy_stream(stream)
    }

    fn copy_to_device(&self, dst: BufferHandle, offset: usize, src: &[f64]) -> DeviceResult<()> {
        self.inner.copy_to_device(dst, offset, src)
    }

    unsafe fn copy_to_device_async(
        &self,
        stream: StreamHandle,
        dst: BufferHandle,
        offset: usize,
        src: HostSlice,
    ) -> DeviceResult<()> {
        self.inner.copy_to_device_async(stream, dst, offset, src)
    }

    unsafe fn copy_to_host_async(
        &self,
        stream: StreamHandle,
        src: BufferHandle,
        offset: usize,
        dst: HostSliceMut,
    ) -> DeviceResult<()> {
        self.inner.copy_to_host_async(stream, src, offset, dst)
    }

    fn launch(&self, stream: StreamHandle, launch: &KernelLaunch) -> DeviceResult<()> {
        self.inner.launch(stream, launch)?;
        if self.launches.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(())
    }

    fn synchronize(&self, stream: StreamHandle) -> DeviceResult<()> {
        self.inner.synchronize(stream)
    }
}

#[test]
fn test_cancel_after_issued_work() {
    let x = vec![1.0; 64];

    for after in 1..=3 {
        let inner = Arc::new(CpuDevice::new());
        let token = CancellationToken::new();
        let device = Arc::new(CancelAfterLaunches {
            inner: inner.clone(),
            token: token.clone(),
            after,
            launches: AtomicUsize::new(0),
        });
        let grid = StreamGrid::builder().device(device).build().unwrap();
        let control = ExecutionControl::new().with_token(token);
        let mut y = vec![0.0; 64];

        let err = grid
            .execute_with(ExecutionRequest::axpy(2.0, &x, &mut y, pinned(16, 4)), &control)
            .unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled(CancelReason::Requested));
        assert_eq!(inner.stats().total_launches, after as u64);
        // Issued chunks ran to completion, but their results were discarded.
        assert!(y.iter().all(|&v| v == 0.0));
        assert_clean(&inner, &grid);
    }
}

#[test]
fn test_outputs_untouched_after_stream_failure() {
    let (device, grid) = faulty(FaultInjection::none().fail_launches_on_stream(3));
    let x = vec![1.0; 64];
    let mut y: Vec<f64> = (0..64).map(f64::from).collect();
    let before = y.clone();

    assert!(grid.axpy(2.0, &x, &mut y, &pinned(16, 4)).is_err());
    assert_eq!(y, before);
    assert_clean(&device, &grid);
}
