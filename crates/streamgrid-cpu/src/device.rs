//! The simulated accelerator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use streamgrid_core::device::{
    BufferHandle, Device, DeviceLimits, HostSlice, HostSliceMut, RegistrationHandle, StreamHandle,
};
use streamgrid_core::error::{DeviceError, DeviceResult};
use streamgrid_core::kernel::{KernelArgs, KernelLaunch};

use crate::fault::{FaultCounters, FaultInjection};
use crate::kernels::{ResolvedArgs, ResolvedLaunch};
use crate::memory::DeviceMemory;
use crate::stream::{self, Command, StreamWorker};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Configuration for a [`CpuDevice`].
#[derive(Debug, Clone)]
pub struct CpuDeviceConfig {
    /// Device name reported to the engine.
    pub name: String,
    /// Limits the engine validates against.
    pub limits: DeviceLimits,
    /// Simulated device memory in bytes.
    pub memory_capacity: usize,
    /// Injected failures.
    pub faults: FaultInjection,
}

impl Default for CpuDeviceConfig {
    fn default() -> Self {
        Self {
            name: "cpu-simulated".to_string(),
            limits: DeviceLimits::default(),
            memory_capacity: 4 << 30,
            faults: FaultInjection::none(),
        }
    }
}

impl CpuDeviceConfig {
    /// Sets the device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the device limits.
    #[must_use]
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the simulated memory capacity in bytes.
    #[must_use]
    pub fn with_memory_capacity(mut self, bytes: usize) -> Self {
        self.memory_capacity = bytes;
        self
    }

    /// Sets fault injection.
    #[must_use]
    pub fn with_faults(mut self, faults: FaultInjection) -> Self {
        self.faults = faults;
        self
    }
}

/// Snapshot of live resources and lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDeviceStats {
    /// Buffers currently allocated.
    pub live_buffers: usize,
    /// Streams currently alive.
    pub live_streams: usize,
    /// Host registrations currently held.
    pub live_registrations: usize,
    /// Bytes of device memory in use.
    pub bytes_in_use: usize,
    /// Launches executed or rejected over the device's lifetime.
    pub total_launches: u64,
}

impl CpuDeviceStats {
    /// Whether nothing is allocated, registered or running.
    pub fn is_idle(&self) -> bool {
        self.live_buffers == 0 && self.live_streams == 0 && self.live_registrations == 0
    }
}

/// A device that runs streams as worker threads and grids on rayon.
pub struct CpuDevice {
    config: CpuDeviceConfig,
    next_handle: AtomicU64,
    buffers: RwLock<HashMap<u64, Arc<DeviceMemory>>>,
    streams: Mutex<HashMap<u64, StreamWorker>>,
    registrations: Mutex<HashMap<u64, (usize, usize)>>,
    bytes_in_use: AtomicUsize,
    next_stream_index: AtomicUsize,
    total_launches: AtomicU64,
    fault_counters: FaultCounters,
}

impl CpuDevice {
    /// Create a device with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CpuDeviceConfig::default())
    }

    /// Create a device with an explicit configuration.
    pub fn with_config(config: CpuDeviceConfig) -> Self {
        info!(
            name = %config.name,
            memory_mb = config.memory_capacity >> 20,
            max_streams = config.limits.max_streams,
            faults = config.faults.is_active(),
            "Initializing CPU device"
        );
        Self {
            config,
            next_handle: AtomicU64::new(1),
            buffers: RwLock::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            bytes_in_use: AtomicUsize::new(0),
            next_stream_index: AtomicUsize::new(0),
            total_launches: AtomicU64::new(0),
            fault_counters: FaultCounters::default(),
        }
    }

    /// Device configuration.
    pub fn config(&self) -> &CpuDeviceConfig {
        &self.config
    }

    /// Live-resource snapshot.
    pub fn stats(&self) -> CpuDeviceStats {
        CpuDeviceStats {
            live_buffers: self.buffers.read().len(),
            live_streams: self.streams.lock().len(),
            live_registrations: self.registrations.lock().len(),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
            total_launches: self.total_launches.load(Ordering::Relaxed),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, handle: BufferHandle) -> DeviceResult<Arc<DeviceMemory>> {
        self.buffers
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| DeviceError::InvalidHandle(handle.to_string()))
    }

    fn stream_sender(
        &self,
        stream: StreamHandle,
    ) -> DeviceResult<(usize, crossbeam::channel::Sender<Command>)> {
        let streams = self.streams.lock();
        let worker = streams
            .get(&stream.0)
            .ok_or_else(|| DeviceError::InvalidHandle(stream.to_string()))?;
        Ok((worker.index(), worker.sender()?))
    }

    fn submit(&self, stream: StreamHandle, command: Command) -> DeviceResult<usize> {
        let (index, sender) = self.stream_sender(stream)?;
        sender
            .send(command)
            .map_err(|_| DeviceError::Stream(format!("{} is shut down", stream)))?;
        Ok(index)
    }

    fn resolve(&self, args: &KernelArgs) -> DeviceResult<ResolvedArgs> {
        Ok(match *args {
            KernelArgs::Axpy { scalars, x, y } => ResolvedArgs::Axpy {
                scalars: self.buffer(scalars)?,
                x: self.buffer(x)?,
                y: self.buffer(y)?,
            },
            KernelArgs::SparseDia {
                scalars,
                values,
                x,
                y,
                num_diagonals,
            } => ResolvedArgs::SparseDia {
                scalars: self.buffer(scalars)?,
                values: self.buffer(values)?,
                x: self.buffer(x)?,
                y: self.buffer(y)?,
                num_diagonals: num_diagonals as usize,
            },
        })
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }

    fn available_memory(&self) -> usize {
        self.config
            .memory_capacity
            .saturating_sub(self.bytes_in_use.load(Ordering::Relaxed))
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferHandle> {
        let requested = len.saturating_mul(F64_BYTES);
        let available = self.available_memory();
        if self.fault_counters.allocation(&self.config.faults) || requested > available {
            return Err(DeviceError::OutOfMemory {
                requested,
                available,
            });
        }

        let memory = DeviceMemory::new(len)?;
        let handle = self.next_handle();
        self.bytes_in_use.fetch_add(requested, Ordering::Relaxed);
        self.buffers.write().insert(handle, Arc::new(memory));
        debug!(buffer = handle, bytes = requested, "Allocated device buffer");
        Ok(BufferHandle(handle))
    }

    fn free(&self, buffer: BufferHandle) -> DeviceResult<()> {
        let memory = self
            .buffers
            .write()
            .remove(&buffer.0)
            .ok_or_else(|| DeviceError::InvalidHandle(buffer.to_string()))?;
        self.bytes_in_use
            .fetch_sub(memory.size_bytes(), Ordering::Relaxed);
        Ok(())
    }

    unsafe fn register_host(&self, region: HostSlice) -> DeviceResult<RegistrationHandle> {
        if self.fault_counters.registration(&self.config.faults) {
            return Err(DeviceError::RegistrationFailed(format!(
                "injected failure registering {} bytes",
                region.size_bytes()
            )));
        }
        let handle = self.next_handle();
        self.registrations
            .lock()
            .insert(handle, (region.as_ptr() as usize, region.len()));
        Ok(RegistrationHandle(handle))
    }

    fn unregister_host(&self, registration: RegistrationHandle) -> DeviceResult<()> {
        self.registrations
            .lock()
            .remove(&registration.0)
            .map(|_| ())
            .ok_or_else(|| DeviceError::InvalidHandle(registration.to_string()))
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        if self.fault_counters.stream(&self.config.faults) {
            return Err(DeviceError::Stream("injected stream creation failure".to_string()));
        }
        // Indices restart at 0 whenever no stream is live, so each execution
        // on an otherwise idle device numbers its streams from 0.
        let mut streams = self.streams.lock();
        if streams.is_empty() {
            self.next_stream_index.store(0, Ordering::Relaxed);
        }
        let index = self.next_stream_index.fetch_add(1, Ordering::Relaxed);
        let worker = StreamWorker::spawn(index)?;
        let handle = self.next_handle();
        streams.insert(handle, worker);
        Ok(StreamHandle(handle))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        let mut worker = self
            .streams
            .lock()
            .remove(&stream.0)
            .ok_or_else(|| DeviceError::InvalidHandle(stream.to_string()))?;
        worker.shutdown()
    }

    fn copy_to_device(&self, dst: BufferHandle, offset: usize, src: &[f64]) -> DeviceResult<()> {
        let memory = self.buffer(dst)?;
        // SAFETY: synchronous copies happen before any stream touches the buffer.
        unsafe { memory.write(offset, src) }.map_err(|e| DeviceError::Transfer(e.to_string()))
    }

    unsafe fn copy_to_device_async(
        &self,
        stream: StreamHandle,
        dst: BufferHandle,
        offset: usize,
        src: HostSlice,
    ) -> DeviceResult<()> {
        let dst = self.buffer(dst)?;
        self.submit(stream, Command::CopyToDevice { dst, offset, src })?;
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        stream: StreamHandle,
        src: BufferHandle,
        offset: usize,
        dst: HostSliceMut,
    ) -> DeviceResult<()> {
        let src = self.buffer(src)?;
        self.submit(stream, Command::CopyToHost { src, offset, dst })?;
        Ok(())
    }

    fn launch(&self, stream: StreamHandle, launch: &KernelLaunch) -> DeviceResult<()> {
        self.total_launches.fetch_add(1, Ordering::Relaxed);
        if self.fault_counters.launch(&self.config.faults) {
            return Err(DeviceError::Launch(format!(
                "injected rejection of {} launch",
                launch.kind()
            )));
        }
        if launch.geometry.threads_per_block > self.config.limits.max_threads_per_block {
            return Err(DeviceError::Launch(format!(
                "{} threads per block exceeds {}",
                launch.geometry.threads_per_block, self.config.limits.max_threads_per_block
            )));
        }

        let (index, sender) = self.stream_sender(stream)?;
        let resolved = ResolvedLaunch {
            launch: *launch,
            args: self.resolve(&launch.args)?,
        };
        let inject_failure = self.config.faults.fail_launches_on_stream == Some(index);
        sender
            .send(Command::Launch {
                launch: Box::new(resolved),
                inject_failure,
            })
            .map_err(|_| DeviceError::Stream(format!("{} is shut down", stream)))
    }

    fn synchronize(&self, stream: StreamHandle) -> DeviceResult<()> {
        let (index, sender) = self.stream_sender(stream)?;
        stream::barrier(index, &sender)
    }
}
