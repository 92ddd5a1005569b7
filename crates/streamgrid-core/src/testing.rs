//! In-crate test device that records every call and executes copies eagerly.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::device::{
    BufferHandle, Device, DeviceLimits, HostSlice, HostSliceMut, RegistrationHandle, StreamHandle,
};
use crate::error::{DeviceError, DeviceResult};
use crate::kernel::KernelLaunch;

/// Failure to inject. `nth` counts from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Allocation { nth: usize },
    Registration { nth: usize },
    StreamCreation { nth: usize },
    Free,
    LaunchRejected { nth: usize },
    StreamError { stream_index: usize },
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<u64, Vec<f64>>,
    streams: Vec<u64>,
    live_streams: HashSet<u64>,
    registrations: HashSet<u64>,
    allocations: usize,
    registrations_made: usize,
    streams_made: usize,
    launches: usize,
    launched_on: HashSet<u64>,
    reported: HashSet<u64>,
    launch_log: Vec<KernelLaunch>,
    log: Vec<String>,
}

pub struct RecordingDevice {
    fault: Fault,
    limits: DeviceLimits,
    state: Mutex<State>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_fault(Fault::None)
    }

    pub fn with_fault(fault: Fault) -> Self {
        Self {
            fault,
            limits: DeviceLimits {
                max_threads_per_block: 1024,
                max_streams: 16,
                max_grid_blocks: 65_535,
                shared_mem_per_block: 48 * 1024,
            },
            state: Mutex::new(State::default()),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    pub fn count(&self, op: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|l| l.split(' ').next() == Some(op))
            .count()
    }

    pub fn launches(&self) -> Vec<KernelLaunch> {
        self.state.lock().launch_log.clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_streams(&self) -> usize {
        self.state.lock().live_streams.len()
    }

    pub fn live_registrations(&self) -> usize {
        self.state.lock().registrations.len()
    }

    pub fn live_total(&self) -> usize {
        self.live_buffers() + self.live_streams() + self.live_registrations()
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<f64>> {
        self.state.lock().buffers.get(&buffer.0).cloned()
    }

    fn stream_index(state: &State, stream: StreamHandle) -> Option<usize> {
        state.streams.iter().position(|s| *s == stream.0)
    }
}

impl Device for RecordingDevice {
    fn name(&self) -> &str {
        "recording"
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn available_memory(&self) -> usize {
        1 << 30
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferHandle> {
        let mut state = self.state.lock();
        state.allocations += 1;
        if self.fault == (Fault::Allocation { nth: state.allocations }) {
            return Err(DeviceError::OutOfMemory {
                requested: len * 8,
                available: 0,
            });
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.buffers.insert(handle, vec![0.0; len]);
        state.log.push(format!("allocate {}", handle));
        Ok(BufferHandle(handle))
    }

    fn free(&self, buffer: BufferHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.log.push(format!("free {}", buffer.0));
        if self.fault == Fault::Free {
            return Err(DeviceError::Backend("injected free failure".to_string()));
        }
        state
            .buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| DeviceError::InvalidHandle(buffer.to_string()))
    }

    unsafe fn register_host(&self, _region: HostSlice) -> DeviceResult<RegistrationHandle> {
        let mut state = self.state.lock();
        state.registrations_made += 1;
        if self.fault == (Fault::Registration { nth: state.registrations_made }) {
            return Err(DeviceError::RegistrationFailed("injected".to_string()));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.registrations.insert(handle);
        state.log.push(format!("register_host {}", handle));
        Ok(RegistrationHandle(handle))
    }

    fn unregister_host(&self, registration: RegistrationHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.log.push(format!("unregister_host {}", registration.0));
        if state.registrations.remove(&registration.0) {
            Ok(())
        } else {
            Err(DeviceError::InvalidHandle(registration.to_string()))
        }
    }

    fn create_stream(&self) -> DeviceResult<StreamHandle> {
        let mut state = self.state.lock();
        state.streams_made += 1;
        if self.fault == (Fault::StreamCreation { nth: state.streams_made }) {
            return Err(DeviceError::Stream("injected".to_string()));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.streams.push(handle);
        state.live_streams.insert(handle);
        state.log.push(format!("create_stream {}", handle));
        Ok(StreamHandle(handle))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.log.push(format!("destroy_stream {}", stream.0));
        if state.live_streams.remove(&stream.0) {
            Ok(())
        } else {
            Err(DeviceError::InvalidHandle(stream.to_string()))
        }
    }

    fn copy_to_device(&self, dst: BufferHandle, offset: usize, src: &[f64]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.log.push(format!("copy_to_device {} {} {}", dst.0, offset, src.len()));
        let buffer = state
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| DeviceError::InvalidHandle(dst.to_string()))?;
        let capacity = buffer.len();
        buffer
            .get_mut(offset..offset + src.len())
            .ok_or(DeviceError::OutOfBounds {
                offset,
                len: src.len(),
                capacity,
            })?
            .copy_from_slice(src);
        Ok(())
    }

    unsafe fn copy_to_device_async(
        &self,
        stream: StreamHandle,
        dst: BufferHandle,
        offset: usize,
        src: HostSlice,
    ) -> DeviceResult<()> {
        {
            let mut state = self.state.lock();
            state.log.push(format!(
                "htod {} {} {} {}",
                stream.0,
                dst.0,
                offset,
                src.len()
            ));
        }
        let data = src.as_slice().to_vec();
        let mut state = self.state.lock();
        let buffer = state
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| DeviceError::InvalidHandle(dst.to_string()))?;
        buffer[offset..offset + data.len()].copy_from_slice(&data);
        Ok(())
    }

    unsafe fn copy_to_host_async(
        &self,
        stream: StreamHandle,
        src: BufferHandle,
        offset: usize,
        dst: HostSliceMut,
    ) -> DeviceResult<()> {
        let data = {
            let mut state = self.state.lock();
            state.log.push(format!(
                "dtoh {} {} {} {}",
                stream.0,
                src.0,
                offset,
                dst.len()
            ));
            let buffer = state
                .buffers
                .get(&src.0)
                .ok_or_else(|| DeviceError::InvalidHandle(src.to_string()))?;
            buffer[offset..offset + dst.len()].to_vec()
        };
        dst.as_mut_slice().copy_from_slice(&data);
        Ok(())
    }

    fn launch(&self, stream: StreamHandle, launch: &KernelLaunch) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.launches += 1;
        state.log.push(format!(
            "launch {} {} {}",
            stream.0, launch.chunk.offset, launch.chunk.len
        ));
        if self.fault == (Fault::LaunchRejected { nth: state.launches }) {
            return Err(DeviceError::Launch("injected rejection".to_string()));
        }
        state.launched_on.insert(stream.0);
        state.launch_log.push(*launch);
        Ok(())
    }

    fn synchronize(&self, stream: StreamHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.log.push(format!("synchronize {}", stream.0));
        if let Fault::StreamError { stream_index } = self.fault {
            let failing = Self::stream_index(&state, stream) == Some(stream_index);
            if failing && state.launched_on.contains(&stream.0) && state.reported.insert(stream.0) {
                return Err(DeviceError::Launch(format!(
                    "injected failure on stream {}",
                    stream_index
                )));
            }
        }
        Ok(())
    }
}
