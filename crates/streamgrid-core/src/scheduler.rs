//! Transfer/compute scheduling.
//!
//! Broadcast data goes to the device once, synchronously. Every chunk then
//! gets, on its own stream and in this order: host to device copies of its
//! input slices, one kernel launch, and device to host copies of its output
//! slices. Nothing here blocks on a stream.

use tracing::debug;

use crate::cancel::ExecutionControl;
use crate::device::{DeviceLimits, StreamHandle};
use crate::error::{CancelReason, DeviceError, ExecutionError, Result};
use crate::kernel::{KernelArgs, KernelKind, KernelLaunch, LaunchGeometry, TransferMode};
use crate::params::ParameterVector;
use crate::partition::{Chunk, PartitionPlan};
use crate::report::DispatchStats;
use crate::resources::ResourceSet;

const F64_BYTES: u64 = std::mem::size_of::<f64>() as u64;

/// Why dispatch stopped before the end of the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStop {
    /// Cooperative cancellation between chunks.
    Cancelled(CancelReason),
    /// A transfer or launch was rejected immediately.
    Failed(usize, ExecutionError),
}

/// Result of the dispatch phase.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// Counters.
    pub stats: DispatchStats,
    /// Set when not every chunk was dispatched.
    pub stopped: Option<DispatchStop>,
}

/// Issues transfers and launches for one execution.
pub struct Scheduler<'a, 'd> {
    kind: KernelKind,
    resources: &'a ResourceSet<'d>,
    plan: &'a PartitionPlan,
    params: &'a ParameterVector,
    limits: DeviceLimits,
}

impl<'a, 'd> Scheduler<'a, 'd> {
    /// Scheduler over acquired resources.
    pub fn new(
        kind: KernelKind,
        resources: &'a ResourceSet<'d>,
        plan: &'a PartitionPlan,
        params: &'a ParameterVector,
        limits: DeviceLimits,
    ) -> Self {
        Self {
            kind,
            resources,
            plan,
            params,
            limits,
        }
    }

    /// Copy the scalar block and broadcast arrays to the device, blocking.
    pub fn broadcast(&self, scalars: &[f64], stats: &mut DispatchStats) -> Result<()> {
        let device = self.resources.device();
        let transfer_failed = |e: DeviceError| ExecutionError::TransferFailed {
            stream: None,
            reason: e.to_string(),
        };

        if let Some(block) = self.resources.scalar_block() {
            device.copy_to_device(block, 0, scalars).map_err(transfer_failed)?;
            stats.bytes_to_device += scalars.len() as u64 * F64_BYTES;
        }

        for array in self.resources.arrays().iter().filter(|a| a.is_broadcast()) {
            // SAFETY: source is live for the whole call and only read here.
            let data = unsafe { array.source().as_slice() };
            device
                .copy_to_device(array.buffer(), 0, data)
                .map_err(transfer_failed)?;
            stats.bytes_to_device += data.len() as u64 * F64_BYTES;
        }
        Ok(())
    }

    /// Dispatch every chunk of the plan, polling `control` between chunks.
    pub fn dispatch(
        &self,
        control: &ExecutionControl,
        mut stats: DispatchStats,
    ) -> DispatchOutcome {
        let args = match self.kernel_args() {
            Ok(args) => args,
            Err(err) => {
                return DispatchOutcome {
                    stats,
                    stopped: Some(DispatchStop::Failed(0, err)),
                }
            }
        };

        for chunk in self.plan.chunks() {
            if let Some(reason) = control.check() {
                debug!(
                    dispatched = stats.chunks_dispatched,
                    remaining = self.plan.chunks().len() - stats.chunks_dispatched,
                    %reason,
                    "Stopping dispatch"
                );
                return DispatchOutcome {
                    stats,
                    stopped: Some(DispatchStop::Cancelled(reason)),
                };
            }

            if let Err(err) = self.dispatch_chunk(chunk, args, &mut stats) {
                return DispatchOutcome {
                    stats,
                    stopped: Some(DispatchStop::Failed(chunk.stream_index, err)),
                };
            }
            stats.chunks_dispatched += 1;
        }

        DispatchOutcome {
            stats,
            stopped: None,
        }
    }

    fn dispatch_chunk(
        &self,
        chunk: &Chunk,
        args: KernelArgs,
        stats: &mut DispatchStats,
    ) -> Result<()> {
        let device = self.resources.device();
        let index = chunk.stream_index;
        let stream = self.stream(index)?;
        let n = self.plan.problem_size();

        let transfer_failed = |e: DeviceError| ExecutionError::TransferFailed {
            stream: Some(index),
            reason: e.to_string(),
        };

        for array in self.resources.arrays() {
            let TransferMode::Chunked { planes } = array.layout().transfer else {
                continue;
            };
            for plane in 0..planes {
                let offset = plane * n + chunk.offset;
                let src = array
                    .source()
                    .range(offset, chunk.len)
                    .ok_or_else(|| out_of_bounds(offset, chunk.len, array.layout().len))?;
                // SAFETY: the source outlives the resource set, which
                // synchronizes this stream before it is dropped.
                unsafe { device.copy_to_device_async(stream, array.buffer(), offset, src) }
                    .map_err(transfer_failed)?;
                stats.bytes_to_device += chunk.len as u64 * F64_BYTES;
            }
        }

        let launch = KernelLaunch {
            geometry: LaunchGeometry::for_chunk(
                chunk.len,
                self.params,
                self.limits.max_grid_blocks,
            ),
            shared_mem_bytes: self.kind.shared_mem_bytes(self.params.threads_per_block()),
            cache_preference: self.params.cache_preference(),
            unroll_factor: self.params.unroll_factor(),
            chunk: *chunk,
            problem_size: n,
            args,
        };
        debug!(
            stream = index,
            offset = chunk.offset,
            len = chunk.len,
            blocks = launch.geometry.blocks,
            threads = launch.geometry.threads_per_block,
            "Dispatching chunk"
        );
        device
            .launch(stream, &launch)
            .map_err(|e| ExecutionError::KernelLaunchFailed {
                stream: index,
                reason: e.to_string(),
            })?;
        stats.per_stream_launches[index] += 1;
        stats.per_stream_elements[index] += chunk.len as u64;

        for array in self.resources.arrays().iter().filter(|a| a.layout().is_output()) {
            let Some(sink) = array.sink() else {
                continue;
            };
            let dst = sink
                .range(chunk.offset, chunk.len)
                .ok_or_else(|| out_of_bounds(chunk.offset, chunk.len, sink.len()))?;
            // SAFETY: chunks are disjoint, so no two streams write the same
            // host range, and the caller's memory is not read until sync.
            unsafe { device.copy_to_host_async(stream, array.buffer(), chunk.offset, dst) }
                .map_err(transfer_failed)?;
            stats.bytes_to_host += chunk.len as u64 * F64_BYTES;
        }

        Ok(())
    }

    fn stream(&self, index: usize) -> Result<StreamHandle> {
        self.resources.streams().get(index).copied().ok_or_else(|| {
            ExecutionError::StreamFailure(format!("no stream with index {}", index))
        })
    }

    fn kernel_args(&self) -> Result<KernelArgs> {
        let arrays = self.resources.arrays();
        let scalars = self
            .resources
            .scalar_block()
            .ok_or_else(|| ExecutionError::ShapeMismatch("missing scalar block".to_string()))?;
        let buffer = |i: usize| {
            arrays
                .get(i)
                .map(|a| a.buffer())
                .ok_or_else(|| ExecutionError::ShapeMismatch(format!("missing array {}", i)))
        };

        match self.kind {
            KernelKind::Axpy => Ok(KernelArgs::Axpy {
                scalars,
                x: buffer(0)?,
                y: buffer(1)?,
            }),
            KernelKind::SparseDiaMatVec => {
                let planes = match arrays.first().map(|a| a.layout().transfer) {
                    Some(TransferMode::Chunked { planes }) => planes,
                    _ => {
                        return Err(ExecutionError::ShapeMismatch(
                            "diagonal values must be chunked".to_string(),
                        ))
                    }
                };
                Ok(KernelArgs::SparseDia {
                    scalars,
                    values: buffer(0)?,
                    x: buffer(1)?,
                    y: buffer(2)?,
                    num_diagonals: u32::try_from(planes).map_err(|_| {
                        ExecutionError::ShapeMismatch(format!("{} diagonals", planes))
                    })?,
                })
            }
        }
    }
}

fn out_of_bounds(offset: usize, len: usize, capacity: usize) -> ExecutionError {
    ExecutionError::TransferFailed {
        stream: None,
        reason: DeviceError::OutOfBounds {
            offset,
            len,
            capacity,
        }
        .to_string(),
    }
}
