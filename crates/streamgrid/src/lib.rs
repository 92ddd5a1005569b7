//! # StreamGrid
//!
//! Stream-parallel bulk array execution for accelerators.
//!
//! StreamGrid splits a flat problem across `S` concurrent streams, overlaps
//! host-to-device copies, kernel launches and device-to-host copies per
//! chunk, and tears every device resource down before returning. The
//! computation is picked from a closed set of kernels and shaped by a
//! [`ParameterVector`] that an external autotuner proposes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use streamgrid::prelude::*;
//!
//! # fn main() -> streamgrid::Result<()> {
//! let grid = StreamGrid::builder().backend(Backend::Cpu).build()?;
//!
//! let x = vec![1.0; 1 << 20];
//! let mut y = vec![0.0; 1 << 20];
//! let tuning = ParameterVector::new(256, 4)?;
//! grid.axpy(2.0, &x, &mut y, &tuning)?;
//! assert!(y.iter().all(|&v| v == 2.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **CPU** - simulated accelerator, always available
//! - **CUDA** - NVIDIA GPUs (requires the `cuda` feature)
//!
//! ```toml
//! [dependencies]
//! streamgrid = { version = "0.1", features = ["cuda"] }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(hidden_glob_reexports)]

mod matrix;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use streamgrid_core::*;
pub use streamgrid_cpu::{CpuDevice, CpuDeviceConfig, CpuDeviceStats, FaultInjection};
pub use streamgrid_cuda::CudaDevice;

pub use matrix::DiaMatrix;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{Backend, DiaMatrix, StreamGrid, StreamGridBuilder};
    pub use streamgrid_core::prelude::*;
}

/// Device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Best available: CUDA when present, otherwise CPU.
    #[default]
    Auto,
    /// Simulated accelerator.
    Cpu,
    /// NVIDIA CUDA.
    Cuda,
    /// A device supplied by the caller.
    Custom,
}

impl Backend {
    /// Lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Auto => "auto",
            Backend::Cpu => "cpu",
            Backend::Cuda => "cuda",
            Backend::Custom => "custom",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Backend::Auto),
            "cpu" => Ok(Backend::Cpu),
            "cuda" | "gpu" => Ok(Backend::Cuda),
            _ => Err(ExecutionError::InvalidParameter(format!(
                "unknown backend '{}'. Valid options: auto, cpu, cuda",
                s
            ))),
        }
    }
}

/// Engine bound to a selected backend.
pub struct StreamGrid {
    engine: Engine,
    backend: Backend,
}

impl StreamGrid {
    /// Create a new builder.
    pub fn builder() -> StreamGridBuilder {
        StreamGridBuilder::new()
    }

    /// Auto-selected backend with the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create with a specific backend.
    pub fn with_backend(backend: Backend) -> Result<Self> {
        Self::builder().backend(backend).build()
    }

    /// The resolved backend (never `Auto`).
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Device name.
    pub fn device_name(&self) -> &str {
        self.engine.device().name()
    }

    /// Resource accounting for all calls on this instance.
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        self.engine.tracker()
    }

    /// See [`Engine::execute`].
    pub fn execute(
        &self,
        kernel: KernelKind,
        arrays: Vec<ArrayDescriptor<'_>>,
        scalars: &[f64],
        problem_size: i64,
        tuning: &ParameterVector,
    ) -> Result<()> {
        self.engine.execute(kernel, arrays, scalars, problem_size, tuning)
    }

    /// See [`Engine::execute_with`].
    pub fn execute_with(
        &self,
        request: ExecutionRequest<'_>,
        control: &ExecutionControl,
    ) -> Result<()> {
        self.engine.execute_with(request, control)
    }

    /// See [`Engine::execute_with_report`].
    pub fn execute_with_report(
        &self,
        request: ExecutionRequest<'_>,
        control: &ExecutionControl,
    ) -> Result<ExecutionReport> {
        self.engine.execute_with_report(request, control)
    }

    /// See [`Engine::plan`].
    pub fn plan(&self, request: &ExecutionRequest<'_>) -> Result<PartitionPlan> {
        self.engine.plan(request)
    }

    /// `y = a * x + y`.
    pub fn axpy(&self, a: f64, x: &[f64], y: &mut [f64], tuning: &ParameterVector) -> Result<()> {
        self.engine.execute_request(ExecutionRequest::axpy(a, x, y, *tuning))
    }

    /// `y += A * x`.
    pub fn dia_matvec(
        &self,
        a: &DiaMatrix,
        x: &[f64],
        y: &mut [f64],
        tuning: &ParameterVector,
    ) -> Result<()> {
        self.engine.execute_request(dia_request(a, x, y, *tuning))
    }
}

/// Build a diagonal-format product request.
pub fn dia_request<'a>(
    a: &'a DiaMatrix,
    x: &'a [f64],
    y: &'a mut [f64],
    tuning: ParameterVector,
) -> ExecutionRequest<'a> {
    ExecutionRequest::new(KernelKind::SparseDiaMatVec, y.len() as i64, tuning)
        .with_array(ArrayDescriptor::input(a.values()))
        .with_array(ArrayDescriptor::input(x))
        .with_array(ArrayDescriptor::in_out(y))
        .with_scalars(a.offset_scalars())
}

/// Builder for [`StreamGrid`].
pub struct StreamGridBuilder {
    backend: Backend,
    device_ordinal: usize,
    config: EngineConfig,
    cpu: CpuDeviceConfig,
    device: Option<Arc<dyn Device>>,
}

impl StreamGridBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            backend: Backend::Auto,
            device_ordinal: 0,
            config: EngineConfig::default(),
            cpu: CpuDeviceConfig::default(),
            device: None,
        }
    }

    /// Set the backend.
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the GPU ordinal.
    #[must_use]
    pub fn device_ordinal(mut self, ordinal: usize) -> Self {
        self.device_ordinal = ordinal;
        self
    }

    /// Set the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure the CPU device (used when the CPU backend is selected).
    #[must_use]
    pub fn cpu_config(mut self, config: CpuDeviceConfig) -> Self {
        self.cpu = config;
        self
    }

    /// Use a caller-supplied device; overrides the backend selection.
    #[must_use]
    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = Some(device);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<StreamGrid> {
        let (backend, device): (Backend, Arc<dyn Device>) = match (self.device, self.backend) {
            (Some(device), _) => (Backend::Custom, device),
            (None, Backend::Auto) => Self::auto(self.device_ordinal, self.cpu)?,
            (None, Backend::Cpu) => (Backend::Cpu, Arc::new(CpuDevice::with_config(self.cpu))),
            (None, Backend::Cuda) => (Backend::Cuda, Self::cuda(self.device_ordinal)?),
            (None, Backend::Custom) => {
                return Err(ExecutionError::BackendUnavailable(
                    "custom backend selected without a device".to_string(),
                ))
            }
        };
        Ok(StreamGrid {
            engine: Engine::with_config(device, self.config),
            backend,
        })
    }

    fn cuda(ordinal: usize) -> Result<Arc<dyn Device>> {
        let device = CudaDevice::new(ordinal)
            .map_err(|e| ExecutionError::BackendUnavailable(format!("CUDA: {}", e)))?;
        Ok(Arc::new(device))
    }

    fn auto(ordinal: usize, cpu: CpuDeviceConfig) -> Result<(Backend, Arc<dyn Device>)> {
        if availability::cuda() {
            match Self::cuda(ordinal) {
                Ok(device) => {
                    tracing::info!("Auto-selected CUDA backend");
                    return Ok((Backend::Cuda, device));
                }
                Err(e) => tracing::warn!(error = %e, "CUDA present but unusable"),
            }
        }
        tracing::info!("Auto-selected CPU backend (no GPU available)");
        Ok((Backend::Cpu, Arc::new(CpuDevice::with_config(cpu))))
    }
}

impl Default for StreamGridBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check availability of backends at runtime.
pub mod availability {
    /// Check if CUDA is available.
    pub fn cuda() -> bool {
        streamgrid_cuda::is_cuda_available()
    }

    /// Get list of available backends.
    pub fn available_backends() -> Vec<super::Backend> {
        let mut backends = vec![super::Backend::Cpu];
        if cuda() {
            backends.push(super::Backend::Cuda);
        }
        backends
    }
}
