//! Execution entry point.
//!
//! One call runs the whole pipeline: validate, plan, acquire, broadcast,
//! dispatch, synchronize, write back, release. Each call builds its own
//! resource manager, so concurrent calls on one engine share nothing but
//! the device and the resource tracker.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::array::ArrayDescriptor;
use crate::cancel::ExecutionControl;
use crate::config::EngineConfig;
use crate::device::Device;
use crate::error::{ExecutionError, Result};
use crate::kernel::KernelKind;
use crate::params::ParameterVector;
use crate::partition::PartitionPlan;
use crate::report::{DispatchStats, ExecutionReport};
use crate::resources::ResourceManager;
use crate::scheduler::{DispatchStop, Scheduler};
use crate::sync;
use crate::tracking::ResourceTracker;

/// Everything one execution needs from the caller.
#[derive(Debug)]
pub struct ExecutionRequest<'a> {
    kernel: KernelKind,
    arrays: Vec<ArrayDescriptor<'a>>,
    scalars: Vec<f64>,
    problem_size: i64,
    params: ParameterVector,
}

impl<'a> ExecutionRequest<'a> {
    /// A request with no arrays or scalars yet.
    pub fn new(kernel: KernelKind, problem_size: i64, params: ParameterVector) -> Self {
        Self {
            kernel,
            arrays: Vec::new(),
            scalars: Vec::new(),
            problem_size,
            params,
        }
    }

    /// `y = a * x + y` over all of `x` and `y`.
    pub fn axpy(a: f64, x: &'a [f64], y: &'a mut [f64], params: ParameterVector) -> Self {
        let n = y.len() as i64;
        Self::new(KernelKind::Axpy, n, params)
            .with_array(ArrayDescriptor::input(x))
            .with_array(ArrayDescriptor::in_out(y))
            .with_scalars(vec![a])
    }

    /// Append an array argument.
    #[must_use]
    pub fn with_array(mut self, array: ArrayDescriptor<'a>) -> Self {
        self.arrays.push(array);
        self
    }

    /// Set the scalar parameters.
    #[must_use]
    pub fn with_scalars(mut self, scalars: Vec<f64>) -> Self {
        self.scalars = scalars;
        self
    }

    /// Selected kernel.
    pub fn kernel(&self) -> KernelKind {
        self.kernel
    }

    /// Problem size `N`.
    pub fn problem_size(&self) -> i64 {
        self.problem_size
    }

    /// Parameter vector.
    pub fn params(&self) -> &ParameterVector {
        &self.params
    }
}

/// Stream-parallel execution engine bound to one device.
pub struct Engine {
    device: Arc<dyn Device>,
    config: EngineConfig,
    tracker: Arc<ResourceTracker>,
}

impl Engine {
    /// Engine with the default configuration.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self::with_config(device, EngineConfig::default())
    }

    /// Engine with an explicit configuration.
    pub fn with_config(device: Arc<dyn Device>, config: EngineConfig) -> Self {
        let tracker = Arc::new(ResourceTracker::new());
        tracker.set_enabled(config.track_resources);
        info!(
            engine = %config.label,
            device = device.name(),
            remainder = ?config.remainder_policy,
            "Created execution engine"
        );
        Self {
            device,
            config,
            tracker,
        }
    }

    /// The device executions run on.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Resource accounting shared by all calls on this engine.
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// Run `kernel` over `arrays` with the given scalars, problem size and tuning.
    ///
    /// In/out arrays are updated only when the call returns `Ok`. On any
    /// error, cancellation included, they hold exactly what they held before.
    pub fn execute(
        &self,
        kernel: KernelKind,
        arrays: Vec<ArrayDescriptor<'_>>,
        scalars: &[f64],
        problem_size: i64,
        tuning: &ParameterVector,
    ) -> Result<()> {
        let request = ExecutionRequest {
            kernel,
            arrays,
            scalars: scalars.to_vec(),
            problem_size,
            params: *tuning,
        };
        self.run(request, &ExecutionControl::new()).map(|_| ())
    }

    /// Run a prepared request.
    pub fn execute_request(&self, request: ExecutionRequest<'_>) -> Result<()> {
        self.run(request, &ExecutionControl::new()).map(|_| ())
    }

    /// Run a request with cancellation and an advisory deadline.
    ///
    /// Cancellation stops further chunks from being issued; chunks already
    /// issued are synchronized and their resources released, and their
    /// results are discarded.
    pub fn execute_with(
        &self,
        request: ExecutionRequest<'_>,
        control: &ExecutionControl,
    ) -> Result<()> {
        self.run(request, control).map(|_| ())
    }

    /// Run a request and return dispatch statistics.
    pub fn execute_with_report(
        &self,
        request: ExecutionRequest<'_>,
        control: &ExecutionControl,
    ) -> Result<ExecutionReport> {
        self.run(request, control)
    }

    /// Validate and plan a request without touching the device.
    pub fn plan(&self, request: &ExecutionRequest<'_>) -> Result<PartitionPlan> {
        self.validate(request)
    }

    fn validate(&self, request: &ExecutionRequest<'_>) -> Result<PartitionPlan> {
        let params = &request.params;
        if self.config.enforce_device_limits {
            let limits = self.device.limits();
            params.validate_for(&limits)?;
            let shared = request.kernel.shared_mem_bytes(params.threads_per_block());
            if shared > limits.shared_mem_per_block {
                return Err(ExecutionError::InvalidParameter(format!(
                    "{} needs {} bytes of shared memory per block, device allows {}",
                    request.kernel, shared, limits.shared_mem_per_block
                )));
            }
        }

        let plan = PartitionPlan::new(
            request.problem_size,
            params.stream_count(),
            self.config.remainder_policy,
        )?;
        request
            .kernel
            .layout(&request.arrays, &request.scalars, plan.problem_size())?;
        Ok(plan)
    }

    fn run(
        &self,
        mut request: ExecutionRequest<'_>,
        control: &ExecutionControl,
    ) -> Result<ExecutionReport> {
        let start = Instant::now();
        let plan = self.validate(&request)?;
        let layouts = request
            .kernel
            .layout(&request.arrays, &request.scalars, plan.problem_size())?;
        let mut stats = DispatchStats::new(plan.stream_count());

        if plan.is_empty() {
            debug!(kernel = %request.kernel, "Empty problem, nothing to dispatch");
            return Ok(self.report(&request, plan, stats, start));
        }

        let device: &dyn Device = self.device.as_ref();
        let mut manager = ResourceManager::new(device);
        if self.config.track_resources {
            manager = manager.with_tracker(self.tracker.clone());
        }
        let mut resources = manager.acquire(
            &mut request.arrays,
            &layouts,
            request.scalars.len(),
            plan.stream_count(),
            request.params.use_pinned_host(),
        )?;

        let scheduler = Scheduler::new(
            request.kernel,
            &resources,
            &plan,
            &request.params,
            device.limits(),
        );
        let stopped = match scheduler.broadcast(&request.scalars, &mut stats) {
            Ok(()) => {
                let outcome = scheduler.dispatch(control, stats);
                stats = outcome.stats;
                outcome.stopped
            }
            Err(err) => Some(DispatchStop::Failed(0, err)),
        };

        let faults = sync::synchronize_all(device, resources.streams());
        let write_back = if stopped.is_none() && faults.is_empty() {
            resources.write_back(&mut request.arrays)
        } else {
            Ok(())
        };
        let teardown = resources.release().and(write_back);
        drop(resources);

        if let Some(DispatchStop::Cancelled(reason)) = &stopped {
            warn!(
                engine = %self.config.label,
                %reason,
                dispatched = stats.chunks_dispatched,
                total = plan.chunks().len(),
                "Execution cancelled"
            );
        }
        sync::resolve(stopped, faults, teardown)?;

        let report = self.report(&request, plan, stats, start);
        info!(
            engine = %self.config.label,
            kernel = %report.kernel,
            n = report.plan.problem_size(),
            streams = report.plan.stream_count(),
            chunks = report.stats.chunks_dispatched,
            elapsed_us = report.elapsed.as_micros() as u64,
            "Execution complete"
        );
        Ok(report)
    }

    fn report(
        &self,
        request: &ExecutionRequest<'_>,
        plan: PartitionPlan,
        stats: DispatchStats,
        start: Instant,
    ) -> ExecutionReport {
        ExecutionReport {
            kernel: request.kernel,
            device: self.device.name().to_string(),
            parameters: request.params.to_string(),
            plan,
            stats,
            elapsed: start.elapsed(),
        }
    }
}
