//! `streamgrid run` command - Execute a kernel on synthetic data.

use std::time::{Duration, Instant};

use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use tracing::debug;

use streamgrid::{
    dia_request, DiaMatrix, ExecutionControl, ExecutionReport, ExecutionRequest, ParameterVector,
    StreamGrid,
};

use crate::error::{CliError, CliResult};

use super::{build_grid, detail, engine_config, OutputFormat, RemainderArg, TuningArgs};

/// Relative tolerance for the diagonal product; summation order differs from the reference.
const DIA_TOLERANCE: f64 = 1e-9;

/// Kernel selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KernelArg {
    /// y = a * x + y
    Axpy,
    /// y += A * x with A a five-point stencil in diagonal format
    Dia,
}

/// Arguments for `streamgrid run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Kernel to execute
    #[arg(value_enum)]
    pub kernel: KernelArg,

    /// Problem size (axpy)
    #[arg(short = 'n', long, default_value = "1000000")]
    pub size: i64,

    /// Grid side length (dia); the matrix order is grid * grid * dof
    #[arg(long, default_value = "256")]
    pub grid: usize,

    /// Unknowns per grid point (dia)
    #[arg(long, default_value = "1")]
    pub dof: usize,

    /// Scalar multiplier (axpy)
    #[arg(short, long, default_value = "2.0")]
    pub alpha: f64,

    #[command(flatten)]
    pub tuning: TuningArgs,

    /// Backend (auto, cpu, cuda)
    #[arg(short, long, default_value = "auto")]
    pub backend: String,

    /// GPU ordinal
    #[arg(long, default_value = "0")]
    pub device: usize,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,

    /// Remainder policy, overriding the configuration file
    #[arg(long, value_enum)]
    pub remainder: Option<RemainderArg>,

    /// Number of timed executions
    #[arg(short, long, default_value = "1")]
    pub iterations: u32,

    /// Abort an execution that runs longer than this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Compare the result against the sequential reference
    #[arg(long)]
    pub verify: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Outcome of a verified run.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Verification {
    /// Largest absolute difference from the reference.
    pub max_abs_error: f64,
    /// Whether the difference is within the kernel's tolerance.
    pub passed: bool,
}

/// Machine-readable run summary.
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    backend: String,
    iterations: u32,
    min_ms: f64,
    mean_ms: f64,
    report: &'a ExecutionReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<Verification>,
}

/// Synthetic operands for one kernel.
enum Workload {
    Axpy { a: f64, x: Vec<f64>, y: Vec<f64> },
    Dia { matrix: DiaMatrix, x: Vec<f64>, y: Vec<f64> },
}

impl Workload {
    fn new(args: &RunArgs) -> CliResult<Self> {
        match args.kernel {
            KernelArg::Axpy => {
                let n = usize::try_from(args.size)
                    .map_err(|_| streamgrid::ExecutionError::InvalidPartition { size: args.size })?;
                Ok(Workload::Axpy {
                    a: args.alpha,
                    x: synthetic(n),
                    y: vec![1.0; n],
                })
            }
            KernelArg::Dia => {
                let matrix = DiaMatrix::laplacian_2d(args.grid, args.dof);
                let n = matrix.order();
                Ok(Workload::Dia {
                    matrix,
                    x: synthetic(n),
                    y: vec![0.0; n],
                })
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Workload::Axpy { y, .. } | Workload::Dia { y, .. } => y.len(),
        }
    }

    /// Run once on a fresh copy of `y`, returning the report and the output.
    fn execute(
        &self,
        grid: &StreamGrid,
        params: ParameterVector,
        control: &ExecutionControl,
    ) -> CliResult<(ExecutionReport, Vec<f64>)> {
        let outcome = match self {
            Workload::Axpy { a, x, y } => {
                let mut out = y.clone();
                let report = grid
                    .execute_with_report(ExecutionRequest::axpy(*a, x, &mut out, params), control)?;
                (report, out)
            }
            Workload::Dia { matrix, x, y } => {
                let mut out = y.clone();
                let report =
                    grid.execute_with_report(dia_request(matrix, x, &mut out, params), control)?;
                (report, out)
            }
        };
        Ok(outcome)
    }

    fn verify(&self, result: &[f64]) -> Verification {
        match self {
            Workload::Axpy { a, x, y } => {
                let mut expected = y.clone();
                streamgrid::kernel::reference::axpy(*a, x, &mut expected);
                let max_abs_error = max_abs_diff(&expected, result);
                Verification {
                    max_abs_error,
                    passed: expected
                        .iter()
                        .zip(result)
                        .all(|(e, r)| e.to_bits() == r.to_bits()),
                }
            }
            Workload::Dia { matrix, x, y } => {
                let mut expected = y.clone();
                matrix.matvec_reference(x, &mut expected);
                let max_abs_error = max_abs_diff(&expected, result);
                let scale = expected.iter().fold(1.0_f64, |m, v| m.max(v.abs()));
                Verification {
                    max_abs_error,
                    passed: max_abs_error <= DIA_TOLERANCE * scale,
                }
            }
        }
    }
}

/// Execute the `run` command.
pub fn execute(args: &RunArgs) -> CliResult<()> {
    let params = args.tuning.to_params()?;
    let config = engine_config(args.config.as_deref(), args.remainder)?;
    let grid = build_grid(&args.backend, args.device, config)?;
    let workload = Workload::new(args)?;
    let iterations = args.iterations.max(1);
    let text = args.format == OutputFormat::Text;

    if text {
        println!("{} Running {:?} kernel", "→".bright_cyan(), args.kernel);
        detail("Backend", format!("{} ({})", grid.backend(), grid.device_name()));
        detail("Problem size", workload.len());
        detail("Parameters", params);
        println!();
    }

    let mut times = Vec::with_capacity(iterations as usize);
    let mut last = None;
    for iteration in 0..iterations {
        let control = match args.timeout_ms {
            Some(ms) => ExecutionControl::new().with_timeout(Duration::from_millis(ms)),
            None => ExecutionControl::new(),
        };
        let start = Instant::now();
        let (report, out) = workload.execute(&grid, params, &control)?;
        let elapsed = start.elapsed();
        debug!(iteration, elapsed_us = elapsed.as_micros() as u64, "Run complete");
        times.push(elapsed);
        last = Some((report, out));
    }
    let Some((report, out)) = last else {
        return Ok(());
    };

    let verification = args.verify.then(|| workload.verify(&out));
    let min_ms = times.iter().min().map_or(0.0, |d| d.as_secs_f64() * 1000.0);
    let mean_ms = times.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / times.len() as f64;

    match args.format {
        OutputFormat::Json => {
            let summary = RunSummary {
                backend: grid.backend().to_string(),
                iterations,
                min_ms,
                mean_ms,
                report: &report,
                verification,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => print_report(&report, iterations, min_ms, mean_ms, verification),
    }

    match verification {
        Some(v) if !v.passed => Err(CliError::Verification(format!(
            "max abs error {:e} exceeds tolerance",
            v.max_abs_error
        ))),
        _ => Ok(()),
    }
}

fn print_report(
    report: &ExecutionReport,
    iterations: u32,
    min_ms: f64,
    mean_ms: f64,
    verification: Option<Verification>,
) {
    println!("{}:", "Execution Report".bright_white().underline());
    println!();
    detail("Chunks", report.stats.chunks_dispatched);
    detail("Launches", report.stats.total_launches());
    for (stream, (launches, elements)) in report
        .stats
        .per_stream_launches
        .iter()
        .zip(&report.stats.per_stream_elements)
        .enumerate()
    {
        println!(
            "    {} stream {}: {} launch(es), {} elements",
            "•".dimmed(),
            stream,
            launches,
            elements
        );
    }
    detail("Host to device", format!("{} bytes", report.stats.bytes_to_device));
    detail("Device to host", format!("{} bytes", report.stats.bytes_to_host));
    detail("Balance", format!("{:.1}%", report.stats.balance_ratio() * 100.0));
    println!();

    println!("{}:", "Timing".bright_white().underline());
    println!();
    detail("Iterations", iterations);
    detail("Min", format!("{:.3} ms", min_ms));
    detail("Mean", format!("{:.3} ms", mean_ms));
    detail("Throughput", format!("{:.2} M elements/s", report.throughput() / 1e6));

    if let Some(v) = verification {
        println!();
        let status = if v.passed {
            "✓".bright_green()
        } else {
            "✗".bright_red()
        };
        println!(
            "{} Verification against reference: max abs error {:e}",
            status, v.max_abs_error
        );
    }
}

/// Deterministic, non-trivial input values.
fn synthetic(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i % 17) as f64 * 0.25 - 1.5).collect()
}

fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}
