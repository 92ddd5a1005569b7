//! Per-execution statistics.

use std::time::Duration;

use serde::Serialize;

use crate::kernel::KernelKind;
use crate::partition::PartitionPlan;

/// Counters gathered while dispatching one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Kernel launches per stream (creation order).
    pub per_stream_launches: Vec<u64>,
    /// Elements processed per stream.
    pub per_stream_elements: Vec<u64>,
    /// Chunks whose transfers and launch were issued.
    pub chunks_dispatched: usize,
    /// Bytes copied host to device, broadcasts included.
    pub bytes_to_device: u64,
    /// Bytes copied device to host.
    pub bytes_to_host: u64,
}

impl DispatchStats {
    /// Empty counters for `streams` streams.
    pub fn new(streams: usize) -> Self {
        Self {
            per_stream_launches: vec![0; streams],
            per_stream_elements: vec![0; streams],
            ..Default::default()
        }
    }

    /// Total launches across streams.
    pub fn total_launches(&self) -> u64 {
        self.per_stream_launches.iter().sum()
    }

    /// Element balance across streams (1.0 = perfectly even, 0.0 = all on one stream).
    #[must_use]
    pub fn balance_ratio(&self) -> f64 {
        let counts = &self.per_stream_elements;
        let total: u64 = counts.iter().sum();
        if counts.len() < 2 || total == 0 {
            return 1.0;
        }

        let expected = total as f64 / counts.len() as f64;
        let variance: f64 = counts
            .iter()
            .map(|&count| (count as f64 - expected).powi(2))
            .sum::<f64>()
            / counts.len() as f64;

        let max_variance = expected.powi(2) * (counts.len() as f64 - 1.0);
        if max_variance == 0.0 {
            return 1.0;
        }

        1.0 - (variance / max_variance).sqrt()
    }
}

/// Summary of a completed execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Kernel that ran.
    pub kernel: KernelKind,
    /// Device name.
    pub device: String,
    /// Parameter vector, formatted.
    pub parameters: String,
    /// Chunk plan.
    pub plan: PartitionPlan,
    /// Dispatch counters.
    pub stats: DispatchStats,
    /// Wall-clock time from validation to teardown.
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl ExecutionReport {
    /// Elements processed per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.plan.problem_size() as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on {}: n={} chunks={} launches={} h2d={}B d2h={}B balance={:.1}% time={:.3}ms",
            self.kernel,
            self.device,
            self.plan.problem_size(),
            self.stats.chunks_dispatched,
            self.stats.total_launches(),
            self.stats.bytes_to_device,
            self.stats.bytes_to_host,
            self.stats.balance_ratio() * 100.0,
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}
