//! Resolved tuning parameters.
//!
//! A [`ParameterVector`] is the immutable configuration one execution runs
//! with. It is produced by an external tuner (usually as a [`TuningConfig`]
//! deserialized from its output) and validated once before any device
//! resource is touched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceLimits;
use crate::error::{ExecutionError, Result};

/// L1 / shared-memory split requested for kernel launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePreference {
    /// Let the device decide.
    #[default]
    PreferNone,
    /// Larger L1 cache, smaller shared memory.
    PreferL1,
    /// Larger shared memory, smaller L1 cache.
    PreferShared,
}

impl CachePreference {
    /// Map a preferred L1 size in KiB (the `preferL1Size` tuning axis) to a preference.
    ///
    /// 48 KiB of L1 means the large-L1 split, 16 KiB the large-shared split.
    pub fn from_l1_kib(kib: u32) -> Self {
        match kib {
            48 => CachePreference::PreferL1,
            16 => CachePreference::PreferShared,
            _ => CachePreference::PreferNone,
        }
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            CachePreference::PreferNone => "none",
            CachePreference::PreferL1 => "l1",
            CachePreference::PreferShared => "shared",
        }
    }
}

impl fmt::Display for CachePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CachePreference {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "prefer_none" => Ok(CachePreference::PreferNone),
            "l1" | "prefer_l1" => Ok(CachePreference::PreferL1),
            "shared" | "prefer_shared" => Ok(CachePreference::PreferShared),
            _ => Err(ExecutionError::InvalidParameter(format!(
                "unknown cache preference '{}'. Valid options: none, l1, shared",
                s
            ))),
        }
    }
}

/// Immutable, validated tuning configuration for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterVector {
    threads_per_block: u32,
    stream_count: u32,
    unroll_factor: u32,
    block_count: Option<u32>,
    cache_preference: CachePreference,
    use_pinned_host: bool,
}

impl ParameterVector {
    /// Create a parameter vector with default unroll (1), no block cap,
    /// no cache preference and pageable host memory.
    pub fn new(threads_per_block: i64, stream_count: i64) -> Result<Self> {
        Self::builder()
            .threads_per_block(threads_per_block)
            .stream_count(stream_count)
            .build()
    }

    /// Start building a parameter vector.
    pub fn builder() -> ParameterVectorBuilder {
        ParameterVectorBuilder::new()
    }

    /// Threads per block.
    pub fn threads_per_block(&self) -> u32 {
        self.threads_per_block
    }

    /// Number of transfer/compute streams.
    pub fn stream_count(&self) -> u32 {
        self.stream_count
    }

    /// Inner-loop unroll factor.
    pub fn unroll_factor(&self) -> u32 {
        self.unroll_factor
    }

    /// Optional cap on blocks per launch.
    pub fn block_count(&self) -> Option<u32> {
        self.block_count
    }

    /// Cache preference applied to launches.
    pub fn cache_preference(&self) -> CachePreference {
        self.cache_preference
    }

    /// Whether host arrays are registered (pinned) for direct transfers.
    pub fn use_pinned_host(&self) -> bool {
        self.use_pinned_host
    }

    /// Check device-dependent limits.
    pub fn validate_for(&self, limits: &DeviceLimits) -> Result<()> {
        if self.threads_per_block > limits.max_threads_per_block {
            return Err(ExecutionError::InvalidParameter(format!(
                "threads_per_block {} exceeds device maximum {}",
                self.threads_per_block, limits.max_threads_per_block
            )));
        }
        if self.stream_count > limits.max_streams {
            return Err(ExecutionError::InvalidParameter(format!(
                "stream_count {} exceeds device maximum {}",
                self.stream_count, limits.max_streams
            )));
        }
        if let Some(blocks) = self.block_count {
            if blocks > limits.max_grid_blocks {
                return Err(ExecutionError::InvalidParameter(format!(
                    "block_count {} exceeds device maximum {}",
                    blocks, limits.max_grid_blocks
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "threads={} streams={} unroll={} blocks={} cache={} pinned={}",
            self.threads_per_block,
            self.stream_count,
            self.unroll_factor,
            self.block_count
                .map(|b| b.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            self.cache_preference,
            self.use_pinned_host
        )
    }
}

/// Builder for [`ParameterVector`].
///
/// Accepts signed values as an external tuner produces them; validation
/// happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ParameterVectorBuilder {
    threads_per_block: i64,
    stream_count: i64,
    unroll_factor: i64,
    block_count: Option<i64>,
    cache_preference: CachePreference,
    use_pinned_host: bool,
}

impl Default for ParameterVectorBuilder {
    fn default() -> Self {
        Self {
            threads_per_block: 256,
            stream_count: 1,
            unroll_factor: 1,
            block_count: None,
            cache_preference: CachePreference::PreferNone,
            use_pinned_host: false,
        }
    }
}

impl ParameterVectorBuilder {
    /// Creates a builder with defaults (256 threads, 1 stream, unroll 1).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets threads per block.
    #[must_use]
    pub fn threads_per_block(mut self, threads: i64) -> Self {
        self.threads_per_block = threads;
        self
    }

    /// Sets the stream count.
    #[must_use]
    pub fn stream_count(mut self, streams: i64) -> Self {
        self.stream_count = streams;
        self
    }

    /// Sets the unroll factor.
    #[must_use]
    pub fn unroll_factor(mut self, unroll: i64) -> Self {
        self.unroll_factor = unroll;
        self
    }

    /// Caps the number of blocks per launch.
    #[must_use]
    pub fn block_count(mut self, blocks: i64) -> Self {
        self.block_count = Some(blocks);
        self
    }

    /// Sets the cache preference.
    #[must_use]
    pub fn cache_preference(mut self, preference: CachePreference) -> Self {
        self.cache_preference = preference;
        self
    }

    /// Enables or disables host memory pinning.
    #[must_use]
    pub fn use_pinned_host(mut self, pinned: bool) -> Self {
        self.use_pinned_host = pinned;
        self
    }

    /// Validates and builds the parameter vector.
    pub fn build(self) -> Result<ParameterVector> {
        Ok(ParameterVector {
            threads_per_block: positive("threads_per_block", self.threads_per_block)?,
            stream_count: positive("stream_count", self.stream_count)?,
            unroll_factor: positive("unroll_factor", self.unroll_factor)?,
            block_count: self
                .block_count
                .map(|b| positive("block_count", b))
                .transpose()?,
            cache_preference: self.cache_preference,
            use_pinned_host: self.use_pinned_host,
        })
    }
}

fn positive(name: &str, value: i64) -> Result<u32> {
    if value <= 0 {
        return Err(ExecutionError::InvalidParameter(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    u32::try_from(value).map_err(|_| {
        ExecutionError::InvalidParameter(format!("{} out of range: {}", name, value))
    })
}

/// Raw tuning configuration as an external tuner emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Threads per block (`TC`).
    pub threads_per_block: i64,
    /// Stream count.
    pub stream_count: i64,
    /// Inner-loop unroll factor (`UIF`).
    pub unroll_factor: i64,
    /// Optional block cap (`BC`).
    pub block_count: Option<i64>,
    /// Cache preference.
    pub cache_preference: CachePreference,
    /// Register host memory before transfers.
    pub use_pinned_host: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            threads_per_block: 256,
            stream_count: 1,
            unroll_factor: 1,
            block_count: None,
            cache_preference: CachePreference::PreferNone,
            use_pinned_host: false,
        }
    }
}

impl TryFrom<TuningConfig> for ParameterVector {
    type Error = ExecutionError;

    fn try_from(config: TuningConfig) -> Result<Self> {
        let mut builder = ParameterVector::builder()
            .threads_per_block(config.threads_per_block)
            .stream_count(config.stream_count)
            .unroll_factor(config.unroll_factor)
            .cache_preference(config.cache_preference)
            .use_pinned_host(config.use_pinned_host);
        if let Some(blocks) = config.block_count {
            builder = builder.block_count(blocks);
        }
        builder.build()
    }
}

impl From<ParameterVector> for TuningConfig {
    fn from(params: ParameterVector) -> Self {
        Self {
            threads_per_block: i64::from(params.threads_per_block),
            stream_count: i64::from(params.stream_count),
            unroll_factor: i64::from(params.unroll_factor),
            block_count: params.block_count.map(i64::from),
            cache_preference: params.cache_preference,
            use_pinned_host: params.use_pinned_host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let params = ParameterVector::builder().build().unwrap();
        assert_eq!(params.threads_per_block(), 256);
        assert_eq!(params.stream_count(), 1);
        assert_eq!(params.unroll_factor(), 1);
        assert_eq!(params.block_count(), None);
        assert_eq!(params.cache_preference(), CachePreference::PreferNone);
        assert!(!params.use_pinned_host());
    }

    #[test]
    fn test_rejects_non_positive() {
        for (threads, streams) in [(0, 1), (-32, 1), (32, 0), (32, -4)] {
            let err = ParameterVector::new(threads, streams).unwrap_err();
            assert!(matches!(err, ExecutionError::InvalidParameter(_)));
        }

        let err = ParameterVector::builder().unroll_factor(0).build().unwrap_err();
        assert!(err.to_string().contains("unroll_factor"));

        let err = ParameterVector::builder().block_count(-1).build().unwrap_err();
        assert!(err.to_string().contains("block_count"));
    }

    #[test]
    fn test_rejects_overflow() {
        let err = ParameterVector::new(i64::from(u32::MAX) + 1, 1).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_device_limits() {
        let limits = DeviceLimits {
            max_threads_per_block: 1024,
            max_streams: 8,
            max_grid_blocks: 65_535,
            shared_mem_per_block: 48 * 1024,
        };

        assert!(ParameterVector::new(1024, 8).unwrap().validate_for(&limits).is_ok());
        assert!(ParameterVector::new(2048, 1).unwrap().validate_for(&limits).is_err());
        assert!(ParameterVector::new(32, 9).unwrap().validate_for(&limits).is_err());

        let capped = ParameterVector::builder().block_count(70_000).build().unwrap();
        assert!(capped.validate_for(&limits).is_err());
    }

    #[test]
    fn test_cache_preference_parse() {
        assert_eq!("l1".parse::<CachePreference>().unwrap(), CachePreference::PreferL1);
        assert_eq!(
            "PREFER_SHARED".parse::<CachePreference>().unwrap(),
            CachePreference::PreferShared
        );
        assert!("l2".parse::<CachePreference>().is_err());
        assert_eq!(CachePreference::from_l1_kib(48), CachePreference::PreferL1);
        assert_eq!(CachePreference::from_l1_kib(16), CachePreference::PreferShared);
        assert_eq!(CachePreference::from_l1_kib(32), CachePreference::PreferNone);
    }

    #[test]
    fn test_tuning_config_conversion() {
        let config = TuningConfig {
            threads_per_block: 64,
            stream_count: 4,
            unroll_factor: 3,
            block_count: Some(48),
            cache_preference: CachePreference::PreferL1,
            use_pinned_host: true,
        };
        let params = ParameterVector::try_from(config.clone()).unwrap();
        assert_eq!(params.threads_per_block(), 64);
        assert_eq!(params.block_count(), Some(48));
        assert!(params.use_pinned_host());
        assert_eq!(TuningConfig::from(params), config);

        let bad = TuningConfig {
            stream_count: 0,
            ..TuningConfig::default()
        };
        assert!(ParameterVector::try_from(bad).is_err());
    }

    #[test]
    fn test_tuning_config_from_toml() {
        let config: TuningConfig = toml::from_str(
            r#"
            threads_per_block = 128
            stream_count = 2
            cache_preference = "prefer_shared"
            "#,
        )
        .unwrap();
        assert_eq!(config.unroll_factor, 1);
        assert_eq!(config.cache_preference, CachePreference::PreferShared);
        let params = ParameterVector::try_from(config).unwrap();
        assert_eq!(params.stream_count(), 2);
    }

    #[test]
    fn test_display() {
        let params = ParameterVector::builder()
            .threads_per_block(32)
            .stream_count(2)
            .build()
            .unwrap();
        assert_eq!(
            params.to_string(),
            "threads=32 streams=2 unroll=1 blocks=auto cache=none pinned=false"
        );
    }
}
