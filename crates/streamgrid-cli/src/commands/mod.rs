//! CLI command implementations.

pub mod plan;
pub mod run;
pub mod space;

use std::fs;
use std::path::Path;

use clap::{Args, ValueEnum};
use colored::Colorize;
use serde::de::DeserializeOwned;

use streamgrid::{
    Backend, CachePreference, EngineConfig, ParameterVector, RemainderPolicy, StreamGrid,
    TuningConfig,
};

use crate::error::CliResult;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, colored.
    Text,
    /// Machine-readable JSON on stdout.
    Json,
}

/// Where the leftover elements of an uneven split go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RemainderArg {
    /// Extend the last stream's chunk.
    Fold,
    /// Give the last stream a separate trailing chunk.
    Trailing,
}

impl From<RemainderArg> for RemainderPolicy {
    fn from(arg: RemainderArg) -> Self {
        match arg {
            RemainderArg::Fold => RemainderPolicy::FoldIntoLast,
            RemainderArg::Trailing => RemainderPolicy::TrailingChunk,
        }
    }
}

/// Parameter vector flags. Explicit flags override values read from `--tuning`.
#[derive(Debug, Clone, Default, Args)]
pub struct TuningArgs {
    /// Tuning configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    pub tuning: Option<String>,

    /// Threads per block
    #[arg(short, long)]
    pub threads: Option<i64>,

    /// Number of concurrent streams
    #[arg(short, long)]
    pub streams: Option<i64>,

    /// Inner-loop unroll factor
    #[arg(short, long)]
    pub unroll: Option<i64>,

    /// Cap on blocks per launch
    #[arg(long)]
    pub blocks: Option<i64>,

    /// Cache preference (none, l1, shared)
    #[arg(long)]
    pub cache: Option<String>,

    /// Register host arrays before transferring
    #[arg(long)]
    pub pinned: bool,
}

impl TuningArgs {
    /// Merge the file (if any) with explicit flags.
    pub fn to_config(&self) -> CliResult<TuningConfig> {
        let mut config: TuningConfig = match &self.tuning {
            Some(path) => load_toml(path)?,
            None => TuningConfig::default(),
        };
        if let Some(threads) = self.threads {
            config.threads_per_block = threads;
        }
        if let Some(streams) = self.streams {
            config.stream_count = streams;
        }
        if let Some(unroll) = self.unroll {
            config.unroll_factor = unroll;
        }
        if let Some(blocks) = self.blocks {
            config.block_count = Some(blocks);
        }
        if let Some(cache) = &self.cache {
            config.cache_preference = cache.parse::<CachePreference>()?;
        }
        if self.pinned {
            config.use_pinned_host = true;
        }
        Ok(config)
    }

    /// Validated parameter vector.
    pub fn to_params(&self) -> CliResult<ParameterVector> {
        Ok(ParameterVector::try_from(self.to_config()?)?)
    }
}

/// Read and deserialize a TOML file.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> CliResult<T> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&content)?)
}

/// Engine configuration from an optional file plus an optional remainder override.
pub fn engine_config(
    path: Option<&str>,
    remainder: Option<RemainderArg>,
) -> CliResult<EngineConfig> {
    let mut config = match path {
        Some(path) => load_toml(path)?,
        None => EngineConfig::default(),
    };
    if let Some(remainder) = remainder {
        config.remainder_policy = remainder.into();
    }
    Ok(config)
}

/// Build a grid on the named backend.
pub fn build_grid(backend: &str, device: usize, config: EngineConfig) -> CliResult<StreamGrid> {
    let backend: Backend = backend.parse()?;
    let grid = StreamGrid::builder()
        .backend(backend)
        .device_ordinal(device)
        .config(config)
        .build()?;
    Ok(grid)
}

/// Print a `key: value` detail line.
pub fn detail(key: &str, value: impl std::fmt::Display) {
    println!("  {} {}: {}", "•".dimmed(), key, value.to_string().bright_yellow());
}
