//! `streamgrid space` command - Enumerate a tuning space.

use clap::Args;
use colored::Colorize;

use streamgrid::{ParameterVector, TuningConfig, TuningSpace, TuningSpaceConfig};

use crate::error::CliResult;

use super::{build_grid, detail, load_toml, OutputFormat};

/// Arguments for `streamgrid space`.
#[derive(Debug, Clone, Args)]
pub struct SpaceArgs {
    /// Tuning space description (TOML); the built-in space when omitted
    pub file: Option<String>,

    /// Keep only points that fit this backend's device limits
    #[arg(short, long)]
    pub backend: Option<String>,

    /// GPU ordinal
    #[arg(long, default_value = "0")]
    pub device: usize,

    /// Print every point, not just the counts
    #[arg(short, long)]
    pub list: bool,

    /// Maximum number of points to print
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Execute the `space` command.
pub fn execute(args: &SpaceArgs) -> CliResult<()> {
    let config: TuningSpaceConfig = match &args.file {
        Some(path) => load_toml(path)?,
        None => TuningSpaceConfig::default(),
    };
    let space = TuningSpace::from_config(&config)?;

    let (points, device): (Vec<ParameterVector>, Option<String>) = match &args.backend {
        Some(backend) => {
            let grid = build_grid(backend, args.device, Default::default())?;
            let limits = grid.engine().device().limits();
            (space.filter_for(&limits), Some(grid.device_name().to_string()))
        }
        None => (space.iter().collect(), None),
    };
    let shown = args.limit.unwrap_or(points.len()).min(points.len());

    if args.format == OutputFormat::Json {
        let configs: Vec<TuningConfig> = points[..shown].iter().copied().map(Into::into).collect();
        println!("{}", serde_json::to_string_pretty(&configs)?);
        return Ok(());
    }

    println!("{} Tuning space", "→".bright_cyan());
    detail("Source", args.file.as_deref().unwrap_or("built-in"));
    detail("Points", space.len());
    if let Some(device) = device {
        let status = if points.len() == space.len() {
            "✓".bright_green()
        } else if points.is_empty() {
            "✗".bright_red()
        } else {
            "⚠".yellow()
        };
        println!(
            "  {} Fit {}: {}/{}",
            status,
            device.bright_white(),
            points.len(),
            space.len()
        );
    }

    if args.list || args.limit.is_some() {
        println!();
        for (i, point) in points[..shown].iter().enumerate() {
            println!("    {} {}", format!("{:>5}", i).dimmed(), point);
        }
        if shown < points.len() {
            println!("    {} ... {} more", "•".dimmed(), points.len() - shown);
        }
    }
    Ok(())
}
