//! `streamgrid plan` command - Show how a problem is split across streams.

use clap::Args;
use colored::Colorize;

use streamgrid::PartitionPlan;

use crate::error::CliResult;

use super::{detail, OutputFormat, RemainderArg};

/// Arguments for `streamgrid plan`.
#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    /// Problem size
    #[arg(allow_negative_numbers = true)]
    pub size: i64,

    /// Number of streams
    #[arg(short, long, default_value = "4")]
    pub streams: u32,

    /// Remainder policy
    #[arg(long, value_enum, default_value = "fold")]
    pub remainder: RemainderArg,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

/// Execute the `plan` command.
pub fn execute(args: &PlanArgs) -> CliResult<()> {
    let plan = PartitionPlan::new(args.size, args.streams, args.remainder.into())?;

    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("{} Partition plan", "→".bright_cyan());
    detail("Problem size", plan.problem_size());
    detail(
        "Streams",
        format!("{} (requested {})", plan.stream_count(), args.streams),
    );
    println!();

    if plan.is_empty() {
        println!("{} Nothing to dispatch", "⚠".yellow());
        return Ok(());
    }

    println!("{}:", "Chunks".bright_white().underline());
    for chunk in plan.chunks() {
        println!(
            "    {} {} [{}, {}) {}",
            "•".dimmed(),
            format!("stream {:>2}:", chunk.stream_index).bright_white(),
            chunk.offset,
            chunk.end(),
            format!("len {}", chunk.len).dimmed()
        );
    }
    Ok(())
}
