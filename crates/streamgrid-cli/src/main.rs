//! StreamGrid CLI - Run stream-parallel kernels, inspect partition plans,
//! and enumerate tuning spaces.
//!
//! # Commands
//!
//! - `streamgrid run <kernel>` - Execute a kernel on synthetic data
//! - `streamgrid plan <size>` - Show the chunk plan for a problem size
//! - `streamgrid space [file]` - Enumerate a tuning space
//! - `streamgrid completions <shell>` - Generate shell completions
//!
//! # Examples
//!
//! ```bash
//! # AXPY over a million elements on four streams, checked against the reference
//! streamgrid run axpy -n 1000000 --streams 4 --threads 256 --verify
//!
//! # Five-point stencil on a 512x512 grid, JSON report
//! streamgrid run dia --grid 512 --streams 8 --unroll 4 --format json
//!
//! # How 101 elements split across 4 streams
//! streamgrid plan 101 --streams 4
//!
//! # Points of a tuning space that fit the CUDA device
//! streamgrid space search.toml --backend cuda --list
//! ```

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;

use commands::{plan, run, space};

/// StreamGrid CLI - stream-parallel bulk array execution
#[derive(Parser)]
#[command(name = "streamgrid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a kernel on synthetic data and report timing
    Run(run::RunArgs),

    /// Show how a problem is split across streams
    Plan(plan::PlanArgs),

    /// Enumerate a tuning space, optionally filtered by device limits
    Space(space::SpaceArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Run(args) => run::execute(&args),
        Commands::Plan(args) => plan::execute(&args),
        Commands::Space(args) => space::execute(&args),
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "streamgrid",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "streamgrid", "run", "dia", "--grid", "64", "-s", "4", "-t", "128", "--unroll", "3",
            "--verify", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.kernel, run::KernelArg::Dia);
                assert_eq!(args.grid, 64);
                assert_eq!(args.tuning.streams, Some(4));
                assert_eq!(args.tuning.threads, Some(128));
                assert_eq!(args.tuning.unroll, Some(3));
                assert!(args.verify);
                assert_eq!(args.backend, "auto");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_plan_negative_size() {
        let cli = Cli::try_parse_from(["streamgrid", "plan", "-5"]).unwrap();
        match cli.command {
            Commands::Plan(args) => {
                assert_eq!(args.size, -5);
                assert_eq!(args.streams, 4);
            }
            _ => panic!("expected plan"),
        }
    }

    #[test]
    fn test_unknown_kernel_rejected() {
        assert!(Cli::try_parse_from(["streamgrid", "run", "fft"]).is_err());
    }
}
