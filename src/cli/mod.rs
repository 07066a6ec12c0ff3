//! Command-line interface.

pub mod commands;

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ctrace",
    version,
    about = "Line-granular execution tracer for compiled C programs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    Trace,
}

impl Verbosity {
    pub fn to_log_level(self) -> tracing::Level {
        match self {
            Verbosity::Quiet => tracing::Level::ERROR,
            Verbosity::Normal => tracing::Level::WARN,
            Verbosity::Verbose => tracing::Level::DEBUG,
            Verbosity::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trace a program to a JSON artifact of per-line execution steps
    Run(RunArgs),
    /// Show what a binary exposes for tracing without running it
    Inspect(InspectArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the debug-built program to trace
    pub binary: PathBuf,

    /// File to feed to the program's standard input
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// Basename of the compile unit whose lines are traced
    #[arg(long, default_value = "code.c")]
    pub source_file: String,

    /// Maximum number of captured steps before the run ends as overstep
    #[arg(long, default_value_t = 500)]
    pub max_steps: usize,

    /// Wall-clock budget in seconds before the run ends as timeout
    #[arg(long, default_value_t = 5.0, value_parser = parse_timeout)]
    pub timeout: f64,

    /// Write the trace artifact here instead of standard output
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn parse_timeout(s: &str) -> Result<f64, String> {
    let seconds: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if seconds.is_finite() && seconds > 0.0 {
        Ok(seconds)
    } else {
        Err("timeout must be a positive number of seconds".to_owned())
    }
}

#[derive(Args)]
pub struct InspectArgs {
    /// Path to the debug-built program to inspect
    pub binary: PathBuf,

    /// Basename of the compile unit to inspect
    #[arg(long, default_value = "code.c")]
    pub source_file: String,
}
