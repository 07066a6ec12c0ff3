use anyhow::Result;
use clap::Parser;
use ctrace::cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbosity = cli.verbosity();

    // Initialize logging with verbosity-aware level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(verbosity.to_log_level().to_string())
                }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run(args) => {
            ctrace::cli::commands::run(args, verbosity)?;
        }
        Commands::Inspect(args) => {
            ctrace::cli::commands::inspect(args, verbosity)?;
        }
    }

    Ok(())
}
