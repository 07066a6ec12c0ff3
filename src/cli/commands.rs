//! Subcommand implementations.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::dwarf::DebugInfo;
use crate::tracer::{TraceConfig, TraceSession};

use super::{InspectArgs, RunArgs, Verbosity};

pub fn run(args: RunArgs, verbosity: Verbosity) -> anyhow::Result<()> {
    let config = TraceConfig {
        source_file: args.source_file,
        step_ceiling: args.max_steps,
        time_budget: Duration::from_secs_f64(args.timeout),
    };
    let session = TraceSession::new(config);
    let artifact = session
        .run(&args.binary, args.stdin.as_ref())
        .with_context(|| format!("tracing {}", args.binary.display()))?;

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &artifact)?;
            writer.flush()?;
            info!(path = %path.display(), "trace artifact written");
            if verbosity != Verbosity::Quiet {
                println!(
                    "Wrote {} steps ({:?}) to {}",
                    artifact.steps.len(),
                    artifact.end_state,
                    path.display()
                );
            }
        }
        None => {
            let stdout = std::io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            serde_json::to_writer_pretty(&mut writer, &artifact)?;
            writeln!(writer)?;
            writer.flush()?;
        }
    }
    Ok(())
}

pub fn inspect(args: InspectArgs, _verbosity: Verbosity) -> anyhow::Result<()> {
    let info = DebugInfo::load(&args.binary, &args.source_file)
        .with_context(|| format!("loading {}", args.binary.display()))?;

    println!("Binary:      {}", args.binary.display());
    println!("Source file: {}", info.source_file());
    println!("PIE:         {}", info.is_pie());
    println!("Lines:       {}", info.lines().source_line_count());
    println!("Functions:");
    for function in info.functions() {
        println!(
            "  {:<24} {:#x}..{:#x}",
            function.name, function.low_pc, function.high_pc
        );
    }
    Ok(())
}
