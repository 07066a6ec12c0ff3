//! End-to-end trace run: load debug info, drive the target, collect steps.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::dwarf::DebugInfo;
use crate::error::Result;
use crate::target::{StopEvent, TracedProcess};

use super::artifact::{MemoryMap, TraceArtifact};
use super::classifier::{StopClassifier, StopDisposition};
use super::frame;
use super::recorder::TraceRecorder;
use super::watchdog::{TerminalFlag, Watchdog};

/// Knobs of a trace run.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Basename of the compile unit whose lines are traced.
    pub source_file: String,
    /// Hard cap on captured steps; hitting it ends the run as `overstep`.
    pub step_ceiling: usize,
    /// Wall-clock budget; exceeding it ends the run as `timeout`.
    pub time_budget: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            source_file: "code.c".to_owned(),
            step_ceiling: 500,
            time_budget: Duration::from_secs(5),
        }
    }
}

pub struct TraceSession {
    config: TraceConfig,
}

impl TraceSession {
    pub fn new(config: TraceConfig) -> Self {
        TraceSession { config }
    }

    /// Run `binary` to completion (or budget exhaustion) under trace,
    /// optionally feeding `stdin` from a file.
    pub fn run(&self, binary: &Path, stdin: Option<&PathBuf>) -> Result<TraceArtifact> {
        let mut info = DebugInfo::load(binary, &self.config.source_file)?;
        let mut process = TracedProcess::spawn(binary, stdin.map(PathBuf::as_path))?;
        let load_bias = process.load_bias(binary, info.is_pie())?;
        debug!(load_bias = format_args!("{load_bias:#x}"), "target spawned");

        let entries: Vec<u64> = info.functions().iter().map(|f| f.low_pc).collect();
        for low_pc in &entries {
            process.install_breakpoint(low_pc.wrapping_add(load_bias))?;
        }
        info!(
            functions = entries.len(),
            lines = info.lines().source_line_count(),
            "installed function entry breakpoints"
        );

        let flag = Arc::new(TerminalFlag::new());
        let pid = process.pid();
        let watchdog = Watchdog::arm(self.config.time_budget, flag.clone(), move || {
            TracedProcess::interrupt(pid)
        });
        let mut classifier = StopClassifier::new(self.config.step_ceiling, flag.clone());
        let mut recorder = TraceRecorder::new();
        // Breakpoint-driven until the first capture, single-stepping after.
        let mut stepping = false;

        process.resume()?;
        loop {
            match process.wait()? {
                StopEvent::Exited { code } => {
                    debug!(code, "target exited");
                    classifier.exited();
                    break;
                }
                StopEvent::Fault { signal } => {
                    warn!(?signal, "target terminated by signal");
                    classifier.fault();
                    break;
                }
                StopEvent::Interrupted => {
                    classifier.interrupted();
                    break;
                }
                StopEvent::Trap { pc } => {
                    let unbiased = pc.wrapping_sub(load_bias);
                    // A trap on a function entry is pre-prologue: the frame
                    // base is not set up yet, so step through without
                    // classifying and capture at the first boundary after.
                    let at_entry = info
                        .function_at(unbiased)
                        .is_some_and(|f| f.low_pc == unbiased);
                    if at_entry {
                        stepping = true;
                        process.single_step()?;
                        continue;
                    }
                    match classifier.classify_trap(unbiased, info.lines()) {
                        StopDisposition::Halt => break,
                        StopDisposition::Resume => {}
                        StopDisposition::Capture { line } => {
                            stepping = true;
                            let stdout = process.stdout_so_far();
                            let regs = process.registers()?;
                            let (variables, memory) = match frame::capture_frame(
                                &mut info, &process, unbiased, &regs, load_bias,
                            ) {
                                Ok(snapshot) => snapshot,
                                Err(err) => {
                                    warn!(%err, line, "frame capture failed");
                                    (Vec::new(), MemoryMap::new())
                                }
                            };
                            let ordinal = recorder.append(line, stdout, variables, memory);
                            trace!(ordinal, line, "captured step");
                            if classifier.step_appended() {
                                debug!("step ceiling reached");
                                break;
                            }
                        }
                    }
                    if flag.get().is_some() {
                        classifier.interrupted();
                        break;
                    }
                    if stepping {
                        process.single_step()?;
                    } else {
                        process.resume()?;
                    }
                }
            }
        }
        watchdog.disarm();

        let end_state = classifier.end_state();
        info!(steps = recorder.len(), ?end_state, "trace complete");
        Ok(recorder.finalize(info.into_definitions(), end_state))
    }
}
