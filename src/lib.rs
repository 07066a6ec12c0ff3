//! ctrace — step-level execution tracing for compiled C programs.
//!
//! Runs a target binary under ptrace and, at every executed line of one
//! designated source file, records the in-scope variables of the active
//! frame together with a typed snapshot of the memory reachable from them.
//! The result is a single JSON artifact suitable for visualization or
//! automated analysis of the program's execution.
//!
//! Sub-systems:
//! - [`dwarf`]  — ELF/DWARF loading, line table, type catalog, variable
//!   location resolution.
//! - [`target`] — process control: spawn, breakpoints, stepping, memory
//!   access.
//! - [`tracer`] — the trace run itself: stop classification, frame capture,
//!   value serialization, watchdog, step recording.
//! - [`cli`]    — command-line front end.

pub mod cli;
pub mod dwarf;
pub mod error;
pub mod target;
pub mod tracer;

pub use error::{Result, TracerError};
pub use tracer::artifact::{EndState, TraceArtifact};
pub use tracer::session::{TraceConfig, TraceSession};
