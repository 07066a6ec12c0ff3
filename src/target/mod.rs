//! Target process control.
//!
//! Sub-modules:
//! - [`process`]    — spawn under ptrace, stepping, register and memory
//!   access, load-bias discovery.
//! - [`breakpoint`] — software breakpoint bookkeeping (INT3 patching).

pub mod breakpoint;
pub mod process;

pub use breakpoint::{Breakpoint, BreakpointSet};
pub use process::{Registers, TracedProcess};

use crate::error::Result;

/// Why the traced process stopped, as seen by the stepping loop.
///
/// Faults carry the delivered signal; an `Interrupted` stop is the
/// watchdog's SIGSTOP and means a terminal state has already been decided
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Breakpoint or single-step trap; `pc` is the runtime program counter.
    Trap { pc: u64 },
    /// Forced interrupt from outside the stepping thread.
    Interrupted,
    /// A fault or asynchronous signal was delivered to the target.
    Fault { signal: nix::sys::signal::Signal },
    /// The target exited normally.
    Exited { code: i32 },
}

/// Read access to the traced process's memory.
///
/// The value serializer only needs this one operation, so tests exercise it
/// against synthetic memory images instead of a live process.
pub trait MemoryReader {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()>;
}
