//! Stop classification for the stepping loop.
//!
//! Every trap the target produces lands here; the classifier decides
//! whether the stop is a capture point (a statement boundary on a new
//! designated-file line), a stop to silently resume from, or the moment
//! the run ends. It also owns the step ceiling.

use std::sync::Arc;

use crate::dwarf::lines::LineTable;

use super::artifact::EndState;
use super::watchdog::TerminalFlag;

/// Lifecycle of a traced run as the classifier sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    /// Executing between capture points.
    Running,
    /// Stopped at a capture point.
    Capturing,
    Exited,
    SignalAborted,
    Overstepped,
    TimedOut,
}

/// What the stepping loop should do with a trap stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// Snapshot the frame as a new step on `line`.
    Capture { line: u64 },
    /// Keep the target moving without recording anything.
    Resume,
    /// The run is over.
    Halt,
}

pub struct StopClassifier {
    state: ClassifierState,
    step_ceiling: usize,
    captured: usize,
    /// Address range of the most recently captured line; traps inside it
    /// are the same source line still executing and must not re-capture.
    stepping_range: Option<(u64, u64)>,
    flag: Arc<TerminalFlag>,
}

impl StopClassifier {
    pub fn new(step_ceiling: usize, flag: Arc<TerminalFlag>) -> Self {
        Self {
            state: ClassifierState::Running,
            step_ceiling,
            captured: 0,
            stepping_range: None,
            flag,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    pub fn captured(&self) -> usize {
        self.captured
    }

    /// Classify a trap at (load-bias corrected) `pc`.
    pub fn classify_trap(&mut self, pc: u64, lines: &LineTable) -> StopDisposition {
        if self.is_terminal() {
            return StopDisposition::Halt;
        }
        if let Some(end) = self.flag.get() {
            self.settle(end);
            return StopDisposition::Halt;
        }
        let Some(row) = lines.stmt_boundary(pc) else {
            self.state = ClassifierState::Running;
            return StopDisposition::Resume;
        };
        if !row.in_source {
            self.state = ClassifierState::Running;
            return StopDisposition::Resume;
        }
        // Suppress only strictly inside the range: a trap back at its start
        // is a loop edge re-entering the line and must capture again.
        if let Some((lo, hi)) = self.stepping_range {
            if pc > lo && pc < hi {
                return StopDisposition::Resume;
            }
        }
        self.stepping_range = Some(lines.stepping_range(pc));
        self.state = ClassifierState::Capturing;
        StopDisposition::Capture { line: row.line }
    }

    /// Account for a recorded step. Returns true when the ceiling fired
    /// and the run must stop.
    pub fn step_appended(&mut self) -> bool {
        self.captured += 1;
        if self.captured >= self.step_ceiling {
            self.flag.set(EndState::Overstep);
            self.settle(self.flag.get().unwrap_or(EndState::Overstep));
            true
        } else {
            self.state = ClassifierState::Running;
            false
        }
    }

    /// The target died on a signal.
    pub fn fault(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.flag.set(EndState::Aborted);
        self.settle(self.flag.get().unwrap_or(EndState::Aborted));
    }

    /// The target exited normally.
    pub fn exited(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.flag.set(EndState::Finished);
        self.settle(self.flag.get().unwrap_or(EndState::Finished));
    }

    /// The target was stopped from outside the stepping loop.
    pub fn interrupted(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.settle(self.flag.get().unwrap_or(EndState::Finished));
    }

    pub fn end_state(&self) -> EndState {
        self.flag.get().unwrap_or(EndState::Finished)
    }

    fn settle(&mut self, end: EndState) {
        self.state = match end {
            EndState::Finished => ClassifierState::Exited,
            EndState::Aborted => ClassifierState::SignalAborted,
            EndState::Overstep => ClassifierState::Overstepped,
            EndState::Timeout => ClassifierState::TimedOut,
        };
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ClassifierState::Exited
                | ClassifierState::SignalAborted
                | ClassifierState::Overstepped
                | ClassifierState::TimedOut
        )
    }
}
