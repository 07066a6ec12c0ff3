//! Wall-clock termination supervisor.
//!
//! A background thread armed with the run's time budget. It is the only
//! code outside the stepping thread that touches shared state, and the only
//! state it touches is the one-shot [`TerminalFlag`]: deciding the end
//! state and firing the interrupt are a single first-write-wins operation,
//! so a timeout racing a normal exit cannot produce two terminal causes.

use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::warn;

use super::artifact::EndState;

/// First-write-wins terminal state cell shared between the stepping thread
/// and the watchdog.
#[derive(Debug, Default)]
pub struct TerminalFlag(OnceLock<EndState>);

impl TerminalFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal cause. Returns true only for the call that decided
    /// the end state; later causes are ignored.
    pub fn set(&self, state: EndState) -> bool {
        self.0.set(state).is_ok()
    }

    pub fn get(&self) -> Option<EndState> {
        self.0.get().copied()
    }
}

/// Armed watchdog; dropping it without [`disarm`](Watchdog::disarm) lets
/// the timer keep running.
pub struct Watchdog {
    disarm: mpsc::Sender<()>,
}

impl Watchdog {
    /// Start the timer. When `budget` elapses before the run finishes, the
    /// watchdog sets `timeout` as the end state and calls `interrupt`.
    pub fn arm(
        budget: Duration,
        flag: Arc<TerminalFlag>,
        interrupt: impl FnOnce() + Send + 'static,
    ) -> Watchdog {
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || match rx.recv_timeout(budget) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if flag.set(EndState::Timeout) {
                    warn!("wall-clock budget exhausted, interrupting target");
                    interrupt();
                }
            }
        });
        Watchdog { disarm: tx }
    }

    /// Cancel the timer after a completed run.
    pub fn disarm(self) {
        let _ = self.disarm.send(());
    }
}
