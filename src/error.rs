use thiserror::Error;

/// Errors produced while preparing or driving a trace run.
///
/// Capture-local failures (an unreadable variable, an invalid pointer
/// target) are deliberately *not* represented here — they are contained at
/// the point of failure and never abort a run. This type covers the faults
/// that prevent a run from being set up at all.
#[derive(Debug, Error)]
pub enum TracerError {
    #[error("failed to read target binary '{path}': {source}")]
    BinaryRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse target binary: {0}")]
    BinaryParse(#[from] object::Error),

    #[error("no debug info for source file '{0}' (was the target compiled with -g?)")]
    MissingDebugInfo(String),

    #[error("DWARF error: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("target process error: {0}")]
    Process(String),

    #[error("ptrace failed: {0}")]
    Ptrace(#[from] nix::Error),

    #[error("memory read of {length} bytes at {address:#x} failed")]
    MemoryRead { address: u64, length: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize trace artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TracerError>;
