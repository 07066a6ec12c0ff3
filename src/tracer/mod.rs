//! Line-granular execution tracing.
//!
//! Submodules:
//! - `artifact`: the JSON output model (steps, memory map, end state)
//! - `classifier`: stop classification and the step ceiling
//! - `frame`: per-stop variable and memory snapshots
//! - `recorder`: step accumulation and artifact assembly
//! - `serializer`: recursive type-directed value serialization
//! - `session`: the run loop tying target control to capture
//! - `watchdog`: the wall-clock budget supervisor

pub mod artifact;
pub mod classifier;
pub mod frame;
pub mod recorder;
pub mod serializer;
pub mod session;
pub mod watchdog;

pub use artifact::{EndState, StepRecord, TraceArtifact};
pub use session::{TraceConfig, TraceSession};
