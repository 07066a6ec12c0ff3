//! Append-only step recorder.

use std::collections::BTreeMap;

use crate::dwarf::catalog::{TypeDefinition, TypeId};

use super::artifact::{EndState, MemoryMap, StepRecord, TraceArtifact, VariableBinding};

/// Accumulates captured steps in execution order and assembles the final
/// artifact once the run's end state is known.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    steps: Vec<StepRecord>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a captured step, returning its 1-based ordinal.
    pub fn append(
        &mut self,
        line: u64,
        stdout: String,
        variables: Vec<VariableBinding>,
        memory: MemoryMap,
    ) -> u64 {
        let step = self.steps.len() as u64 + 1;
        self.steps.push(StepRecord {
            step,
            line,
            stdout,
            variables,
            memory,
        });
        step
    }

    pub fn finalize(
        self,
        type_definitions: BTreeMap<TypeId, TypeDefinition>,
        end_state: EndState,
    ) -> TraceArtifact {
        TraceArtifact {
            type_definitions,
            steps: self.steps,
            end_state,
        }
    }
}
