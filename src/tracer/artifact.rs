//! Data model of the finished trace artifact.
//!
//! Everything here is plain data: the stepping loop builds these records and
//! [`serde_json`] writes them out once, at finalize. Addresses serialize as
//! `0x…` hex strings and memory entries are keyed `"<address>:<typeId>"`,
//! so the artifact is self-describing without a schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::dwarf::catalog::TypeId;

/// A location in the traced process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a variable's value lives, if anywhere.
///
/// A binding with no memory location (optimized away, or a purely symbolic
/// entity) is reported as `unresolved` and produces no memory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAddress {
    Resolved(Address),
    Unresolved,
}

impl Serialize for VarAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            VarAddress::Resolved(addr) => addr.serialize(serializer),
            VarAddress::Unresolved => serializer.serialize_str("unresolved"),
        }
    }
}

/// One in-scope variable at a captured step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableBinding {
    pub name: String,
    pub type_id: TypeId,
    pub address: VarAddress,
}

/// Key of one memory entry: a typed view of an address.
///
/// The same address can legitimately carry several entries with different
/// type ids (union members reinterpreting shared bytes), but a given
/// `(address, type)` pair appears at most once per step.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryKey {
    pub address: Address,
    pub type_id: TypeId,
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.type_id)
    }
}

impl Serialize for MemoryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Decoded and/or raw contents of one typed memory location.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_bytes: Option<String>,
}

/// Address-indexed memory snapshot of one step. Last write to a key wins.
pub type MemoryMap = BTreeMap<MemoryKey, MemoryEntry>;

/// One captured stop at a line of the designated source file.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: u64,
    pub line: u64,
    pub stdout: String,
    pub variables: Vec<VariableBinding>,
    pub memory: MemoryMap,
}

/// Terminal classification of a trace run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndState {
    Finished,
    Aborted,
    Overstep,
    Timeout,
}

/// The finished artifact, assembled exactly once at finalize.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceArtifact {
    pub type_definitions: BTreeMap<TypeId, crate::dwarf::catalog::TypeDefinition>,
    pub steps: Vec<StepRecord>,
    pub end_state: EndState,
}
