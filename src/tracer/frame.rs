//! Frame snapshot: in-scope variables plus the memory reachable from them.

use crate::dwarf::DebugInfo;
use crate::error::Result;
use crate::target::{MemoryReader, Registers};
use crate::tracer::artifact::{MemoryMap, VarAddress, VariableBinding};
use crate::tracer::serializer::ValueSerializer;

/// Capture the frame stopped at (unbiased) `pc`: resolve every in-scope
/// variable binding, then serialize each resolved one through a single
/// serializer so the visited set spans the whole snapshot.
pub fn capture_frame(
    info: &mut DebugInfo,
    memory: &dyn MemoryReader,
    pc: u64,
    regs: &Registers,
    load_bias: u64,
) -> Result<(Vec<VariableBinding>, MemoryMap)> {
    let variables = info.frame_bindings(pc, regs, load_bias)?;
    let mut out = MemoryMap::new();
    let mut serializer = ValueSerializer::new(info.catalog(), memory);
    for binding in &variables {
        if let VarAddress::Resolved(address) = &binding.address {
            serializer.parse_value(&binding.type_id, address.0, &mut out);
        }
    }
    Ok((variables, out))
}
