//! DWARF location-expression evaluation.
//!
//! Resolves where a variable lives right now, given the stopped frame's
//! registers. Anything the evaluator cannot answer (optimized-away values,
//! location lists, implicit values) yields `None` and the binding is
//! reported unresolved rather than failing the capture.

use gimli::{
    AttributeValue, DebuggingInformationEntry, Dwarf, EvaluationResult, Expression, Location,
    Piece, Unit,
};

use super::Reader;
use crate::error::Result;
use crate::target::Registers;

/// Evaluate a location expression down to a memory address.
pub fn evaluate_address(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    expr: Expression<Reader>,
    frame_base: Option<u64>,
    regs: &Registers,
    load_bias: u64,
) -> Result<Option<u64>> {
    let Some(pieces) = evaluate_pieces(dwarf, unit, expr, frame_base, regs, load_bias)? else {
        return Ok(None);
    };
    match pieces.first().map(|piece| &piece.location) {
        Some(Location::Address { address }) => Ok(Some(*address)),
        _ => Ok(None),
    }
}

/// Resolve a function's `DW_AT_frame_base`.
///
/// At -O0 both gcc and clang emit either `DW_OP_call_frame_cfa` or a plain
/// frame-pointer register here; a register location therefore resolves to
/// that register's current value.
pub fn resolve_frame_base(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    function: &DebuggingInformationEntry<Reader>,
    regs: &Registers,
    load_bias: u64,
) -> Result<Option<u64>> {
    let Some(AttributeValue::Exprloc(expr)) =
        function.attr_value(gimli::constants::DW_AT_frame_base)?
    else {
        return Ok(None);
    };
    let Some(pieces) = evaluate_pieces(dwarf, unit, expr, None, regs, load_bias)? else {
        return Ok(None);
    };
    match pieces.first().map(|piece| &piece.location) {
        Some(Location::Address { address }) => Ok(Some(*address)),
        Some(Location::Register { register }) => Ok(regs.dwarf_register(register.0)),
        _ => Ok(None),
    }
}

fn evaluate_pieces(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    expr: Expression<Reader>,
    frame_base: Option<u64>,
    regs: &Registers,
    load_bias: u64,
) -> Result<Option<Vec<Piece<Reader>>>> {
    let mut eval = expr.evaluation(unit.encoding());
    let mut state = eval.evaluate()?;
    loop {
        match state {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresFrameBase => {
                let Some(base) = frame_base else {
                    return Ok(None);
                };
                state = eval.resume_with_frame_base(base)?;
            }
            EvaluationResult::RequiresCallFrameCfa => {
                // Past the prologue of a frame-pointer-keeping function the
                // x86_64 CFA sits 16 bytes above the saved rbp.
                state = eval.resume_with_call_frame_cfa(regs.fp().wrapping_add(16))?;
            }
            EvaluationResult::RequiresRegister { register, .. } => {
                let Some(value) = regs.dwarf_register(register.0) else {
                    return Ok(None);
                };
                state = eval.resume_with_register(gimli::Value::Generic(value))?;
            }
            EvaluationResult::RequiresRelocatedAddress(address) => {
                state = eval.resume_with_relocated_address(address.wrapping_add(load_bias))?;
            }
            EvaluationResult::RequiresIndexedAddress { index, relocate } => {
                let address = dwarf.address(unit, index)?;
                let address = if relocate {
                    address.wrapping_add(load_bias)
                } else {
                    address
                };
                state = eval.resume_with_indexed_address(address)?;
            }
            // Memory-dependent or typed sub-expressions are beyond what a
            // variable address needs; report the binding unresolved.
            _ => return Ok(None),
        }
    }
    Ok(Some(eval.result()))
}
