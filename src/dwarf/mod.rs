//! ELF/DWARF debug information for the designated source file.
//!
//! Sub-modules:
//! - [`catalog`]  — structural type interning (ids + definitions).
//! - [`lines`]    — flattened line table with stepping-range lookups.
//! - [`location`] — location-expression evaluation against live registers.
//!
//! [`DebugInfo`] loads the target binary once, selects the compile unit of
//! the designated file, indexes its functions and line table, and then
//! serves all per-stop queries: which function owns a pc, which variables
//! are in scope, and where they live.

pub mod catalog;
pub mod lines;
pub mod location;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use gimli::{constants, AttributeValue, Dwarf, LineProgramHeader, Unit};
use gimli::Reader as _;
use object::{Object, ObjectSection};
use tracing::{debug, warn};

use crate::error::{Result, TracerError};
use crate::target::Registers;
use crate::tracer::artifact::{Address, VarAddress, VariableBinding};
use catalog::{attr_name, type_ref, TypeCatalog, TypeDefinition, TypeId};
use lines::{LineRow, LineTable};

/// Owning DWARF reader: section bytes live in refcounted slices, so the
/// loaded [`Dwarf`] has no borrow back into the file buffer.
pub type Reader = gimli::EndianArcSlice<gimli::RunTimeEndian>;

/// Offset of a DIE within the designated compile unit.
pub type DieOffset = gimli::UnitOffset<usize>;

/// One function defined in the designated source file.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    /// Static (unbiased) entry address.
    pub low_pc: u64,
    pub high_pc: u64,
    pub(crate) offset: DieOffset,
}

/// Loaded debug information for one target binary, scoped to the compile
/// unit of the designated source file.
pub struct DebugInfo {
    dwarf: Dwarf<Reader>,
    unit: Unit<Reader>,
    lines: LineTable,
    functions: Vec<FunctionInfo>,
    catalog: TypeCatalog,
    pie: bool,
    source_file: String,
}

impl DebugInfo {
    /// Parse `binary` and index the compile unit whose name matches
    /// `source_file` (by file name, not by path).
    pub fn load(binary: &Path, source_file: &str) -> Result<DebugInfo> {
        let bytes = std::fs::read(binary).map_err(|source| TracerError::BinaryRead {
            path: binary.display().to_string(),
            source,
        })?;
        let file = object::File::parse(&*bytes)?;
        let endian = if file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let pie = matches!(file.kind(), object::ObjectKind::Dynamic);

        let dwarf = Dwarf::load(|id| -> std::result::Result<Reader, gimli::Error> {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(gimli::EndianArcSlice::new(Arc::from(data.as_ref()), endian))
        })?;

        let unit = find_unit(&dwarf, source_file)?
            .ok_or_else(|| TracerError::MissingDebugInfo(source_file.to_owned()))?;
        let lines = build_line_table(&dwarf, &unit, source_file)?;
        if lines.is_empty() {
            return Err(TracerError::MissingDebugInfo(source_file.to_owned()));
        }
        let functions = index_functions(&dwarf, &unit, source_file)?;
        if functions.is_empty() {
            warn!(source_file, "no traceable functions found");
        }
        debug!(
            functions = functions.len(),
            source_lines = lines.source_line_count(),
            pie,
            "debug info loaded"
        );

        Ok(DebugInfo {
            dwarf,
            unit,
            lines,
            functions,
            catalog: TypeCatalog::new(),
            pie,
            source_file: source_file.to_owned(),
        })
    }

    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    pub fn is_pie(&self) -> bool {
        self.pie
    }

    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn into_definitions(self) -> BTreeMap<TypeId, TypeDefinition> {
        self.catalog.into_definitions()
    }

    /// The designated-file function whose body contains the (unbiased) pc.
    pub fn function_at(&self, pc: u64) -> Option<&FunctionInfo> {
        self.functions
            .iter()
            .find(|f| pc >= f.low_pc && pc < f.high_pc)
    }

    /// Enumerate the in-scope variables of the frame stopped at `pc`.
    ///
    /// Walks the lexical block chain containing the pc from innermost block
    /// outward; on a name collision the innermost binding wins. Types are
    /// interned through the catalog as a side effect.
    pub fn frame_bindings(
        &mut self,
        pc: u64,
        regs: &Registers,
        load_bias: u64,
    ) -> Result<Vec<VariableBinding>> {
        let Some(function) = self.function_at(pc).cloned() else {
            return Ok(Vec::new());
        };
        let DebugInfo {
            dwarf,
            unit,
            catalog,
            ..
        } = self;

        let function_entry = unit.entry(function.offset)?;
        let frame_base =
            location::resolve_frame_base(dwarf, unit, &function_entry, regs, load_bias)?;

        let scopes = scope_chain(dwarf, unit, function.offset, pc)?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut bindings = Vec::new();
        for scope in scopes.iter().rev() {
            for &var_offset in scope {
                let entry = unit.entry(var_offset)?;
                let Some(name) = attr_name(dwarf, unit, &entry)? else {
                    continue;
                };
                if !seen.insert(name.clone()) {
                    // Shadowed by an inner block's declaration.
                    continue;
                }
                let Some(ty) = type_ref(&entry)? else {
                    continue;
                };
                let type_id = catalog.get_or_create(dwarf, unit, ty)?;
                let address = match entry.attr_value(constants::DW_AT_location)? {
                    Some(AttributeValue::Exprloc(expr)) => {
                        location::evaluate_address(dwarf, unit, expr, frame_base, regs, load_bias)?
                    }
                    // Location lists only appear for optimized code, which
                    // this tracer does not target; such a binding is simply
                    // unresolved.
                    _ => None,
                };
                bindings.push(VariableBinding {
                    name,
                    type_id,
                    address: match address {
                        Some(addr) => VarAddress::Resolved(Address(addr)),
                        None => VarAddress::Unresolved,
                    },
                });
            }
        }
        Ok(bindings)
    }
}

/// Find the compile unit whose source name matches `source_file`.
fn find_unit(dwarf: &Dwarf<Reader>, source_file: &str) -> Result<Option<Unit<Reader>>> {
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        let Some(name) = unit.name.as_ref() else {
            continue;
        };
        let name = name.to_string_lossy()?;
        if file_name_matches(&name, source_file) {
            return Ok(Some(unit));
        }
    }
    Ok(None)
}

fn file_name_matches(candidate: &str, wanted: &str) -> bool {
    match (
        Path::new(candidate).file_name(),
        Path::new(wanted).file_name(),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn build_line_table(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    source_file: &str,
) -> Result<LineTable> {
    let mut out = Vec::new();
    let Some(program) = unit.line_program.clone() else {
        return Ok(LineTable::new(out));
    };
    let mut matches_cache: HashMap<u64, bool> = HashMap::new();
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        let index = row.file_index();
        let in_source = match matches_cache.get(&index) {
            Some(cached) => *cached,
            None => {
                let m = file_index_matches(dwarf, unit, header, index, source_file)?;
                matches_cache.insert(index, m);
                m
            }
        };
        let line = row.line().map(|l| l.get()).unwrap_or(0);
        out.push(LineRow {
            address: row.address(),
            line,
            is_stmt: row.is_stmt(),
            in_source: in_source && line != 0,
            end_sequence: row.end_sequence(),
        });
    }
    Ok(LineTable::new(out))
}

/// Whether a line-program file index names the designated source file.
fn file_index_matches(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    header: &LineProgramHeader<Reader>,
    index: u64,
    source_file: &str,
) -> Result<bool> {
    let Some(file) = header.file(index) else {
        return Ok(false);
    };
    let name = dwarf
        .attr_string(unit, file.path_name())?
        .to_string_lossy()?
        .into_owned();
    Ok(file_name_matches(&name, source_file))
}

/// Collect every subprogram of the unit that is defined in the designated
/// file and has a concrete address range.
fn index_functions(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    source_file: &str,
) -> Result<Vec<FunctionInfo>> {
    let mut functions = Vec::new();
    let mut entries = unit.entries();
    while let Some((_, entry)) = entries.next_dfs()? {
        if entry.tag() != constants::DW_TAG_subprogram {
            continue;
        }
        let Some(low_pc) = attr_address(entry, constants::DW_AT_low_pc)? else {
            continue;
        };
        let high_pc = match entry.attr_value(constants::DW_AT_high_pc)? {
            Some(AttributeValue::Addr(addr)) => addr,
            Some(value) => low_pc + value.udata_value().unwrap_or(0),
            None => low_pc,
        };
        if high_pc <= low_pc {
            continue;
        }
        // Header-defined functions carry a different decl file; skip them.
        if let Some(index) = entry
            .attr_value(constants::DW_AT_decl_file)?
            .and_then(|v| v.udata_value())
        {
            if let Some(program) = unit.line_program.as_ref() {
                if !file_index_matches(dwarf, unit, program.header(), index, source_file)? {
                    continue;
                }
            }
        }
        let name = attr_name(dwarf, unit, entry)?
            .unwrap_or_else(|| format!("fn@{low_pc:#x}"));
        functions.push(FunctionInfo {
            name,
            low_pc,
            high_pc,
            offset: entry.offset(),
        });
    }
    functions.sort_by_key(|f| f.low_pc);
    Ok(functions)
}

fn attr_address(
    entry: &gimli::DebuggingInformationEntry<Reader>,
    at: constants::DwAt,
) -> Result<Option<u64>> {
    match entry.attr_value(at)? {
        Some(AttributeValue::Addr(addr)) => Ok(Some(addr)),
        _ => Ok(None),
    }
}

/// Build the lexical scope chain of the block structure containing `pc`,
/// outermost first: element 0 holds the compile unit's global variables,
/// element 1 the function's own parameters and top-level locals, each
/// following element the variables of one nested block on the path down to
/// the innermost block around the pc.
fn scope_chain(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    function: DieOffset,
    pc: u64,
) -> Result<Vec<Vec<DieOffset>>> {
    let mut chain = Vec::new();
    // Compile-unit globals are the outermost scope: visible from every
    // frame, shadowed by any local of the same name.
    chain.push(unit_variables(unit)?);
    let mut current = function;
    loop {
        let mut variables = Vec::new();
        let mut next_block = None;
        let mut tree = unit.entries_tree(Some(current))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            match entry.tag() {
                constants::DW_TAG_variable | constants::DW_TAG_formal_parameter => {
                    variables.push(entry.offset());
                }
                constants::DW_TAG_lexical_block => {
                    if next_block.is_none() && block_contains(dwarf, unit, entry, pc)? {
                        next_block = Some(entry.offset());
                    }
                }
                _ => {}
            }
        }
        chain.push(variables);
        match next_block {
            Some(block) => current = block,
            None => break,
        }
    }
    Ok(chain)
}

/// Collect the `DW_TAG_variable` children of the compile-unit root: the
/// file's globals.
fn unit_variables(unit: &Unit<Reader>) -> Result<Vec<DieOffset>> {
    let mut variables = Vec::new();
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() == constants::DW_TAG_variable {
            variables.push(entry.offset());
        }
    }
    Ok(variables)
}

/// Whether a lexical block's pc range(s) cover `pc`.
fn block_contains(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
    pc: u64,
) -> Result<bool> {
    if let Some(low) = attr_address(entry, constants::DW_AT_low_pc)? {
        let high = match entry.attr_value(constants::DW_AT_high_pc)? {
            Some(AttributeValue::Addr(addr)) => addr,
            Some(value) => low + value.udata_value().unwrap_or(0),
            None => low,
        };
        return Ok(pc >= low && pc < high);
    }
    if let Some(value) = entry.attr_value(constants::DW_AT_ranges)? {
        if let Some(offset) = dwarf.attr_ranges_offset(unit, value)? {
            let mut ranges = dwarf.ranges(unit, offset)?;
            while let Some(range) = ranges.next()? {
                if pc >= range.begin && pc < range.end {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}
