//! Structural type catalog.
//!
//! Interns DWARF type descriptions into stable string [`TypeId`]s with one
//! immutable [`TypeDefinition`] per id, so the artifact carries each type
//! exactly once no matter how many variables or memory entries reference it.
//!
//! # Key behaviours
//! - Typedef/const/volatile wrappers are stripped before classification.
//! - Composite ids are registered *before* their fields resolve, so
//!   self-referential types (a struct holding a pointer to itself)
//!   terminate.
//! - Anonymous nested struct/union members never become catalog entries of
//!   their own: their fields are flattened into the parent with offsets
//!   summed.
//! - Kinds the artifact cannot represent (enums, function types, ranges…)
//!   degrade to an `unsupported` placeholder instead of failing the trace.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use gimli::{constants, AttributeValue, Dwarf, Unit};
use gimli::Reader as _;
use serde::Serialize;

use super::{DieOffset, Reader};
use crate::error::Result;

/// Interned identifier of one structural type, stable for the session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TypeId(String);

impl TypeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeId {
    fn from(s: &str) -> Self {
        TypeId(s.to_owned())
    }
}

impl From<String> for TypeId {
    fn from(s: String) -> Self {
        TypeId(s)
    }
}

/// One field of a struct or union: type plus byte offset from the base.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub type_id: TypeId,
    pub offset: u64,
}

/// Closed description of one type's shape. Created lazily, immutable once
/// created, and dispatched on by pattern match everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "base", rename_all = "lowercase")]
pub enum TypeDefinition {
    #[serde(rename_all = "camelCase")]
    Pointer { target_type_id: TypeId, size: u64 },
    #[serde(rename_all = "camelCase")]
    Array {
        element_type_id: TypeId,
        length: u64,
        size: u64,
    },
    Struct {
        fields: BTreeMap<String, FieldDef>,
        size: u64,
    },
    Union {
        fields: BTreeMap<String, FieldDef>,
        size: u64,
    },
    #[serde(rename = "atomic")]
    Primitive { name: String, size: u64 },
    Unsupported { size: u64 },
}

impl TypeDefinition {
    pub fn size(&self) -> u64 {
        match self {
            TypeDefinition::Pointer { size, .. }
            | TypeDefinition::Array { size, .. }
            | TypeDefinition::Struct { size, .. }
            | TypeDefinition::Union { size, .. }
            | TypeDefinition::Primitive { size, .. }
            | TypeDefinition::Unsupported { size } => *size,
        }
    }
}

/// A (possibly nested) member list before flattening. Anonymous nodes carry
/// their own members; they contribute fields but never an entry of their own.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldNode {
    Named {
        name: String,
        type_id: TypeId,
        offset: u64,
    },
    Anonymous {
        offset: u64,
        members: Vec<FieldNode>,
    },
}

/// Flatten a member list into the final field map.
///
/// Members of anonymous nested struct/union nodes are merged into the parent
/// map at `anonymous offset + member offset`, recursively. Pure function,
/// independent of the memoizing catalog.
pub(crate) fn flatten_fields(nodes: Vec<FieldNode>) -> BTreeMap<String, FieldDef> {
    let mut fields = BTreeMap::new();
    let mut work: VecDeque<(u64, FieldNode)> = nodes.into_iter().map(|n| (0, n)).collect();
    while let Some((base, node)) = work.pop_front() {
        match node {
            FieldNode::Named {
                name,
                type_id,
                offset,
            } => {
                fields.insert(
                    name,
                    FieldDef {
                        type_id,
                        offset: base + offset,
                    },
                );
            }
            FieldNode::Anonymous { offset, members } => {
                for member in members {
                    work.push_back((base + offset, member));
                }
            }
        }
    }
    fields
}

/// Session-owned interning table: DIE offset → id, id → definition.
///
/// Only the stepping thread mutates it; entries are created once and later
/// lookups return the cached id without recomputation.
#[derive(Debug, Default)]
pub struct TypeCatalog {
    by_offset: HashMap<usize, TypeId>,
    definitions: BTreeMap<TypeId, TypeDefinition>,
    anonymous_counter: u64,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the definition behind an interned id.
    pub fn definition(&self, id: &TypeId) -> Option<&TypeDefinition> {
        self.definitions.get(id)
    }

    /// Consume the catalog into the artifact's definition map.
    pub fn into_definitions(self) -> BTreeMap<TypeId, TypeDefinition> {
        self.definitions
    }

    /// Intern the type referenced by `offset`, returning its stable id.
    pub fn get_or_create(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
    ) -> Result<TypeId> {
        let Some(offset) = strip_wrappers(unit, offset)? else {
            return Ok(self.void_primitive());
        };
        if let Some(id) = self.by_offset.get(&offset.0) {
            return Ok(id.clone());
        }

        let tag = unit.entry(offset)?.tag();
        match tag {
            constants::DW_TAG_base_type => self.intern_primitive(dwarf, unit, offset),
            constants::DW_TAG_pointer_type => self.intern_pointer(dwarf, unit, offset),
            constants::DW_TAG_array_type => self.intern_array(dwarf, unit, offset),
            constants::DW_TAG_structure_type | constants::DW_TAG_union_type => {
                self.intern_composite(dwarf, unit, offset, tag == constants::DW_TAG_union_type)
            }
            // Enums, function types, bitsets, ranges and anything else the
            // artifact cannot represent: placeholder, never an error.
            _ => self.intern_unsupported(dwarf, unit, offset),
        }
    }

    fn intern_primitive(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
    ) -> Result<TypeId> {
        let entry = unit.entry(offset)?;
        let name = attr_name(dwarf, unit, &entry)?.unwrap_or_else(|| "<unnamed>".to_owned());
        let size = byte_size(&entry)?.unwrap_or(0);
        let id = TypeId::from(name.clone());
        self.by_offset.insert(offset.0, id.clone());
        self.definitions
            .insert(id.clone(), TypeDefinition::Primitive { name, size });
        Ok(id)
    }

    fn intern_pointer(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
    ) -> Result<TypeId> {
        let entry = unit.entry(offset)?;
        let declared_name = attr_name(dwarf, unit, &entry)?;
        let size = byte_size(&entry)?.unwrap_or(unit.encoding().address_size as u64);
        let target = type_ref(&entry)?;
        drop(entry);

        let target_type_id = match target {
            Some(target) => self.get_or_create(dwarf, unit, target)?,
            None => self.void_primitive(),
        };
        let id = TypeId::from(declared_name.unwrap_or_else(|| format!("{target_type_id}*")));
        self.by_offset.insert(offset.0, id.clone());
        self.definitions.insert(
            id.clone(),
            TypeDefinition::Pointer {
                target_type_id,
                size,
            },
        );
        Ok(id)
    }

    fn intern_array(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
    ) -> Result<TypeId> {
        let entry = unit.entry(offset)?;
        let declared_size = byte_size(&entry)?;
        let element = type_ref(&entry)?;
        drop(entry);

        let (element_type_id, element_size) = match element {
            Some(element) => {
                let id = self.get_or_create(dwarf, unit, element)?;
                let size = self.definition(&id).map(TypeDefinition::size).unwrap_or(0);
                (id, size)
            }
            None => (self.void_primitive(), 0),
        };

        // The element count declared in the subrange child is unreliable for
        // flexible or incomplete arrays; derive it from total ÷ element size
        // whenever the total is known.
        let total_size = match declared_size {
            Some(size) => size,
            None => declared_count(unit, offset)?.unwrap_or(0) * element_size,
        };
        let length = if element_size > 0 {
            total_size / element_size
        } else {
            0
        };

        let id = TypeId::from(format!("{element_type_id}[{length}]"));
        self.by_offset.insert(offset.0, id.clone());
        self.definitions.insert(
            id.clone(),
            TypeDefinition::Array {
                element_type_id,
                length,
                size: total_size,
            },
        );
        Ok(id)
    }

    fn intern_composite(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
        is_union: bool,
    ) -> Result<TypeId> {
        let entry = unit.entry(offset)?;
        let keyword = if is_union { "union" } else { "struct" };
        let name = match attr_name(dwarf, unit, &entry)? {
            Some(name) => name,
            None => self.next_anonymous(),
        };
        let size = byte_size(&entry)?.unwrap_or(0);
        drop(entry);

        // Register the id before resolving fields so that a member chain
        // leading back to this type hits the memo instead of recursing.
        let id = TypeId::from(format!("{keyword} {name}"));
        self.by_offset.insert(offset.0, id.clone());

        let members = self.member_nodes(dwarf, unit, offset, is_union)?;
        let fields = flatten_fields(members);
        let definition = if is_union {
            TypeDefinition::Union { fields, size }
        } else {
            TypeDefinition::Struct { fields, size }
        };
        self.definitions.insert(id.clone(), definition);
        Ok(id)
    }

    fn intern_unsupported(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
    ) -> Result<TypeId> {
        let entry = unit.entry(offset)?;
        let name = match attr_name(dwarf, unit, &entry)? {
            Some(name) => name,
            None => self.next_anonymous(),
        };
        let size = byte_size(&entry)?.unwrap_or(0);
        let id = TypeId::from(format!("unsupported {name}"));
        self.by_offset.insert(offset.0, id.clone());
        self.definitions
            .insert(id.clone(), TypeDefinition::Unsupported { size });
        Ok(id)
    }

    /// Read the direct members of a composite DIE as a (possibly nested)
    /// field node list. Union members all sit at offset 0; anonymous nested
    /// composites are descended into rather than interned.
    fn member_nodes(
        &mut self,
        dwarf: &Dwarf<Reader>,
        unit: &Unit<Reader>,
        offset: DieOffset,
        is_union: bool,
    ) -> Result<Vec<FieldNode>> {
        // Collect the raw member rows first; interning member types re-enters
        // the catalog and must not happen while the tree cursor is live.
        let mut raw: Vec<(Option<String>, u64, Option<DieOffset>)> = Vec::new();
        {
            let mut tree = unit.entries_tree(Some(offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let entry = child.entry();
                if entry.tag() != constants::DW_TAG_member || is_artificial(entry)? {
                    continue;
                }
                let name = attr_name(dwarf, unit, entry)?;
                let member_offset = if is_union {
                    0
                } else {
                    entry
                        .attr_value(constants::DW_AT_data_member_location)?
                        .and_then(|v| v.udata_value())
                        .unwrap_or(0)
                };
                raw.push((name, member_offset, type_ref(entry)?));
            }
        }

        let mut nodes = Vec::new();
        for (name, member_offset, ty) in raw {
            let Some(ty) = ty else { continue };
            match name {
                Some(name) => {
                    let type_id = self.get_or_create(dwarf, unit, ty)?;
                    nodes.push(FieldNode::Named {
                        name,
                        type_id,
                        offset: member_offset,
                    });
                }
                None => {
                    let Some(inner) = strip_wrappers(unit, ty)? else {
                        continue;
                    };
                    let inner_tag = unit.entry(inner)?.tag();
                    if inner_tag == constants::DW_TAG_structure_type
                        || inner_tag == constants::DW_TAG_union_type
                    {
                        let members = self.member_nodes(
                            dwarf,
                            unit,
                            inner,
                            inner_tag == constants::DW_TAG_union_type,
                        )?;
                        nodes.push(FieldNode::Anonymous {
                            offset: member_offset,
                            members,
                        });
                    }
                }
            }
        }
        Ok(nodes)
    }

    fn void_primitive(&mut self) -> TypeId {
        let id = TypeId::from("void");
        self.definitions
            .entry(id.clone())
            .or_insert(TypeDefinition::Primitive {
                name: "void".to_owned(),
                size: 0,
            });
        id
    }

    fn next_anonymous(&mut self) -> String {
        self.anonymous_counter += 1;
        format!("<anonymous {}>", self.anonymous_counter)
    }
}

#[cfg(test)]
impl TypeCatalog {
    /// Build a catalog from ready-made definitions, bypassing DWARF.
    pub(crate) fn from_definitions(
        definitions: impl IntoIterator<Item = (TypeId, TypeDefinition)>,
    ) -> Self {
        TypeCatalog {
            by_offset: HashMap::new(),
            definitions: definitions.into_iter().collect(),
            anonymous_counter: 0,
        }
    }
}

/// Follow typedef/const/volatile wrappers to the underlying type DIE.
/// `None` means the chain ended without a referent (C's `void`).
pub(crate) fn strip_wrappers(unit: &Unit<Reader>, mut offset: DieOffset) -> Result<Option<DieOffset>> {
    loop {
        let entry = unit.entry(offset)?;
        match entry.tag() {
            constants::DW_TAG_typedef
            | constants::DW_TAG_const_type
            | constants::DW_TAG_volatile_type
            | constants::DW_TAG_restrict_type => match type_ref(&entry)? {
                Some(next) => offset = next,
                None => return Ok(None),
            },
            _ => return Ok(Some(offset)),
        }
    }
}

pub(crate) fn type_ref(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<Option<DieOffset>> {
    match entry.attr_value(constants::DW_AT_type)? {
        Some(AttributeValue::UnitRef(offset)) => Ok(Some(offset)),
        _ => Ok(None),
    }
}

fn byte_size(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<Option<u64>> {
    Ok(entry
        .attr_value(constants::DW_AT_byte_size)?
        .and_then(|v| v.udata_value()))
}

fn is_artificial(entry: &gimli::DebuggingInformationEntry<Reader>) -> Result<bool> {
    Ok(matches!(
        entry.attr_value(constants::DW_AT_artificial)?,
        Some(AttributeValue::Flag(true))
    ))
}

pub(crate) fn attr_name(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &gimli::DebuggingInformationEntry<Reader>,
) -> Result<Option<String>> {
    match entry.attr_value(constants::DW_AT_name)? {
        Some(value) => Ok(Some(
            dwarf
                .attr_string(unit, value)?
                .to_string_lossy()?
                .into_owned(),
        )),
        None => Ok(None),
    }
}

/// Element count declared by an array DIE's subrange child, if any.
fn declared_count(unit: &Unit<Reader>, offset: DieOffset) -> Result<Option<u64>> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != constants::DW_TAG_subrange_type {
            continue;
        }
        if let Some(count) = entry
            .attr_value(constants::DW_AT_count)?
            .and_then(|v| v.udata_value())
        {
            return Ok(Some(count));
        }
        if let Some(upper) = entry
            .attr_value(constants::DW_AT_upper_bound)?
            .and_then(|v| v.udata_value())
        {
            return Ok(Some(upper + 1));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, ty: &str, offset: u64) -> FieldNode {
        FieldNode::Named {
            name: name.into(),
            type_id: TypeId::from(ty),
            offset,
        }
    }

    #[test]
    fn flatten_keeps_plain_fields() {
        let fields = flatten_fields(vec![named("x", "int", 0), named("y", "int", 4)]);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["x"].offset, 0);
        assert_eq!(fields["y"].offset, 4);
    }

    #[test]
    fn flatten_merges_anonymous_members_with_summed_offsets() {
        // struct { int tag; union { int a; float b; } /* at offset 4 */; }
        let fields = flatten_fields(vec![
            named("tag", "int", 0),
            FieldNode::Anonymous {
                offset: 4,
                members: vec![named("a", "int", 0), named("b", "float", 0)],
            },
        ]);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["tag"].offset, 0);
        assert_eq!(fields["a"].offset, 4);
        assert_eq!(fields["b"].offset, 4);
        assert!(!fields.keys().any(|k| k.contains("anonymous")));
    }

    #[test]
    fn flatten_handles_doubly_nested_anonymous_members() {
        // struct { struct { int i; union { char c; } /* +8 */; } /* +16 */; }
        let fields = flatten_fields(vec![FieldNode::Anonymous {
            offset: 16,
            members: vec![
                named("i", "int", 0),
                FieldNode::Anonymous {
                    offset: 8,
                    members: vec![named("c", "char", 0)],
                },
            ],
        }]);
        assert_eq!(fields["i"].offset, 16);
        assert_eq!(fields["c"].offset, 24);
    }

    #[test]
    fn type_definition_serializes_with_base_tag() {
        let def = TypeDefinition::Pointer {
            target_type_id: TypeId::from("int"),
            size: 8,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["base"], "pointer");
        assert_eq!(json["targetTypeId"], "int");
        assert_eq!(json["size"], 8);

        let prim = TypeDefinition::Primitive {
            name: "int".into(),
            size: 4,
        };
        assert_eq!(serde_json::to_value(&prim).unwrap()["base"], "atomic");
    }

    #[test]
    fn union_fields_share_offset_zero_in_definition() {
        let def = TypeDefinition::Union {
            fields: flatten_fields(vec![named("a", "int", 0), named("b", "float", 0)]),
            size: 4,
        };
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["base"], "union");
        assert_eq!(json["fields"]["a"]["offset"], 0);
        assert_eq!(json["fields"]["b"]["offset"], 0);
    }
}
