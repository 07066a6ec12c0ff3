//! Recursive type-directed value serialization.
//!
//! Given a variable's type and address, the serializer walks the value
//! graph: primitives are decoded by name, composites recurse into every
//! flattened field, arrays into every element, and pointers chase their
//! pointee. Each visited (address, type) pair becomes one memory-map
//! entry; a per-snapshot visited set terminates cyclic structures.

use std::collections::HashSet;

use itertools::Itertools;
use tracing::trace;

use crate::dwarf::catalog::{TypeCatalog, TypeDefinition, TypeId};
use crate::target::MemoryReader;

use super::artifact::{Address, MemoryEntry, MemoryKey, MemoryMap};

/// Reads larger than this are treated as corrupt type info.
const MAX_READ_BYTES: u64 = 1 << 20;

pub struct ValueSerializer<'a> {
    catalog: &'a TypeCatalog,
    memory: &'a dyn MemoryReader,
    visited: HashSet<MemoryKey>,
}

impl<'a> ValueSerializer<'a> {
    pub fn new(catalog: &'a TypeCatalog, memory: &'a dyn MemoryReader) -> Self {
        Self {
            catalog,
            memory,
            visited: HashSet::new(),
        }
    }

    /// Serialize the value of type `type_id` at `base` into `out`,
    /// recursing through fields, elements and pointees.
    pub fn parse_value(&mut self, type_id: &TypeId, base: u64, out: &mut MemoryMap) {
        let key = MemoryKey {
            address: Address(base),
            type_id: type_id.clone(),
        };
        if !self.visited.insert(key) {
            return;
        }
        let Some(def) = self.catalog.definition(type_id) else {
            return;
        };
        match def {
            TypeDefinition::Pointer {
                target_type_id,
                size,
            } => self.parse_pointer(type_id, target_type_id, *size, base, out),
            TypeDefinition::Array {
                element_type_id,
                size,
                ..
            } => self.parse_array(element_type_id, *size, base, out),
            TypeDefinition::Struct { fields, .. } | TypeDefinition::Union { fields, .. } => {
                self.parse_composite(fields.clone(), base, out)
            }
            TypeDefinition::Primitive { name, size } => {
                self.parse_primitive(type_id, name, *size, base, out)
            }
            TypeDefinition::Unsupported { size } => self.parse_opaque(type_id, *size, base, out),
        }
    }

    fn parse_pointer(
        &mut self,
        type_id: &TypeId,
        target: &TypeId,
        size: u64,
        base: u64,
        out: &mut MemoryMap,
    ) {
        let key = MemoryKey {
            address: Address(base),
            type_id: type_id.clone(),
        };
        let Some(bytes) = self.read(base, size) else {
            out.insert(key, unknown_entry());
            return;
        };
        let pointee = le_unsigned(&bytes);
        let value = if pointee == 0 {
            "NULL".to_owned()
        } else {
            format!("{pointee:#x}")
        };
        out.insert(
            key,
            MemoryEntry {
                value: Some(value),
                raw_bytes: Some(raw_bytes(&bytes)),
            },
        );
        if pointee == 0 {
            return;
        }
        let target = target.clone();
        // Probe before recursing: an unreadable pointee keeps the pointer
        // entry but yields no nested entries.
        let mut probe = [0u8; 1];
        if self.memory.read_memory(pointee, &mut probe).is_err() {
            trace!(address = pointee, "skipping unreadable pointee");
            return;
        }
        self.parse_value(&target, pointee, out);
    }

    fn parse_array(&mut self, element: &TypeId, size: u64, base: u64, out: &mut MemoryMap) {
        let Some(elem_def) = self.catalog.definition(element) else {
            return;
        };
        let elem_size = elem_def.size();
        if elem_size == 0 {
            return;
        }
        let element = element.clone();
        for i in 0..size / elem_size {
            self.parse_value(&element, base + i * elem_size, out);
        }
    }

    fn parse_composite(
        &mut self,
        fields: std::collections::BTreeMap<String, crate::dwarf::catalog::FieldDef>,
        base: u64,
        out: &mut MemoryMap,
    ) {
        for field in fields.values() {
            self.parse_value(&field.type_id, base + field.offset, out);
        }
    }

    fn parse_primitive(
        &mut self,
        type_id: &TypeId,
        name: &str,
        size: u64,
        base: u64,
        out: &mut MemoryMap,
    ) {
        if size == 0 {
            return;
        }
        let key = MemoryKey {
            address: Address(base),
            type_id: type_id.clone(),
        };
        match self.read(base, size) {
            None => {
                out.insert(key, unknown_entry());
            }
            Some(bytes) => {
                out.insert(
                    key,
                    MemoryEntry {
                        value: Some(format_primitive(name, &bytes)),
                        raw_bytes: Some(raw_bytes(&bytes)),
                    },
                );
            }
        }
    }

    fn parse_opaque(&mut self, type_id: &TypeId, size: u64, base: u64, out: &mut MemoryMap) {
        if size == 0 {
            return;
        }
        let key = MemoryKey {
            address: Address(base),
            type_id: type_id.clone(),
        };
        match self.read(base, size) {
            None => {
                out.insert(key, unknown_entry());
            }
            Some(bytes) => {
                out.insert(
                    key,
                    MemoryEntry {
                        value: None,
                        raw_bytes: Some(raw_bytes(&bytes)),
                    },
                );
            }
        }
    }

    fn read(&self, base: u64, size: u64) -> Option<Vec<u8>> {
        if size == 0 || size > MAX_READ_BYTES {
            return None;
        }
        let mut buf = vec![0u8; size as usize];
        self.memory.read_memory(base, &mut buf).ok()?;
        Some(buf)
    }
}

fn unknown_entry() -> MemoryEntry {
    MemoryEntry {
        value: Some("unknown".to_owned()),
        raw_bytes: None,
    }
}

/// Space-separated uppercase hex, one pair per byte.
fn raw_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).join(" ")
}

fn le_unsigned(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    let n = bytes.len().min(8);
    word[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(word)
}

fn le_signed(bytes: &[u8]) -> i64 {
    let n = bytes.len().min(8);
    let raw = le_unsigned(bytes);
    if n == 8 {
        return raw as i64;
    }
    let shift = 64 - n as u32 * 8;
    ((raw << shift) as i64) >> shift
}

/// Render a primitive value the way a source-level debugger prints it.
pub(crate) fn format_primitive(name: &str, bytes: &[u8]) -> String {
    if name.contains("float") && bytes.len() == 4 {
        let v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        return format!("{v}");
    }
    if name.contains("double") && bytes.len() == 8 {
        let mut word = [0u8; 8];
        word.copy_from_slice(bytes);
        return format!("{}", f64::from_le_bytes(word));
    }
    if name.contains("_Bool") || name == "bool" {
        return (bytes[0] != 0).to_string();
    }
    if name.contains("char") && bytes.len() == 1 {
        return format_char(name, bytes[0]);
    }
    if is_integer_name(name) {
        if bytes.len() > 8 {
            return raw_bytes(bytes);
        }
        if name.contains("unsigned") {
            return le_unsigned(bytes).to_string();
        }
        return le_signed(bytes).to_string();
    }
    raw_bytes(bytes)
}

fn is_integer_name(name: &str) -> bool {
    name.split_whitespace()
        .all(|w| matches!(w, "signed" | "unsigned" | "int" | "long" | "short" | "char"))
}

fn format_char(name: &str, byte: u8) -> String {
    let numeric = if name.contains("unsigned") {
        i64::from(byte)
    } else {
        i64::from(byte as i8)
    };
    let rendered = match byte {
        b'\n' => "\\n".to_owned(),
        b'\t' => "\\t".to_owned(),
        b'\r' => "\\r".to_owned(),
        0 => "\\000".to_owned(),
        b'\\' => "\\\\".to_owned(),
        b'\'' => "\\'".to_owned(),
        0x20..=0x7e => (byte as char).to_string(),
        _ => format!("\\x{byte:02x}"),
    };
    format!("{numeric} '{rendered}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::catalog::FieldDef;
    use crate::error::{Result, TracerError};
    use std::collections::BTreeMap;

    /// Byte-addressed sparse memory image; unmapped bytes fail the read.
    #[derive(Default)]
    struct MemoryImage {
        bytes: BTreeMap<u64, u8>,
    }

    impl MemoryImage {
        fn put(&mut self, address: u64, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.bytes.insert(address + i as u64, *b);
            }
        }
    }

    impl MemoryReader for MemoryImage {
        fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
            let length = buf.len();
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = *self
                    .bytes
                    .get(&(address + i as u64))
                    .ok_or(TracerError::MemoryRead { address, length })?;
            }
            Ok(())
        }
    }

    fn int() -> (TypeId, TypeDefinition) {
        (
            TypeId::from("int"),
            TypeDefinition::Primitive {
                name: "int".to_owned(),
                size: 4,
            },
        )
    }

    fn catalog(defs: Vec<(TypeId, TypeDefinition)>) -> TypeCatalog {
        TypeCatalog::from_definitions(defs)
    }

    fn entry<'m>(out: &'m MemoryMap, address: u64, type_id: &str) -> &'m MemoryEntry {
        out.get(&MemoryKey {
            address: Address(address),
            type_id: TypeId::from(type_id),
        })
        .unwrap_or_else(|| panic!("missing entry {address:#x}:{type_id}"))
    }

    #[test]
    fn pointer_chases_to_pointee() {
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("int *"),
                TypeDefinition::Pointer {
                    target_type_id: TypeId::from("int"),
                    size: 8,
                },
            ),
        ]);
        let mut mem = MemoryImage::default();
        mem.put(0x1000, &5i32.to_le_bytes());
        mem.put(0x2000, &0x1000u64.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("int *"), 0x2000, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(entry(&out, 0x2000, "int *").value.as_deref(), Some("0x1000"));
        assert_eq!(entry(&out, 0x1000, "int").value.as_deref(), Some("5"));
        assert_eq!(
            entry(&out, 0x1000, "int").raw_bytes.as_deref(),
            Some("05 00 00 00")
        );
    }

    #[test]
    fn null_pointer_yields_single_entry() {
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("int *"),
                TypeDefinition::Pointer {
                    target_type_id: TypeId::from("int"),
                    size: 8,
                },
            ),
        ]);
        let mut mem = MemoryImage::default();
        mem.put(0x2000, &0u64.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("int *"), 0x2000, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(entry(&out, 0x2000, "int *").value.as_deref(), Some("NULL"));
    }

    #[test]
    fn unreadable_pointee_keeps_pointer_entry_only() {
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("int *"),
                TypeDefinition::Pointer {
                    target_type_id: TypeId::from("int"),
                    size: 8,
                },
            ),
        ]);
        let mut mem = MemoryImage::default();
        mem.put(0x2000, &0xdead_u64.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("int *"), 0x2000, &mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(entry(&out, 0x2000, "int *").value.as_deref(), Some("0xdead"));
    }

    #[test]
    fn array_emits_one_entry_per_element() {
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("int [3]"),
                TypeDefinition::Array {
                    element_type_id: TypeId::from("int"),
                    length: 3,
                    size: 12,
                },
            ),
        ]);
        let mut mem = MemoryImage::default();
        for (i, v) in [1i32, 2, 3].iter().enumerate() {
            mem.put(0x3000 + 4 * i as u64, &v.to_le_bytes());
        }

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("int [3]"), 0x3000, &mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(entry(&out, 0x3000, "int").value.as_deref(), Some("1"));
        assert_eq!(entry(&out, 0x3004, "int").value.as_deref(), Some("2"));
        assert_eq!(entry(&out, 0x3008, "int").value.as_deref(), Some("3"));
    }

    #[test]
    fn union_reinterprets_same_bytes_per_member() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "as_int".to_owned(),
            FieldDef {
                type_id: TypeId::from("int"),
                offset: 0,
            },
        );
        fields.insert(
            "as_float".to_owned(),
            FieldDef {
                type_id: TypeId::from("float"),
                offset: 0,
            },
        );
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("float"),
                TypeDefinition::Primitive {
                    name: "float".to_owned(),
                    size: 4,
                },
            ),
            (
                TypeId::from("union U"),
                TypeDefinition::Union { fields, size: 4 },
            ),
        ]);
        let mut mem = MemoryImage::default();
        mem.put(0x4000, &1.0f32.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("union U"), 0x4000, &mut out);

        assert_eq!(out.len(), 2);
        assert_eq!(
            entry(&out, 0x4000, "int").value.as_deref(),
            Some("1065353216")
        );
        assert_eq!(entry(&out, 0x4000, "float").value.as_deref(), Some("1"));
    }

    #[test]
    fn unreadable_field_gets_unknown_placeholder() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "a".to_owned(),
            FieldDef {
                type_id: TypeId::from("int"),
                offset: 0,
            },
        );
        fields.insert(
            "b".to_owned(),
            FieldDef {
                type_id: TypeId::from("int"),
                offset: 4,
            },
        );
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("struct S"),
                TypeDefinition::Struct { fields, size: 8 },
            ),
        ]);
        let mut mem = MemoryImage::default();
        // Only the first field is mapped.
        mem.put(0x7000, &7i32.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("struct S"), 0x7000, &mut out);

        assert_eq!(entry(&out, 0x7000, "int").value.as_deref(), Some("7"));
        let b = entry(&out, 0x7004, "int");
        assert_eq!(b.value.as_deref(), Some("unknown"));
        assert!(b.raw_bytes.is_none());
    }

    #[test]
    fn cyclic_list_terminates() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "value".to_owned(),
            FieldDef {
                type_id: TypeId::from("int"),
                offset: 0,
            },
        );
        fields.insert(
            "next".to_owned(),
            FieldDef {
                type_id: TypeId::from("struct node *"),
                offset: 8,
            },
        );
        let cat = catalog(vec![
            int(),
            (
                TypeId::from("struct node"),
                TypeDefinition::Struct { fields, size: 16 },
            ),
            (
                TypeId::from("struct node *"),
                TypeDefinition::Pointer {
                    target_type_id: TypeId::from("struct node"),
                    size: 8,
                },
            ),
        ]);
        let mut mem = MemoryImage::default();
        // Two nodes pointing at each other.
        mem.put(0x5000, &1i32.to_le_bytes());
        mem.put(0x5008, &0x5010u64.to_le_bytes());
        mem.put(0x5010, &2i32.to_le_bytes());
        mem.put(0x5018, &0x5000u64.to_le_bytes());

        let mut out = MemoryMap::new();
        ValueSerializer::new(&cat, &mem).parse_value(&TypeId::from("struct node"), 0x5000, &mut out);

        assert_eq!(entry(&out, 0x5000, "int").value.as_deref(), Some("1"));
        assert_eq!(entry(&out, 0x5010, "int").value.as_deref(), Some("2"));
        assert_eq!(
            entry(&out, 0x5008, "struct node *").value.as_deref(),
            Some("0x5010")
        );
        assert_eq!(
            entry(&out, 0x5018, "struct node *").value.as_deref(),
            Some("0x5000")
        );
    }

    #[test]
    fn formats_chars_bools_and_negatives() {
        assert_eq!(format_primitive("char", &[b'a']), "97 'a'");
        assert_eq!(format_primitive("char", &[b'\n']), "10 '\\n'");
        assert_eq!(format_primitive("char", &[0x80]), "-128 '\\x80'");
        assert_eq!(format_primitive("unsigned char", &[0xff]), "255 '\\xff'");
        assert_eq!(format_primitive("_Bool", &[1]), "true");
        assert_eq!(format_primitive("_Bool", &[0]), "false");
        assert_eq!(format_primitive("int", &(-1i32).to_le_bytes()), "-1");
        assert_eq!(
            format_primitive("long unsigned int", &u64::MAX.to_le_bytes()),
            "18446744073709551615"
        );
        assert_eq!(format_primitive("double", &2.5f64.to_le_bytes()), "2.5");
    }
}
