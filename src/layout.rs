//! C-compatible record layout.
//!
//! Field offsets, record size, and alignment follow the host C ABI
//! rules: each field is placed at the next offset aligned to its own
//! alignment, the record's alignment is the largest field alignment,
//! and the total size is rounded up to that alignment.

use rustc_hash::FxHashMap;

use crate::ast::{PrimType, StructDef};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub offset: u32,
    pub ty: PrimType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructLayout {
    pub size: u32,
    pub align: u32,
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Compute the layout of one record definition. Void-typed fields are
/// skipped; the parser rejects them before they reach here.
pub fn layout_of(def: &StructDef) -> StructLayout {
    let mut offset = 0u32;
    let mut align = 0u32;
    let mut fields = Vec::with_capacity(def.fields.len());

    for (name, ty) in &def.fields {
        let size = ty.size();
        if size == 0 {
            continue;
        }
        let field_align = ty.align();
        align = align.max(field_align);
        offset = round_up(offset, field_align);
        fields.push(FieldLayout {
            name: name.clone(),
            offset,
            ty: *ty,
        });
        offset += size;
    }

    StructLayout {
        size: round_up(offset, align),
        align,
        fields,
    }
}

pub type LayoutMap = FxHashMap<String, StructLayout>;

pub fn build_layout_map(defs: &[StructDef]) -> LayoutMap {
    defs.iter()
        .map(|d| (d.name.clone(), layout_of(d)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(fields: &[(&str, PrimType)]) -> StructDef {
        StructDef {
            name: "T".to_string(),
            fields: fields
                .iter()
                .map(|(n, t)| (n.to_string(), *t))
                .collect(),
            exported: false,
        }
    }

    #[test]
    fn test_empty_struct() {
        let l = layout_of(&def(&[]));
        assert_eq!(l.size, 0);
        assert_eq!(l.align, 0);
    }

    #[test]
    fn test_single_i32() {
        let l = layout_of(&def(&[("a", PrimType::I32)]));
        assert_eq!(l.size, 4);
        assert_eq!(l.align, 4);
        assert_eq!(l.field("a").unwrap().offset, 0);
    }

    #[test]
    fn test_padding_between_i32_and_f64() {
        let l = layout_of(&def(&[("a", PrimType::I32), ("b", PrimType::F64)]));
        assert_eq!(l.field("a").unwrap().offset, 0);
        assert_eq!(l.field("b").unwrap().offset, 8);
        assert_eq!(l.size, 16);
        assert_eq!(l.align, 8);
    }

    #[test]
    fn test_tail_padding_to_record_alignment() {
        let l = layout_of(&def(&[("a", PrimType::F64), ("b", PrimType::I32)]));
        assert_eq!(l.field("b").unwrap().offset, 8);
        assert_eq!(l.size, 16);
    }

    #[test]
    fn test_packed_i32_pair() {
        let l = layout_of(&def(&[("a", PrimType::I32), ("b", PrimType::I32)]));
        assert_eq!(l.field("b").unwrap().offset, 4);
        assert_eq!(l.size, 8);
        assert_eq!(l.align, 4);
    }

    #[test]
    fn test_pointer_fields_are_word_sized() {
        let l = layout_of(&def(&[
            ("func", PrimType::Ptr),
            ("x", PrimType::F64),
            ("y", PrimType::F64),
        ]));
        assert_eq!(l.field("func").unwrap().offset, 0);
        assert_eq!(l.field("x").unwrap().offset, 8);
        assert_eq!(l.field("y").unwrap().offset, 16);
        assert_eq!(l.size, 24);
    }

    #[test]
    fn test_void_fields_are_skipped() {
        let l = layout_of(&def(&[("v", PrimType::Void), ("a", PrimType::I64)]));
        assert!(l.field("v").is_none());
        assert_eq!(l.field("a").unwrap().offset, 0);
        assert_eq!(l.size, 8);
    }

    #[test]
    fn test_layout_map_keys() {
        let defs = vec![
            StructDef {
                name: "A".to_string(),
                fields: vec![("x".to_string(), PrimType::I64)],
                exported: false,
            },
            StructDef {
                name: "B".to_string(),
                fields: vec![("y".to_string(), PrimType::F32)],
                exported: true,
            },
        ];
        let map = build_layout_map(&defs);
        assert_eq!(map.len(), 2);
        assert_eq!(map["A"].size, 8);
        assert_eq!(map["B"].size, 4);
    }
}
