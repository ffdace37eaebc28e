// Property tests for the record layout engine.
//
// Verifies the C-ABI layout laws over arbitrary field lists: offsets
// are aligned and monotone, the record alignment is the largest field
// alignment, and the total size is the padded end of the last field.

use fusion::ast::{PrimType, StructDef};
use fusion::layout::layout_of;
use proptest::prelude::*;

fn arb_prim() -> impl Strategy<Value = PrimType> {
    prop_oneof![
        Just(PrimType::I32),
        Just(PrimType::I64),
        Just(PrimType::F32),
        Just(PrimType::F64),
        Just(PrimType::Ptr),
    ]
}

fn arb_struct() -> impl Strategy<Value = StructDef> {
    prop::collection::vec(arb_prim(), 0..12).prop_map(|types| StructDef {
        name: "T".to_string(),
        fields: types
            .into_iter()
            .enumerate()
            .map(|(i, ty)| (format!("f{}", i), ty))
            .collect(),
        exported: false,
    })
}

fn round_up(value: u32, align: u32) -> u32 {
    if align == 0 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn first_field_is_at_offset_zero(def in arb_struct()) {
        let layout = layout_of(&def);
        if let Some(first) = layout.fields.first() {
            prop_assert_eq!(first.offset, 0);
        }
    }

    #[test]
    fn every_offset_is_aligned(def in arb_struct()) {
        let layout = layout_of(&def);
        for field in &layout.fields {
            prop_assert_eq!(field.offset % field.ty.align(), 0,
                "field {} at offset {} not aligned to {}",
                field.name, field.offset, field.ty.align());
        }
    }

    #[test]
    fn offsets_follow_the_round_up_recurrence(def in arb_struct()) {
        let layout = layout_of(&def);
        for pair in layout.fields.windows(2) {
            let expected = round_up(pair[0].offset + pair[0].ty.size(), pair[1].ty.align());
            prop_assert_eq!(pair[1].offset, expected);
        }
    }

    #[test]
    fn alignment_is_max_field_alignment(def in arb_struct()) {
        let layout = layout_of(&def);
        let expected = layout.fields.iter().map(|f| f.ty.align()).max().unwrap_or(0);
        prop_assert_eq!(layout.align, expected);
    }

    #[test]
    fn size_is_padded_end_of_last_field(def in arb_struct()) {
        let layout = layout_of(&def);
        match layout.fields.last() {
            Some(last) => {
                let expected = round_up(last.offset + last.ty.size(), layout.align);
                prop_assert_eq!(layout.size, expected);
            }
            None => prop_assert_eq!(layout.size, 0),
        }
    }

    #[test]
    fn size_is_a_multiple_of_alignment(def in arb_struct()) {
        let layout = layout_of(&def);
        if layout.align != 0 {
            prop_assert_eq!(layout.size % layout.align, 0);
        }
    }

    #[test]
    fn fields_never_overlap(def in arb_struct()) {
        let layout = layout_of(&def);
        for pair in layout.fields.windows(2) {
            prop_assert!(pair[0].offset + pair[0].ty.size() <= pair[1].offset);
        }
    }
}
