//! Tagged machine-word decoding.
//!
//! `work_struct.data` packs two unrelated things into one word. With the
//! discriminant bit (`WORK_STRUCT_PWQ`) set, the high bits are a pointer to the
//! owning `pool_workqueue`. With it clear, the word holds an off-queue pool id
//! shifted up by `WORK_OFFQ_POOL_SHIFT`, or the "no pool" sentinel.
//!
//! [`classify`] is the pure bit-level half; [`decode`] resolves an id through
//! an [`IdIndex`].

use serde::Serialize;
use snapdecode_types::{Address, DecodeResult};

use crate::idindex::IdIndex;
use crate::oracle::Target;

/// Masks and sentinel describing one tagged-word encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagLayout {
    pub discriminant_mask: u64,
    pub payload_mask: u64,
    pub shift: u32,
    pub none_sentinel: u64,
}

impl TagLayout {
    /// The `work_struct.data` encoding, from the target's own constants.
    pub fn work_data(target: &Target<'_>) -> DecodeResult<Self> {
        Ok(Self {
            discriminant_mask: target.constant("WORK_STRUCT_PWQ")?,
            payload_mask: target.constant("WORK_STRUCT_WQ_DATA_MASK")?,
            shift: target.constant("WORK_OFFQ_POOL_SHIFT")? as u32,
            none_sentinel: target.constant("WORK_OFFQ_POOL_NONE")?,
        })
    }
}

/// Bit-level reading of a tagged word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Classified {
    Pointer(Address),
    Id(u64),
    None,
}

/// Fully decoded tagged word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaggedPointer {
    DirectPointer { address: Address },
    EncodedId { id: u64, target: Address },
    Unknown,
}

pub fn classify(raw: u64, layout: &TagLayout) -> Classified {
    if raw & layout.discriminant_mask != 0 {
        return Classified::Pointer(raw & layout.payload_mask);
    }
    // a shift past the word leaves no id bits at all
    match raw.checked_shr(layout.shift) {
        Some(id) if id != layout.none_sentinel => Classified::Id(id),
        _ => Classified::None,
    }
}

/// Decode `raw`, resolving an encoded id through `index`.
///
/// An id the registry no longer holds decodes to [`TaggedPointer::Unknown`].
pub fn decode(raw: u64, layout: &TagLayout, index: &IdIndex<'_>) -> DecodeResult<TaggedPointer> {
    Ok(match classify(raw, layout) {
        Classified::Pointer(address) => TaggedPointer::DirectPointer { address },
        Classified::None => TaggedPointer::Unknown,
        Classified::Id(id) => match i64::try_from(id) {
            Ok(key) => match index.lookup(key)? {
                Some(target) => TaggedPointer::EncodedId { id, target },
                None => TaggedPointer::Unknown,
            },
            Err(_) => TaggedPointer::Unknown,
        },
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::fixtures::{self, KernelImage};

    const POOL: Address = 0xffff_8880_0000_7000;

    fn layout() -> TagLayout {
        TagLayout {
            discriminant_mask: fixtures::WORK_STRUCT_PWQ,
            payload_mask: fixtures::WORK_STRUCT_WQ_DATA_MASK,
            shift: fixtures::WORK_OFFQ_POOL_SHIFT as u32,
            none_sentinel: fixtures::WORK_OFFQ_POOL_NONE,
        }
    }

    #[test]
    fn test_layout_from_target_constants() {
        let image = KernelImage::new().finish();
        let target = Target::from_snapshot(&image);
        assert_eq!(TagLayout::work_data(&target).unwrap(), layout());
    }

    #[test]
    fn test_classify() {
        let l = layout();
        assert_eq!(classify(0x1000 | 0x4, &l), Classified::Pointer(0x1000));
        assert_eq!(classify(0x1000 | 0x4 | 0x1, &l), Classified::Pointer(0x1000));
        assert_eq!(classify(3 << 5, &l), Classified::Id(3));
        assert_eq!(classify(fixtures::WORK_OFFQ_POOL_NONE << 5, &l), Classified::None);
    }

    #[test]
    fn test_oversized_shift_classifies_as_none() {
        let l = TagLayout { shift: 64, ..layout() };
        assert_eq!(classify(0, &l), Classified::None);
        assert_eq!(classify(3 << 5, &l), Classified::None);
        // the pointer half does not depend on the shift
        assert_eq!(classify(0x1000 | 0x4, &l), Classified::Pointer(0x1000));
    }

    #[test]
    fn test_decode_resolves_ids_through_index() {
        let mut k = KernelImage::new();
        let root = k.legacy_idr(&[(3, POOL)]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
        let l = layout();

        assert_eq!(
            decode(0x1000 | 0x4, &l, &index).unwrap(),
            TaggedPointer::DirectPointer { address: 0x1000 }
        );
        assert_eq!(
            decode(3 << 5, &l, &index).unwrap(),
            TaggedPointer::EncodedId { id: 3, target: POOL }
        );
        // pool 4 has been retired
        assert_eq!(decode(4 << 5, &l, &index).unwrap(), TaggedPointer::Unknown);
        assert_eq!(
            decode(fixtures::WORK_OFFQ_POOL_NONE << 5, &l, &index).unwrap(),
            TaggedPointer::Unknown
        );
    }

    #[test]
    fn test_decode_on_32_bit_words() {
        const POOL32: Address = 0xc200_7000;
        let mut k = KernelImage::with_geometry(4, 32);
        let root = k.legacy_idr(&[(3, POOL32)]);
        let image = k.finish();
        let target = Target::from_snapshot(&image);
        let l = TagLayout::work_data(&target).unwrap();
        assert_eq!(l.none_sentinel, fixtures::work_offq_pool_none(4));
        let index = IdIndex::construct(target, root).unwrap();

        assert_eq!(
            decode(0xc300_0100 | 0x4 | 0x1, &l, &index).unwrap(),
            TaggedPointer::DirectPointer { address: 0xc300_0100 }
        );
        assert_eq!(
            decode(3 << 5, &l, &index).unwrap(),
            TaggedPointer::EncodedId { id: 3, target: POOL32 }
        );
        // the sentinel fills every bit of a 32-bit word above the shift
        assert_eq!(decode(0xffff_ffe0, &l, &index).unwrap(), TaggedPointer::Unknown);
    }

    proptest! {
        #[test]
        fn prop_discriminant_always_wins(raw in any::<u64>()) {
            let l = layout();
            let raw = raw | l.discriminant_mask;
            prop_assert_eq!(classify(raw, &l), Classified::Pointer(raw & l.payload_mask));
        }

        #[test]
        fn prop_decode_is_pure(raw in any::<u64>()) {
            let mut k = KernelImage::new();
            let root = k.legacy_idr(&[(1, POOL), (2, POOL + 0x400)]);
            let image = k.finish();
            let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
            let l = layout();
            let first = decode(raw, &l, &index).unwrap();
            prop_assert_eq!(decode(raw, &l, &index).unwrap(), first);
        }
    }
}
