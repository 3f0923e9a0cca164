//! Sparse integer-keyed registry (`struct idr`) decoding.
//!
//! Two historical encodings exist and are told apart once, at construction,
//! by probing `struct idr` for the `idr_rt` member:
//!
//! - [`Legacy`](IdIndex::Legacy): a layered radix-256 trie, see [`legacy`]
//! - [`Modern`](IdIndex::Modern): a radix tree / xarray plus a constant
//!   `idr_base`, see [`radix`]
//!
//! Both answer the same two questions: which pointer is registered under an
//! id, and which `(id, pointer)` pairs exist, in ascending id order.
//!
//! ```ignore
//! let pools = IdIndex::from_symbol(target, "worker_pool_idr")?;
//! for entry in pools.iter() {
//!     let (id, pool) = entry?;
//!     println!("{id}: 0x{pool:x}");
//! }
//! ```

pub mod legacy;
pub mod radix;

use serde::Serialize;
use snapdecode_types::{Address, DecodeResult};
use tracing::debug;

use crate::oracle::Target;

pub use legacy::{IndexNode, LegacyIdr, LegacyIter};
pub use radix::{RadixIter, RadixTree};

pub(crate) const IDR: &str = "struct idr";

/// Which encoding an [`IdIndex`] decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Legacy,
    Modern,
}

/// Radix tree plus the `idr_base` offset added to every stored index.
pub struct ModernIdr<'a> {
    tree: RadixTree<'a>,
    base: u64,
    max_id: u64,
}

impl<'a> ModernIdr<'a> {
    fn construct(target: Target<'a>, root: Address) -> DecodeResult<Self> {
        let rt_ty = target
            .layout
            .member_type(IDR, "idr_rt")
            .unwrap_or_else(|| "struct xarray".to_string());
        let rt = target.member_address(root, IDR, "idr_rt")?;
        let tree = RadixTree::construct(target, rt, &rt_ty)?;
        let base = if target.layout.has_member(IDR, "idr_base") {
            target.read_member(root, IDR, "idr_base", crate::oracle::Scalar::U32)?
        } else {
            0
        };
        let max_id = (1u64 << legacy::max_id_shift(target.memory.int_bits())) - 1;
        Ok(Self { tree, base, max_id })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    fn lookup(&self, id: i64) -> DecodeResult<Option<Address>> {
        if id < 0 {
            return Ok(None);
        }
        let id = id as u64;
        if id < self.base || id > self.max_id {
            return Ok(None);
        }
        self.tree.lookup(id - self.base)
    }
}

/// An ID registry rooted at one `struct idr`.
pub enum IdIndex<'a> {
    Legacy(LegacyIdr<'a>),
    Modern(ModernIdr<'a>),
}

impl<'a> IdIndex<'a> {
    /// Decode the `struct idr` at `root`.
    pub fn construct(target: Target<'a>, root: Address) -> DecodeResult<Self> {
        let index = if target.layout.has_member(IDR, "idr_rt") {
            IdIndex::Modern(ModernIdr::construct(target, root)?)
        } else {
            IdIndex::Legacy(LegacyIdr::construct(target, root)?)
        };
        debug!(
            root = format_args!("0x{:x}", root),
            mode = ?index.mode(),
            "idr encoding selected"
        );
        Ok(index)
    }

    /// Decode the `struct idr` stored in global `symbol`.
    pub fn from_symbol(target: Target<'a>, symbol: &str) -> DecodeResult<Self> {
        Self::construct(target, target.symbol(symbol)?)
    }

    pub fn mode(&self) -> IndexMode {
        match self {
            IdIndex::Legacy(_) => IndexMode::Legacy,
            IdIndex::Modern(_) => IndexMode::Modern,
        }
    }

    pub fn root(&self) -> Address {
        match self {
            IdIndex::Legacy(idr) => idr.root(),
            IdIndex::Modern(idr) => idr.tree.root(),
        }
    }

    /// Largest id this registry can hold.
    pub fn max_id(&self) -> u64 {
        match self {
            IdIndex::Legacy(idr) => idr.max_id(),
            IdIndex::Modern(idr) => idr.max_id,
        }
    }

    /// Pointer registered under `id`, or `None`.
    ///
    /// Negative and out-of-range ids are simply absent.
    pub fn lookup(&self, id: i64) -> DecodeResult<Option<Address>> {
        match self {
            IdIndex::Legacy(idr) => idr.lookup(id),
            IdIndex::Modern(idr) => idr.lookup(id),
        }
    }

    /// All `(id, pointer)` pairs in ascending id order.
    ///
    /// Every call starts a fresh traversal.
    pub fn iter(&self) -> IdIter<'_> {
        match self {
            IdIndex::Legacy(idr) => IdIter::Legacy(idr.iter()),
            IdIndex::Modern(idr) => IdIter::Modern {
                inner: idr.tree.iter(),
                base: idr.base,
            },
        }
    }

    /// Structural check of the root metadata.
    ///
    /// Lookups on a malformed legacy trie return `None`; this is where the
    /// reason is reported.
    pub fn validate(&self) -> DecodeResult<()> {
        match self {
            IdIndex::Legacy(idr) => idr.validate(),
            IdIndex::Modern(_) => Ok(()),
        }
    }
}

pub enum IdIter<'i> {
    Legacy(LegacyIter<'i>),
    Modern { inner: RadixIter<'i>, base: u64 },
}

impl Iterator for IdIter<'_> {
    type Item = DecodeResult<(u64, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IdIter::Legacy(inner) => inner.next(),
            IdIter::Modern { inner, base } => {
                let base = *base;
                inner
                    .next()
                    .map(|item| item.map(|(index, entry)| (index + base, entry)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use snapdecode_types::DecodeError;

    use super::*;
    use crate::fixtures::KernelImage;

    const P2: Address = 0xffff_8880_0000_2000;
    const P5: Address = 0xffff_8880_0000_5000;
    const P9: Address = 0xffff_8880_0000_9000;

    fn collect(index: &IdIndex<'_>) -> Vec<(u64, Address)> {
        index.iter().collect::<DecodeResult<_>>().unwrap()
    }

    #[test]
    fn test_legacy_single_layer() {
        let mut k = KernelImage::new();
        let root = k.legacy_idr(&[(2, P2), (5, P5), (9, P9)]);
        let image = k.finish();
        let target = Target::from_snapshot(&image);

        let index = IdIndex::construct(target, root).unwrap();
        assert_eq!(index.mode(), IndexMode::Legacy);
        assert_eq!(index.max_id(), 255);
        assert_eq!(index.lookup(5).unwrap(), Some(P5));
        assert_eq!(index.lookup(6).unwrap(), None);
        assert_eq!(index.lookup(-1).unwrap(), None);
        assert_eq!(index.lookup(256).unwrap(), None);
        assert_eq!(collect(&index), vec![(2, P2), (5, P5), (9, P9)]);
        // restartable
        assert_eq!(collect(&index), vec![(2, P2), (5, P5), (9, P9)]);
        index.validate().unwrap();
    }

    #[test]
    fn test_legacy_multi_layer_skips_empty_subtrees() {
        let mut k = KernelImage::new();
        let ids = [(1, P2), (300, P5), (70_000, P9)];
        let root = k.legacy_idr(&ids);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

        assert_eq!(index.max_id(), (1 << 24) - 1);
        assert_eq!(collect(&index), ids.to_vec());
        assert_eq!(index.lookup(300).unwrap(), Some(P5));
        assert_eq!(index.lookup(70_000).unwrap(), Some(P9));
        assert_eq!(index.lookup(70_001).unwrap(), None);
        assert_eq!(index.lookup(299).unwrap(), None);
    }

    #[test]
    fn test_legacy_empty_tree() {
        let mut k = KernelImage::new();
        let root = k.legacy_idr(&[]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
        assert_eq!(index.lookup(0).unwrap(), None);
        assert!(collect(&index).is_empty());
    }

    #[test]
    fn test_legacy_hint_only_used_for_matching_prefix() {
        let mut k = KernelImage::new();
        let root = k.legacy_idr(&[(5, P5), (300, P9)]);
        // hint points at the leaf for ids 0..256
        let first_leaf = k.legacy_leaf_for(root, 5);
        k.set_legacy_hint(root, first_leaf);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

        assert_eq!(index.lookup(300).unwrap(), Some(P9));
        assert_eq!(index.lookup(5).unwrap(), Some(P5));
        assert_eq!(index.lookup(44).unwrap(), None);
        assert_eq!(index.lookup(301).unwrap(), None);
    }

    #[test]
    fn test_legacy_malformed_layer_count() {
        let mut k = KernelImage::new();
        let root = k.legacy_idr(&[(5, P5)]);
        k.set_legacy_top_layer(root, 9);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

        assert_eq!(index.lookup(5).unwrap(), None);
        assert!(collect(&index).is_empty());
        assert!(matches!(
            index.validate(),
            Err(DecodeError::MalformedIndex { root: r, .. }) if r == root
        ));
    }

    #[test]
    fn test_modern_with_base() {
        let mut k = KernelImage::new();
        let root = k.modern_idr(1, &[(1, P2), (2, P5), (200, P9)]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

        assert_eq!(index.mode(), IndexMode::Modern);
        assert_eq!(index.lookup(0).unwrap(), None);
        assert_eq!(index.lookup(1).unwrap(), Some(P2));
        assert_eq!(index.lookup(200).unwrap(), Some(P9));
        assert_eq!(index.lookup(3).unwrap(), None);
        assert_eq!(collect(&index), vec![(1, P2), (2, P5), (200, P9)]);
    }

    #[test]
    fn test_modern_single_entry_at_head() {
        let mut k = KernelImage::new();
        let root = k.modern_idr(0, &[(0, P2)]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
        assert_eq!(index.lookup(0).unwrap(), Some(P2));
        assert_eq!(index.lookup(1).unwrap(), None);
        assert_eq!(collect(&index), vec![(0, P2)]);
    }

    #[test]
    fn test_modern_empty() {
        let mut k = KernelImage::new();
        let root = k.modern_idr(0, &[]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
        assert_eq!(index.lookup(0).unwrap(), None);
        assert!(collect(&index).is_empty());
    }

    #[test]
    fn test_32_bit_layouts() {
        const A: Address = 0xc200_1000;
        const B: Address = 0xc200_2000;
        let mut k = KernelImage::with_geometry(4, 32);
        let legacy = k.legacy_idr(&[(3, A), (300, B)]);
        let modern = k.modern_idr(1, &[(1, A), (200, B)]);
        let image = k.finish();
        let target = Target::from_snapshot(&image);

        let index = IdIndex::construct(target, legacy).unwrap();
        assert_eq!(index.mode(), IndexMode::Legacy);
        assert_eq!(index.max_id(), 65535);
        assert_eq!(index.lookup(300).unwrap(), Some(B));
        assert_eq!(index.lookup(4).unwrap(), None);
        assert_eq!(collect(&index), vec![(3, A), (300, B)]);
        index.validate().unwrap();

        let index = IdIndex::construct(target, modern).unwrap();
        assert_eq!(index.mode(), IndexMode::Modern);
        assert_eq!(index.lookup(1).unwrap(), Some(A));
        assert_eq!(index.lookup(200).unwrap(), Some(B));
        assert_eq!(collect(&index), vec![(1, A), (200, B)]);
    }

    #[test]
    fn test_narrow_int_caps_legacy_depth() {
        let mut k = KernelImage::with_geometry(4, 16);
        let root = k.legacy_idr(&[(1, P2), (300, P5)]);
        let image = k.finish();
        let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();
        assert_eq!(index.max_id(), (1 << 15) - 1);
        assert_eq!(index.lookup(300).unwrap(), Some(P5 & 0xffff_ffff));
    }

    #[test]
    fn test_out_of_range_int_width_does_not_overflow() {
        for int_bits in [0, 80] {
            let mut k = KernelImage::new();
            let legacy = k.legacy_idr(&[(5, P5)]);
            let modern = k.modern_idr(0, &[(5, P5)]);
            k.image_mut().set_int_bits(int_bits);
            let image = k.finish();
            let target = Target::from_snapshot(&image);

            for root in [legacy, modern] {
                let index = IdIndex::construct(target, root).unwrap();
                assert!(index.max_id() < 1 << 63);
                let _ = index.lookup(5);
                let _ = index.iter().count();
            }
        }
    }

    fn entries() -> impl Strategy<Value = Vec<(u64, Address)>> {
        prop::collection::btree_set(0u64..100_000, 0..24).prop_map(|ids| {
            ids.into_iter()
                .map(|id| (id, 0xffff_8880_1000_0000 + id * 0x40))
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_legacy_lookup_and_iter_agree(ids in entries(), wanted in 0u64..100_000) {
            let mut k = KernelImage::new();
            let root = k.legacy_idr(&ids);
            let image = k.finish();
            let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

            let walked = collect(&index);
            prop_assert_eq!(&walked, &ids);
            for (id, ptr) in &ids {
                prop_assert_eq!(index.lookup(*id as i64).unwrap(), Some(*ptr));
            }
            let expected = ids.iter().find(|(id, _)| *id == wanted).map(|(_, p)| *p);
            prop_assert_eq!(index.lookup(wanted as i64).unwrap(), expected);
        }

        #[test]
        fn prop_modern_lookup_and_iter_agree(ids in entries(), base in 0u64..2) {
            let ids: Vec<_> = ids.into_iter().filter(|(id, _)| *id >= base).collect();
            let mut k = KernelImage::new();
            let root = k.modern_idr(base, &ids);
            let image = k.finish();
            let index = IdIndex::construct(Target::from_snapshot(&image), root).unwrap();

            let walked = collect(&index);
            prop_assert!(walked.windows(2).all(|w| w[0].0 < w[1].0));
            prop_assert_eq!(&walked, &ids);
            for (id, ptr) in &ids {
                prop_assert_eq!(index.lookup(*id as i64).unwrap(), Some(*ptr));
            }
        }
    }
}
