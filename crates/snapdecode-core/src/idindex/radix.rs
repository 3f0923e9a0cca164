//! Radix-tree backed IDR (`idr_rt`).
//!
//! Two encodings of the same tree exist. The xarray form (`struct xarray` with
//! `xa_head`, nodes of type `struct xa_node`) tags internal node pointers with
//! `0b10`; the older radix-tree form (`struct radix_tree_root` with `rnode`,
//! nodes of type `struct radix_tree_node`) tags them with `0b01`. Either way a
//! node carries its `shift` and a fixed array of `slots`, and a head that is
//! not a node is the single entry for index 0.

use smallvec::SmallVec;
use snapdecode_types::{Address, DecodeError, DecodeResult};

use crate::oracle::{Scalar, Target};
use crate::probe::require_first_present;

/// Internal entries at or below this value are retry/sibling markers.
const INTERNAL_LIMIT: u64 = 4096;

const DEFAULT_CHUNK: u64 = 64;

#[derive(Clone, Copy)]
pub struct RadixTree<'a> {
    target: Target<'a>,
    root: Address,
    head: u64,
    node_ty: &'static str,
    internal_tag: u64,
    shift_offset: u64,
    slots_offset: u64,
    chunk: u64,
}

impl<'a> RadixTree<'a> {
    /// Read the tree rooted at `root`, a value of type `root_ty`.
    pub fn construct(target: Target<'a>, root: Address, root_ty: &str) -> DecodeResult<Self> {
        let head_member = require_first_present(target.layout, root_ty, &["xa_head", "rnode"])?;
        let (node_ty, internal_tag) = match head_member {
            "xa_head" => ("struct xa_node", 2),
            _ => ("struct radix_tree_node", 1),
        };
        let head = target.read_word_member(root, root_ty, head_member)?;
        let chunk = target
            .layout
            .array_len(node_ty, "slots")
            .filter(|n| n.is_power_of_two() && *n > 1)
            .unwrap_or(DEFAULT_CHUNK);

        Ok(Self {
            target,
            root,
            head,
            node_ty,
            internal_tag,
            shift_offset: target.layout.member_offset(node_ty, "shift")?,
            slots_offset: target.layout.member_offset(node_ty, "slots")?,
            chunk,
        })
    }

    pub fn root(&self) -> Address {
        self.root
    }

    fn is_internal(&self, entry: u64) -> bool {
        entry & 3 == self.internal_tag
    }

    fn as_node(&self, entry: u64) -> Option<Address> {
        (self.is_internal(entry) && entry > INTERNAL_LIMIT).then(|| entry - self.internal_tag)
    }

    fn as_value(&self, entry: u64) -> Option<Address> {
        (entry != 0 && !self.is_internal(entry)).then_some(entry)
    }

    /// Read a node's shift; it must be a whole number of slot levels below 64.
    fn read_shift(&self, node: Address) -> DecodeResult<u32> {
        let shift = self.target.memory.read_typed(node + self.shift_offset, Scalar::U8)? as u32;
        if shift >= u64::BITS || shift % self.chunk.trailing_zeros() != 0 {
            return Err(DecodeError::MalformedIndex {
                root: self.root,
                reason: format!(
                    "{} at 0x{:x} has shift {} (slot width {} bits)",
                    self.node_ty,
                    node,
                    shift,
                    self.chunk.trailing_zeros()
                ),
            });
        }
        Ok(shift)
    }

    fn read_slot(&self, node: Address, slot: u64) -> DecodeResult<u64> {
        let word = self.target.word_size() as u64;
        self.target.read_word(node + self.slots_offset + slot * word)
    }

    fn check_child_shift(&self, node: Address, parent: u32, child: u32) -> DecodeResult<()> {
        if child >= parent {
            return Err(DecodeError::MalformedIndex {
                root: self.root,
                reason: format!(
                    "{} at 0x{:x} has shift {} under parent shift {}",
                    self.node_ty, node, child, parent
                ),
            });
        }
        Ok(())
    }

    pub fn lookup(&self, index: u64) -> DecodeResult<Option<Address>> {
        let Some(mut node) = self.as_node(self.head) else {
            return Ok(if index == 0 { self.as_value(self.head) } else { None });
        };
        let mut shift = self.read_shift(node)?;
        let span_bits = shift + self.chunk.trailing_zeros();
        if span_bits < 64 && index >> span_bits != 0 {
            return Ok(None);
        }

        loop {
            let slot = (index >> shift) & (self.chunk - 1);
            let entry = self.read_slot(node, slot)?;
            match self.as_node(entry) {
                Some(child) => {
                    let child_shift = self.read_shift(child)?;
                    self.check_child_shift(child, shift, child_shift)?;
                    node = child;
                    shift = child_shift;
                }
                None => return Ok(self.as_value(entry)),
            }
        }
    }

    pub fn iter(&self) -> RadixIter<'a> {
        let mut iter = RadixIter {
            tree: *self,
            stack: SmallVec::new(),
            single: None,
            failed: false,
        };
        match self.as_node(self.head) {
            Some(node) => match self.read_shift(node) {
                Ok(shift) => iter.stack.push(Frame {
                    node,
                    shift,
                    base: 0,
                    next_slot: 0,
                }),
                Err(e) => iter.single = Some(Err(e)),
            },
            None => iter.single = self.as_value(self.head).map(|entry| Ok((0, entry))),
        }
        iter
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: Address,
    shift: u32,
    base: u64,
    next_slot: u64,
}

/// Depth-first, ascending walk over a [`RadixTree`].
pub struct RadixIter<'a> {
    tree: RadixTree<'a>,
    stack: SmallVec<[Frame; 8]>,
    single: Option<DecodeResult<(u64, Address)>>,
    failed: bool,
}

impl RadixIter<'_> {
    fn fail(&mut self, err: DecodeError) -> Option<DecodeResult<(u64, Address)>> {
        self.failed = true;
        self.stack.clear();
        Some(Err(err))
    }
}

impl Iterator for RadixIter<'_> {
    type Item = DecodeResult<(u64, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.single.take() {
            return Some(item);
        }
        if self.failed {
            return None;
        }
        loop {
            let frame = self.stack.last_mut()?;
            if frame.next_slot == self.tree.chunk {
                self.stack.pop();
                continue;
            }
            let Frame {
                node, shift, base, ..
            } = *frame;
            let slot = frame.next_slot;
            frame.next_slot += 1;
            let index = base + (slot << shift);

            let entry = match self.tree.read_slot(node, slot) {
                Ok(entry) => entry,
                Err(e) => return self.fail(e),
            };
            if let Some(child) = self.tree.as_node(entry) {
                let child_shift = match self.tree.read_shift(child) {
                    Ok(s) => s,
                    Err(e) => return self.fail(e),
                };
                if let Err(e) = self.tree.check_child_shift(child, shift, child_shift) {
                    return self.fail(e);
                }
                self.stack.push(Frame {
                    node: child,
                    shift: child_shift,
                    base: index,
                    next_slot: 0,
                });
                continue;
            }
            if let Some(value) = self.tree.as_value(entry) {
                return Some(Ok((index, value)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{KernelImage, RadixFlavor};

    const P: Address = 0xffff_8880_0000_2000;
    const Q: Address = 0xffff_8880_0000_5000;

    fn tree_with_top_shift(flavor: RadixFlavor, shift: u8) -> (crate::image::SnapshotImage, Address) {
        let mut k = KernelImage::new();
        let root = k.modern_idr_with(flavor, 0, &[(1, P), (200, Q)]);
        let top = k.modern_top_node(root, flavor).unwrap();
        k.set_radix_shift(top, flavor, shift);
        (k.finish(), root)
    }

    #[test]
    fn test_shift_past_word_is_malformed() {
        for flavor in [RadixFlavor::XArray, RadixFlavor::RadixTree] {
            let (image, root) = tree_with_top_shift(flavor, 70);
            let target = Target::from_snapshot(&image);
            let root_ty = target.layout.member_type("struct idr", "idr_rt").unwrap();
            let tree = RadixTree::construct(target, root, &root_ty).unwrap();

            assert!(matches!(
                tree.lookup(5),
                Err(DecodeError::MalformedIndex { root: r, .. }) if r == root
            ));
            let mut iter = tree.iter();
            assert!(matches!(iter.next(), Some(Err(DecodeError::MalformedIndex { .. }))));
            assert!(iter.next().is_none());
        }
    }

    #[test]
    fn test_shift_off_slot_boundary_is_malformed() {
        let (image, root) = tree_with_top_shift(RadixFlavor::XArray, 7);
        let target = Target::from_snapshot(&image);
        let tree = RadixTree::construct(target, root, "struct xarray").unwrap();
        assert!(tree.lookup(200).is_err());
        assert!(tree.iter().any(|entry| entry.is_err()));
    }

    #[test]
    fn test_well_formed_tree_walks() {
        let (image, root) = tree_with_top_shift(RadixFlavor::XArray, 6);
        let target = Target::from_snapshot(&image);
        let tree = RadixTree::construct(target, root, "struct xarray").unwrap();
        assert_eq!(tree.lookup(200).unwrap(), Some(Q));
        let walked: Vec<_> = tree.iter().collect::<DecodeResult<_>>().unwrap();
        assert_eq!(walked, vec![(1, P), (200, Q)]);
    }
}
