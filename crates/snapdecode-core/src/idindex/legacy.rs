//! Legacy layered IDR: a fixed-radix-256 array trie.
//!
//! `struct idr` points at a top `struct idr_layer`; every layer holds 256 child
//! slots in `ary` and its own height in `layer` (0 for leaves). An id is split
//! into 8-bit slices, most significant first, one per layer. Leaves store the
//! registered pointers directly.
//!
//! Some builds also keep `idr.hint`, the last leaf touched, together with each
//! layer's `prefix` (the id bits above the leaf slice). The hint is only ever a
//! shortcut: it is accepted after its prefix and level are checked against the
//! requested id, and a rejected hint falls back to full descent.

use std::cell::Cell;

use snapdecode_types::{Address, DecodeError, DecodeResult};
use tracing::{debug, trace};

use crate::oracle::{Scalar, Target};

use super::IDR;

pub const IDR_BITS: u32 = 8;
pub const IDR_MASK: u64 = (1 << IDR_BITS) - 1;

const IDR_LAYER: &str = "struct idr_layer";

// =============================================================================
// Pure helpers
// =============================================================================

/// Widest id shift representable in the target's `int`. Widths outside
/// `1..=64` are clamped so the result is always a valid `u64` shift.
pub fn max_id_shift(int_bits: u32) -> u32 {
    int_bits.clamp(1, 64) - 1
}

/// Deepest trie the target can build.
pub fn max_level(int_bits: u32) -> u32 {
    (max_id_shift(int_bits) + IDR_BITS - 1) / IDR_BITS
}

/// Largest id a trie of `layers` levels can hold.
pub fn idr_max(int_bits: u32, layers: u32) -> u64 {
    let bits = (layers * IDR_BITS).min(max_id_shift(int_bits));
    (1u64 << bits) - 1
}

/// Smallest id past the empty subtree containing `id`.
///
/// A NULL child whose subtree spans `2^span_bits` ids rules out every id up to
/// the end of that span, so the next probe starts at the following multiple
/// of the span.
pub fn advance_past_hole(id: u64, span_bits: u32) -> u64 {
    let span = 1u64 << span_bits;
    (id + 1).div_ceil(span) * span
}

// =============================================================================
// Nodes
// =============================================================================

/// One `struct idr_layer` as read from the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexNode {
    pub address: Address,
    /// Height above the leaves (0 for a leaf).
    pub level: i64,
    /// Id bits above this layer's slice, when the build records them.
    pub prefix: Option<u64>,
}

impl IndexNode {
    pub fn read(target: &Target<'_>, address: Address) -> DecodeResult<Self> {
        let level = target.read_signed_member(address, IDR_LAYER, "layer", Scalar::I32)?;
        let prefix = if target.layout.has_member(IDR_LAYER, "prefix") {
            Some(target.read_member(address, IDR_LAYER, "prefix", Scalar::U32)?)
        } else {
            None
        };
        Ok(Self {
            address,
            level,
            prefix,
        })
    }
}

/// Outcome of descending towards one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descent {
    /// The id is populated; `leaf` is the layer holding it.
    Found { entry: Address, leaf: Address },
    /// A NULL child covering `2^span_bits` ids was met.
    Hole { span_bits: u32 },
}

#[derive(Debug, Clone, Copy)]
struct LeafHint {
    prefix: u64,
    leaf: Address,
}

// =============================================================================
// LegacyIdr
// =============================================================================

pub struct LegacyIdr<'a> {
    target: Target<'a>,
    root: Address,
    top: Address,
    layers: u32,
    max_id: u64,
    malformed: Option<String>,
    ary_offset: u64,
    hint: Cell<Option<LeafHint>>,
}

impl<'a> LegacyIdr<'a> {
    pub fn construct(target: Target<'a>, root: Address) -> DecodeResult<Self> {
        let int_bits = target.memory.int_bits();
        let ary_offset = target.layout.member_offset(IDR_LAYER, "ary")?;
        let top = target.read_word_member(root, IDR, "top")?;

        let mut layers = 0;
        let mut malformed = None;
        if top != 0 {
            let node = IndexNode::read(&target, top)?;
            if node.level < 0 || node.level + 1 > i64::from(max_level(int_bits)) {
                malformed = Some(format!(
                    "top layer {} outside 0..{}",
                    node.level,
                    max_level(int_bits)
                ));
            } else {
                layers = node.level as u32 + 1;
            }
        }
        if let Some(reason) = &malformed {
            debug!(root = format_args!("0x{:x}", root), %reason, "legacy idr is malformed");
        }

        let index = Self {
            target,
            root,
            top,
            layers,
            max_id: idr_max(int_bits, layers),
            malformed,
            ary_offset,
            hint: Cell::new(None),
        };
        index.hint.set(index.read_target_hint()?);
        Ok(index)
    }

    /// The `idr.hint` leaf recorded by the target, if it is usable at all.
    fn read_target_hint(&self) -> DecodeResult<Option<LeafHint>> {
        if !self.target.layout.has_member(IDR, "hint") {
            return Ok(None);
        }
        let leaf = self.target.read_word_member(self.root, IDR, "hint")?;
        if leaf == 0 {
            return Ok(None);
        }
        let node = IndexNode::read(&self.target, leaf)?;
        Ok(match (node.level, node.prefix) {
            (0, Some(prefix)) => Some(LeafHint { prefix, leaf }),
            _ => None,
        })
    }

    pub fn root(&self) -> Address {
        self.root
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn max_id(&self) -> u64 {
        self.max_id
    }

    pub fn validate(&self) -> DecodeResult<()> {
        match &self.malformed {
            Some(reason) => Err(DecodeError::MalformedIndex {
                root: self.root,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn usable(&self) -> bool {
        self.top != 0 && self.malformed.is_none()
    }

    fn read_slot(&self, layer: Address, slot: u64) -> DecodeResult<Address> {
        let word = self.target.word_size() as u64;
        self.target.read_word(layer + self.ary_offset + slot * word)
    }

    /// Descend from `node`, which still has `bits` id bits to consume.
    pub fn descend(&self, node: Address, id: u64, bits: u32) -> DecodeResult<Descent> {
        let shift = bits - IDR_BITS;
        let child = self.read_slot(node, (id >> shift) & IDR_MASK)?;
        if child == 0 {
            return Ok(Descent::Hole { span_bits: shift });
        }
        if shift == 0 {
            return Ok(Descent::Found {
                entry: child,
                leaf: node,
            });
        }
        self.descend(child, id, shift)
    }

    pub fn lookup(&self, id: i64) -> DecodeResult<Option<Address>> {
        if id < 0 || !self.usable() {
            return Ok(None);
        }
        let id = id as u64;
        if id > self.max_id {
            return Ok(None);
        }

        let prefix = id & !IDR_MASK;
        if let Some(hint) = self.hint.get() {
            if hint.prefix == prefix {
                trace!(id, leaf = format_args!("0x{:x}", hint.leaf), "idr hint accepted");
                let entry = self.read_slot(hint.leaf, id & IDR_MASK)?;
                return Ok((entry != 0).then_some(entry));
            }
            trace!(id, hint_prefix = hint.prefix, "idr hint rejected");
        }

        match self.descend(self.top, id, self.layers * IDR_BITS)? {
            Descent::Found { entry, leaf } => {
                self.hint.set(Some(LeafHint { prefix, leaf }));
                Ok(Some(entry))
            }
            Descent::Hole { .. } => Ok(None),
        }
    }

    /// Smallest populated id `>= from`.
    pub fn next_populated(&self, from: u64) -> DecodeResult<Option<(u64, Address)>> {
        if !self.usable() {
            return Ok(None);
        }
        let mut id = from;
        while id <= self.max_id {
            match self.descend(self.top, id, self.layers * IDR_BITS)? {
                Descent::Found { entry, .. } => return Ok(Some((id, entry))),
                Descent::Hole { span_bits } => id = advance_past_hole(id, span_bits),
            }
        }
        Ok(None)
    }

    pub fn iter(&self) -> LegacyIter<'_> {
        LegacyIter {
            index: self,
            next: Some(0),
        }
    }
}

/// Ascending walk over a [`LegacyIdr`].
pub struct LegacyIter<'i> {
    index: &'i LegacyIdr<'i>,
    next: Option<u64>,
}

impl Iterator for LegacyIter<'_> {
    type Item = DecodeResult<(u64, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next.take()?;
        match self.index.next_populated(from) {
            Ok(Some((id, entry))) => {
                self.next = id.checked_add(1);
                Some(Ok((id, entry)))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
