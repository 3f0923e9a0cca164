//! Memory-backed intrusive list walkers.
//!
//! Three list shapes appear in the structures we decode:
//!
//! - circular doubly-linked lists (`struct list_head`): the head is embedded in
//!   the owner and the walk ends when it comes back around to the head;
//! - hash-bucket lists (`struct hlist_head`/`hlist_node`): a single `first`
//!   pointer followed by `next` links until NULL;
//! - lock-less singly-linked lists (`struct llist_head`/`llist_node`): same
//!   NULL-terminated chain, `first` then `next`.
//!
//! In all three the forward link is the first word of the node. Walkers yield
//! container addresses and hold nothing but a borrowed oracle between steps.
//! There is no cycle detection.

use snapdecode_types::{Address, DecodeError, DecodeResult};

use crate::oracle::{MemoryOracle, Scalar};

// =============================================================================
// Circular lists
// =============================================================================

/// Iterator over a circular `list_head` list.
pub struct ListIter<'a> {
    memory: &'a dyn MemoryOracle,
    head: Address,
    link_offset: u64,
    pos: Address,
    done: bool,
}

impl<'a> ListIter<'a> {
    pub fn new(memory: &'a dyn MemoryOracle, head: Address, link_offset: u64) -> Self {
        Self {
            memory,
            head,
            link_offset,
            pos: head,
            done: false,
        }
    }
}

impl Iterator for ListIter<'_> {
    type Item = DecodeResult<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match self.memory.read_typed(self.pos, Scalar::Word) {
            Ok(next) => next,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if next == self.head {
            self.done = true;
            return None;
        }
        if next == 0 {
            self.done = true;
            return Some(Err(DecodeError::CorruptList {
                head: self.head,
                at: self.pos,
            }));
        }
        self.pos = next;
        Some(Ok(next.wrapping_sub(self.link_offset)))
    }
}

// =============================================================================
// NULL-terminated chains (hlist, llist)
// =============================================================================

/// Iterator over a NULL-terminated chain starting from a `first` pointer.
pub struct ChainIter<'a> {
    memory: &'a dyn MemoryOracle,
    link_offset: u64,
    /// Address of the word holding the next link to follow.
    cursor: Address,
    done: bool,
}

impl<'a> ChainIter<'a> {
    /// Start from the head structure whose first word is the `first` pointer.
    pub fn new(memory: &'a dyn MemoryOracle, head: Address, link_offset: u64) -> Self {
        Self {
            memory,
            link_offset,
            cursor: head,
            done: false,
        }
    }
}

impl Iterator for ChainIter<'_> {
    type Item = DecodeResult<Address>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.memory.read_typed(self.cursor, Scalar::Word) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(node) => {
                self.cursor = node;
                Some(Ok(node.wrapping_sub(self.link_offset)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Lock-less list helpers
// =============================================================================

/// Iterate the entries of an `llist_head`.
pub fn llist_for_each(memory: &dyn MemoryOracle, head: Address, link_offset: u64) -> ChainIter<'_> {
    ChainIter::new(memory, head, link_offset)
}

/// Whether an `llist_head` has no entries.
pub fn llist_empty(memory: &dyn MemoryOracle, head: Address) -> DecodeResult<bool> {
    Ok(memory.read_typed(head, Scalar::Word)? == 0)
}

/// Whether an `llist_head` has exactly one entry.
pub fn llist_is_singular(memory: &dyn MemoryOracle, head: Address) -> DecodeResult<bool> {
    let first = memory.read_typed(head, Scalar::Word)?;
    if first == 0 {
        return Ok(false);
    }
    Ok(memory.read_typed(first, Scalar::Word)? == 0)
}

/// First entry of an `llist_head`, or `None` when empty.
pub fn llist_first_entry(
    memory: &dyn MemoryOracle,
    head: Address,
    link_offset: u64,
) -> DecodeResult<Option<Address>> {
    let first = memory.read_typed(head, Scalar::Word)?;
    Ok((first != 0).then(|| first.wrapping_sub(link_offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SnapshotImage;

    const HEAD: Address = 0x1000;

    /// Circular list with nodes at 0x2000, 0x3000, 0x4000, link at +0x10.
    fn circular_image() -> SnapshotImage {
        let mut image = SnapshotImage::new(8);
        image.map(0x1000, 0x4000);
        let links = [0x2010u64, 0x3010, 0x4010];
        image.write_word(HEAD, links[0]);
        image.write_word(HEAD + 8, links[2]);
        for (i, link) in links.iter().enumerate() {
            let next = links.get(i + 1).copied().unwrap_or(HEAD);
            image.write_word(*link, next);
        }
        image
    }

    #[test]
    fn test_circular_walk_yields_containers_in_order() {
        let image = circular_image();
        let nodes: Vec<Address> = ListIter::new(&image, HEAD, 0x10)
            .collect::<DecodeResult<_>>()
            .unwrap();
        assert_eq!(nodes, vec![0x2000, 0x3000, 0x4000]);
    }

    #[test]
    fn test_empty_circular_list() {
        let mut image = SnapshotImage::new(8);
        image.map(HEAD, 0x10);
        image.write_word(HEAD, HEAD);
        image.write_word(HEAD + 8, HEAD);
        assert_eq!(ListIter::new(&image, HEAD, 0).count(), 0);
    }

    #[test]
    fn test_null_link_is_corrupt() {
        let mut image = circular_image();
        image.write_word(0x3010, 0);
        let items: Vec<_> = ListIter::new(&image, HEAD, 0x10).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(
            items[2],
            Err(DecodeError::CorruptList {
                head: HEAD,
                at: 0x3010
            })
        );
    }

    #[test]
    fn test_unmapped_link_stops_walk() {
        let mut image = circular_image();
        image.write_word(0x2010, 0xdead_0000);
        let items: Vec<_> = ListIter::new(&image, HEAD, 0x10).collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], Err(DecodeError::UnreadableMemory { .. })));
    }

    #[test]
    fn test_chain_and_llist_helpers() {
        let mut image = SnapshotImage::new(8);
        image.map(0x1000, 0x3000);
        // head -> 0x2008 -> 0x3008 -> NULL, link at +8
        image.write_word(HEAD, 0x2008);
        image.write_word(0x2008, 0x3008);
        image.write_word(0x3008, 0);

        let nodes: Vec<Address> = llist_for_each(&image, HEAD, 8)
            .collect::<DecodeResult<_>>()
            .unwrap();
        assert_eq!(nodes, vec![0x2000, 0x3000]);
        assert!(!llist_empty(&image, HEAD).unwrap());
        assert!(!llist_is_singular(&image, HEAD).unwrap());
        assert_eq!(llist_first_entry(&image, HEAD, 8).unwrap(), Some(0x2000));

        image.write_word(0x2008, 0);
        assert!(llist_is_singular(&image, HEAD).unwrap());

        image.write_word(HEAD, 0);
        assert!(llist_empty(&image, HEAD).unwrap());
        assert_eq!(llist_first_entry(&image, HEAD, 8).unwrap(), None);
        assert_eq!(ChainIter::new(&image, HEAD, 8).count(), 0);
    }
}
