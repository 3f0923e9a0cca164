//! Collaborator traits and the [`Target`] bundle.
//!
//! The decoders never dereference native pointers. Everything they learn about
//! the traced system comes through four collaborators:
//!
//! - [`MemoryOracle`] - byte-level reads, symbols and exported constants
//! - [`TypeLayout`] - member presence, offsets, member types and sizes
//! - [`ListWalker`] - intrusive list traversal
//! - [`TaskTable`] - task lookup, state and stack traces
//!
//! [`Target`] bundles borrowed trait objects so that decoders can be handed a
//! single `Copy` value. When no external [`ListWalker`] is supplied, the
//! memory-backed walkers from [`crate::lists`] are used.

use snapdecode_types::encoding::format_address;
use snapdecode_types::{Address, DecodeError, DecodeResult, TaskRef};
use tracing::debug;

use crate::lists::{ChainIter, ListIter};

/// Boxed lazy sequence of container addresses produced by a list walk.
pub type AddressIter<'a> = Box<dyn Iterator<Item = DecodeResult<Address>> + 'a>;

/// Kernel type names shared by several decoders.
pub const TASK_STRUCT: &str = "struct task_struct";

// =============================================================================
// Scalar reads
// =============================================================================

/// Scalar shapes the decoder reads out of target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    /// A target machine word (`unsigned long`, pointers, `atomic_long_t`).
    Word,
}

impl Scalar {
    /// Size in bytes for a target with the given word width.
    pub fn size(self, word_size: usize) -> usize {
        match self {
            Scalar::U8 => 1,
            Scalar::U16 => 2,
            Scalar::U32 | Scalar::I32 => 4,
            Scalar::U64 | Scalar::I64 => 8,
            Scalar::Word => word_size,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Scalar::I32 | Scalar::I64)
    }
}

/// Assemble an unsigned value from raw target bytes.
fn assemble(bytes: &[u8], little_endian: bool) -> u64 {
    if little_endian {
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    } else {
        bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

/// Sign-extend the low `size` bytes of `raw`.
fn sign_extend(raw: u64, size: usize) -> i64 {
    let shift = 64 - (size as u32) * 8;
    ((raw << shift) as i64) >> shift
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Byte-level access to the snapshot.
pub trait MemoryOracle {
    /// Width of a target machine word in bytes (4 or 8).
    fn word_size(&self) -> usize;

    /// Width of the target's `int` in bits.
    fn int_bits(&self) -> u32 {
        32
    }

    fn little_endian(&self) -> bool {
        true
    }

    /// Fill `buf` from target memory at `address`.
    ///
    /// Fails with [`DecodeError::UnreadableMemory`] when any byte is unmapped.
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> DecodeResult<()>;

    /// Name of the symbol containing `address`, if any.
    fn resolve_symbol(&self, address: Address) -> Option<String>;

    /// Address of a global symbol.
    fn symbol_address(&self, name: &str) -> Option<Address>;

    /// Value of an enumerator or exported constant.
    fn constant(&self, name: &str) -> Option<u64>;

    /// Read a scalar, zero-extended to 64 bits.
    fn read_typed(&self, address: Address, ty: Scalar) -> DecodeResult<u64> {
        let word_size = self.word_size();
        if word_size != 4 && word_size != 8 {
            return Err(DecodeError::UnsupportedWordSize(word_size));
        }
        let size = ty.size(word_size);
        let mut buf = [0u8; 8];
        self.read_bytes(address, &mut buf[..size])?;
        Ok(assemble(&buf[..size], self.little_endian()))
    }

    /// Read a scalar, sign-extended to 64 bits.
    fn read_signed(&self, address: Address, ty: Scalar) -> DecodeResult<i64> {
        let raw = self.read_typed(address, ty)?;
        Ok(sign_extend(raw, ty.size(self.word_size())))
    }
}

/// Type-layout introspection of the target's type description.
pub trait TypeLayout {
    fn has_member(&self, ty: &str, member: &str) -> bool;

    /// Byte offset of `member` within `ty`.
    fn member_offset(&self, ty: &str, member: &str) -> DecodeResult<u64>;

    /// Spelled-out type of `member` (e.g. `"atomic_long_t"`).
    fn member_type(&self, ty: &str, member: &str) -> Option<String>;

    /// Element count when `member` is a fixed-size array.
    fn array_len(&self, ty: &str, member: &str) -> Option<u64>;

    fn size_of(&self, ty: &str) -> DecodeResult<u64>;
}

/// Intrusive list traversal.
///
/// Both walks yield container addresses (link address minus `link_offset`) in
/// list order and assume the list is acyclic apart from the circular head.
pub trait ListWalker {
    /// Walk a circular doubly-linked list whose head lives at `head`.
    fn walk(&self, head: Address, link_offset: u64) -> AddressIter<'_>;

    /// Walk a NULL-terminated hash-bucket list whose head lives at `head`.
    fn walk_hlist(&self, head: Address, link_offset: u64) -> AddressIter<'_>;
}

/// Task enumeration and inspection.
pub trait TaskTable {
    fn find_task(&self, pid: u32) -> Option<TaskRef>;

    /// One-letter scheduler state (`R`, `S`, `D`, ...).
    fn state_char(&self, task: &TaskRef) -> char;

    fn stack_trace(&self, pid: u32) -> DecodeResult<String>;
}

// =============================================================================
// Target
// =============================================================================

/// Borrowed view of one snapshot through its collaborators.
#[derive(Clone, Copy)]
pub struct Target<'a> {
    pub memory: &'a dyn MemoryOracle,
    pub layout: &'a dyn TypeLayout,
    pub tasks: &'a dyn TaskTable,
    lists: Option<&'a dyn ListWalker>,
}

impl<'a> Target<'a> {
    pub fn new(
        memory: &'a dyn MemoryOracle,
        layout: &'a dyn TypeLayout,
        tasks: &'a dyn TaskTable,
    ) -> Self {
        Self {
            memory,
            layout,
            tasks,
            lists: None,
        }
    }

    /// Build a target from one value implementing every collaborator.
    pub fn from_snapshot<S>(snapshot: &'a S) -> Self
    where
        S: MemoryOracle + TypeLayout + TaskTable,
    {
        Self::new(snapshot, snapshot, snapshot)
    }

    /// Route list traversal through an external walker.
    pub fn with_list_walker(mut self, lists: &'a dyn ListWalker) -> Self {
        self.lists = Some(lists);
        self
    }

    pub fn word_size(&self) -> usize {
        self.memory.word_size()
    }

    /// Address of `member` inside the `ty` instance at `base`.
    pub fn member_address(&self, base: Address, ty: &str, member: &str) -> DecodeResult<Address> {
        Ok(base.wrapping_add(self.layout.member_offset(ty, member)?))
    }

    pub fn read_member(
        &self,
        base: Address,
        ty: &str,
        member: &str,
        scalar: Scalar,
    ) -> DecodeResult<u64> {
        let addr = self.member_address(base, ty, member)?;
        self.memory.read_typed(addr, scalar)
    }

    pub fn read_signed_member(
        &self,
        base: Address,
        ty: &str,
        member: &str,
        scalar: Scalar,
    ) -> DecodeResult<i64> {
        let addr = self.member_address(base, ty, member)?;
        self.memory.read_signed(addr, scalar)
    }

    pub fn read_word(&self, address: Address) -> DecodeResult<u64> {
        self.memory.read_typed(address, Scalar::Word)
    }

    pub fn read_word_member(&self, base: Address, ty: &str, member: &str) -> DecodeResult<u64> {
        self.read_member(base, ty, member, Scalar::Word)
    }

    /// Read a NUL-terminated byte string stored inline in `ty.member`.
    pub fn read_inline_string(&self, base: Address, ty: &str, member: &str) -> DecodeResult<String> {
        let addr = self.member_address(base, ty, member)?;
        let len = self.layout.array_len(ty, member).unwrap_or(32) as usize;
        let mut buf = vec![0u8; len];
        self.memory.read_bytes(addr, &mut buf)?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    pub fn walk_list(&self, head: Address, link_offset: u64) -> AddressIter<'a> {
        match self.lists {
            Some(walker) => walker.walk(head, link_offset),
            None => Box::new(ListIter::new(self.memory, head, link_offset)),
        }
    }

    pub fn walk_hlist(&self, head: Address, link_offset: u64) -> AddressIter<'a> {
        match self.lists {
            Some(walker) => walker.walk_hlist(head, link_offset),
            None => Box::new(ChainIter::new(self.memory, head, link_offset)),
        }
    }

    /// Walk the circular list headed at `ty.head_member` of `base`, yielding
    /// `entry_ty` containers linked through `entry_ty.link_member`.
    pub fn walk_member_list(
        &self,
        base: Address,
        ty: &str,
        head_member: &str,
        entry_ty: &str,
        link_member: &str,
    ) -> DecodeResult<AddressIter<'a>> {
        let head = self.member_address(base, ty, head_member)?;
        let link_offset = self.layout.member_offset(entry_ty, link_member)?;
        Ok(self.walk_list(head, link_offset))
    }

    /// Whether the circular list headed at `head` is empty.
    pub fn list_empty(&self, head: Address) -> DecodeResult<bool> {
        Ok(self.read_word(head)? == head)
    }

    pub fn symbol(&self, name: &str) -> DecodeResult<Address> {
        self.memory
            .symbol_address(name)
            .ok_or_else(|| DecodeError::MissingSymbol(name.to_string()))
    }

    pub fn constant(&self, name: &str) -> DecodeResult<u64> {
        self.memory
            .constant(name)
            .ok_or_else(|| DecodeError::MissingConstant(name.to_string()))
    }

    /// Exported constant, or `fallback` when the target does not export it.
    pub fn constant_or(&self, name: &str, fallback: u64) -> u64 {
        match self.memory.constant(name) {
            Some(value) => value,
            None => {
                debug!(constant = name, fallback, "constant not exported, using fallback");
                fallback
            }
        }
    }

    /// Resolve a task descriptor address to a [`TaskRef`].
    ///
    /// A negative `pid_t` is reported as [`DecodeError::InvalidPid`].
    pub fn task_at(&self, address: Address) -> DecodeResult<TaskRef> {
        let pid = self.read_signed_member(address, TASK_STRUCT, "pid", Scalar::I32)?;
        let pid = u32::try_from(pid).map_err(|_| DecodeError::InvalidPid { task: address, pid })?;
        Ok(TaskRef::new(address, pid))
    }

    /// Symbol name for a function address, or its hex form.
    pub fn function_name(&self, address: Address) -> String {
        self.memory
            .resolve_symbol(address)
            .unwrap_or_else(|| format_address(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_endianness() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(assemble(&bytes, true), 0x0403_0201);
        assert_eq!(assemble(&bytes, false), 0x0102_0304);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xffff_ffff, 4), -1);
        assert_eq!(sign_extend(0x7fff_ffff, 4), i32::MAX as i64);
        assert_eq!(sign_extend(0x80, 1), -128);
        assert_eq!(sign_extend(u64::MAX, 8), -1);
    }

    #[test]
    fn test_scalar_sizes_follow_word_width() {
        assert_eq!(Scalar::Word.size(4), 4);
        assert_eq!(Scalar::Word.size(8), 8);
        assert_eq!(Scalar::I32.size(8), 4);
        assert!(Scalar::I64.is_signed());
        assert!(!Scalar::Word.is_signed());
    }

    #[test]
    fn test_task_at_rejects_negative_pid() {
        let mut k = crate::fixtures::KernelImage::new();
        let task = k.task(77, 'S', &[]);
        let corrupt = k.task(78, 'S', &[]);
        let pid_at = k.image().member_offset(TASK_STRUCT, "pid").unwrap();
        k.image_mut().write_i32(corrupt + pid_at, -1);
        let image = k.finish();
        let target = Target::from_snapshot(&image);

        assert_eq!(target.task_at(task).unwrap(), TaskRef::new(task, 77));
        assert_eq!(
            target.task_at(corrupt),
            Err(DecodeError::InvalidPid {
                task: corrupt,
                pid: -1
            })
        );
    }
}
