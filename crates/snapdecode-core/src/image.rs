//! In-memory snapshot image.
//!
//! [`SnapshotImage`] is a self-contained snapshot: sparse memory pages, a type
//! description, symbols, exported constants and a task table. It implements
//! [`MemoryOracle`], [`TypeLayout`] and [`TaskTable`], so a
//! [`Target`](crate::oracle::Target) can be built straight from it.
//!
//! Images round-trip through JSON. Memory is stored as hex-encoded segments;
//! hand-written files may use any segment base and length, which are split
//! into pages on load.
//!
//! ```json
//! {
//!   "word_size": 8,
//!   "segments": [{ "base": 4096, "bytes": "0010000000000000" }],
//!   "types": [{ "name": "struct idr", "size": 40, "members": [] }],
//!   "symbols": [{ "name": "worker_pool_idr", "address": 4096 }],
//!   "constants": { "WORK_STRUCT_PWQ": 4 },
//!   "tasks": [{ "address": 8192, "pid": 17, "state": "D" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snapdecode_types::{Address, DecodeError, DecodeResult, TaskRef};

use crate::oracle::{MemoryOracle, TaskTable, TypeLayout};

const PAGE_SIZE: u64 = 4096;

fn default_word_size() -> usize {
    8
}

fn default_int_bits() -> u32 {
    32
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Descriptors
// =============================================================================

/// One member of a described type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDesc {
    pub name: String,
    pub offset: u64,
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_len: Option<u64>,
}

impl MemberDesc {
    pub fn new(name: &str, offset: u64, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            offset,
            type_name: type_name.to_string(),
            array_len: None,
        }
    }

    pub fn array(mut self, len: u64) -> Self {
        self.array_len = Some(len);
        self
    }
}

/// A described aggregate type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDesc {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub members: Vec<MemberDesc>,
}

impl TypeDesc {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            members: Vec::new(),
        }
    }

    pub fn member(mut self, member: MemberDesc) -> Self {
        self.members.push(member);
        self
    }

    fn find(&self, member: &str) -> Option<&MemberDesc> {
        self.members.iter().find(|m| m.name == member)
    }
}

/// A global symbol. `size` of zero means "exact address only".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDesc {
    pub name: String,
    pub address: Address,
    #[serde(default)]
    pub size: u64,
}

/// A task known to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDesc {
    pub address: Address,
    pub pid: u32,
    pub state: char,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct Segment {
    base: Address,
    #[serde(serialize_with = "hex_serialize", deserialize_with = "hex_deserialize")]
    bytes: Vec<u8>,
}

fn hex_serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&snapdecode_types::encoding::hex_bytes(bytes))
}

fn hex_deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    snapdecode_types::encoding::parse_hex_bytes(&raw, "segment").map_err(serde::de::Error::custom)
}

fn pages_serialize<S: Serializer>(
    pages: &BTreeMap<Address, Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let segments: Vec<Segment> = pages
        .iter()
        .map(|(base, bytes)| Segment {
            base: *base,
            bytes: bytes.clone(),
        })
        .collect();
    segments.serialize(serializer)
}

fn pages_deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<Address, Vec<u8>>, D::Error> {
    let segments = Vec::<Segment>::deserialize(deserializer)?;
    let mut image = SnapshotImage::new(8);
    for segment in segments {
        image.write_bytes(segment.base, &segment.bytes);
    }
    Ok(image.pages)
}

// =============================================================================
// SnapshotImage
// =============================================================================

/// A complete in-memory snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotImage {
    #[serde(default = "default_word_size")]
    word_size: usize,
    #[serde(default = "default_int_bits")]
    int_bits: u32,
    #[serde(default = "default_true")]
    little_endian: bool,
    #[serde(
        rename = "segments",
        default,
        serialize_with = "pages_serialize",
        deserialize_with = "pages_deserialize"
    )]
    pages: BTreeMap<Address, Vec<u8>>,
    #[serde(default)]
    types: Vec<TypeDesc>,
    #[serde(default)]
    symbols: Vec<SymbolDesc>,
    #[serde(default)]
    constants: BTreeMap<String, u64>,
    #[serde(default)]
    tasks: Vec<TaskDesc>,
}

impl SnapshotImage {
    /// Create an empty little-endian image with a 32-bit `int`.
    pub fn new(word_size: usize) -> Self {
        Self {
            word_size,
            int_bits: 32,
            little_endian: true,
            ..Default::default()
        }
    }

    /// Load an image from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot image {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("failed to parse snapshot image {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let image: Self = serde_json::from_str(content)?;
        image.validate()?;
        Ok(image)
    }

    /// Reject geometries the decoders cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.word_size, 4 | 8) {
            bail!("unsupported word_size {} (expected 4 or 8)", self.word_size);
        }
        if !(8..=64).contains(&self.int_bits) {
            bail!("unsupported int_bits {} (expected 8..=64)", self.int_bits);
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn set_big_endian(&mut self) {
        self.little_endian = false;
    }

    pub fn set_int_bits(&mut self, bits: u32) {
        self.int_bits = bits;
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    /// Back `[base, base + len)` with zeroed pages. The range is clipped at
    /// the top of the address space.
    pub fn map(&mut self, base: Address, len: u64) {
        let last = base.saturating_add(len.max(1) - 1);
        let mut page = base / PAGE_SIZE * PAGE_SIZE;
        loop {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize]);
            match page.checked_add(PAGE_SIZE) {
                Some(next) if next <= last => page = next,
                _ => break,
            }
        }
    }

    /// Write raw bytes, mapping pages as needed.
    pub fn write_bytes(&mut self, address: Address, bytes: &[u8]) {
        self.map(address, bytes.len() as u64);
        for (i, byte) in bytes.iter().enumerate() {
            let Some(addr) = address.checked_add(i as u64) else {
                break;
            };
            let page_base = addr / PAGE_SIZE * PAGE_SIZE;
            if let Some(page) = self.pages.get_mut(&page_base) {
                page[(addr - page_base) as usize] = *byte;
            }
        }
    }

    /// Write an unsigned value of `size` bytes in the image's byte order.
    pub fn write_uint(&mut self, address: Address, value: u64, size: usize) {
        let le = value.to_le_bytes();
        let mut bytes = le[..size].to_vec();
        if !self.little_endian {
            bytes.reverse();
        }
        self.write_bytes(address, &bytes);
    }

    pub fn write_word(&mut self, address: Address, value: u64) {
        self.write_uint(address, value, self.word_size);
    }

    pub fn write_u32(&mut self, address: Address, value: u32) {
        self.write_uint(address, u64::from(value), 4);
    }

    pub fn write_i32(&mut self, address: Address, value: i32) {
        self.write_uint(address, u64::from(value as u32), 4);
    }

    pub fn write_u8(&mut self, address: Address, value: u8) {
        self.write_bytes(address, &[value]);
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// Add or replace a type description.
    pub fn define_type(&mut self, desc: TypeDesc) {
        self.types.retain(|t| t.name != desc.name);
        self.types.push(desc);
    }

    pub fn define_symbol(&mut self, name: &str, address: Address, size: u64) {
        self.symbols.retain(|s| s.name != name);
        self.symbols.push(SymbolDesc {
            name: name.to_string(),
            address,
            size,
        });
    }

    pub fn define_constant(&mut self, name: &str, value: u64) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn add_task(&mut self, task: TaskDesc) {
        self.tasks.retain(|t| t.pid != task.pid);
        self.tasks.push(task);
    }

    fn type_desc(&self, ty: &str) -> DecodeResult<&TypeDesc> {
        self.types
            .iter()
            .find(|t| t.name == ty)
            .ok_or_else(|| DecodeError::MissingType(ty.to_string()))
    }

    fn member_desc(&self, ty: &str, member: &str) -> DecodeResult<&MemberDesc> {
        self.type_desc(ty)?
            .find(member)
            .ok_or_else(|| DecodeError::missing_member(ty, member))
    }
}

impl MemoryOracle for SnapshotImage {
    fn word_size(&self) -> usize {
        self.word_size
    }

    fn int_bits(&self) -> u32 {
        self.int_bits
    }

    fn little_endian(&self) -> bool {
        self.little_endian
    }

    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> DecodeResult<()> {
        let len = buf.len();
        let unreadable = || DecodeError::UnreadableMemory { address, len };
        for (i, slot) in buf.iter_mut().enumerate() {
            let addr = address.checked_add(i as u64).ok_or_else(unreadable)?;
            let page_base = addr / PAGE_SIZE * PAGE_SIZE;
            let page = self.pages.get(&page_base).ok_or_else(unreadable)?;
            *slot = page[(addr - page_base) as usize];
        }
        Ok(())
    }

    fn resolve_symbol(&self, address: Address) -> Option<String> {
        self.symbols
            .iter()
            .find(|s| {
                address == s.address || (address > s.address && address - s.address < s.size)
            })
            .map(|s| s.name.clone())
    }

    fn symbol_address(&self, name: &str) -> Option<Address> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.address)
    }

    fn constant(&self, name: &str) -> Option<u64> {
        self.constants.get(name).copied()
    }
}

impl TypeLayout for SnapshotImage {
    fn has_member(&self, ty: &str, member: &str) -> bool {
        self.member_desc(ty, member).is_ok()
    }

    fn member_offset(&self, ty: &str, member: &str) -> DecodeResult<u64> {
        Ok(self.member_desc(ty, member)?.offset)
    }

    fn member_type(&self, ty: &str, member: &str) -> Option<String> {
        self.member_desc(ty, member).ok().map(|m| m.type_name.clone())
    }

    fn array_len(&self, ty: &str, member: &str) -> Option<u64> {
        self.member_desc(ty, member).ok().and_then(|m| m.array_len)
    }

    fn size_of(&self, ty: &str) -> DecodeResult<u64> {
        Ok(self.type_desc(ty)?.size)
    }
}

impl TaskTable for SnapshotImage {
    fn find_task(&self, pid: u32) -> Option<TaskRef> {
        self.tasks
            .iter()
            .find(|t| t.pid == pid)
            .map(|t| TaskRef::new(t.address, t.pid))
    }

    fn state_char(&self, task: &TaskRef) -> char {
        self.tasks
            .iter()
            .find(|t| t.address == task.address)
            .map(|t| t.state)
            .unwrap_or('?')
    }

    fn stack_trace(&self, pid: u32) -> DecodeResult<String> {
        self.tasks
            .iter()
            .find(|t| t.pid == pid)
            .and_then(|t| t.stack.as_ref())
            .map(|frames| {
                frames
                    .iter()
                    .enumerate()
                    .map(|(i, frame)| format!("#{} {}", i, frame))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .ok_or(DecodeError::StackUnavailable(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Scalar;

    #[test]
    fn test_reads_cross_page_boundary() {
        let mut image = SnapshotImage::new(8);
        image.write_word(PAGE_SIZE - 4, 0x1122_3344_5566_7788);
        assert_eq!(image.pages.len(), 2);
        assert_eq!(
            image.read_typed(PAGE_SIZE - 4, Scalar::Word).unwrap(),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn test_unmapped_read_fails() {
        let image = SnapshotImage::new(8);
        assert_eq!(
            image.read_typed(0x5000, Scalar::U32),
            Err(DecodeError::UnreadableMemory {
                address: 0x5000,
                len: 4
            })
        );
    }

    #[test]
    fn test_big_endian_and_narrow_words() {
        let mut image = SnapshotImage::new(4);
        image.set_big_endian();
        image.write_word(0x100, 0xdead_beef);
        let mut raw = [0u8; 4];
        image.read_bytes(0x100, &mut raw).unwrap();
        assert_eq!(raw, [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(image.read_typed(0x100, Scalar::Word).unwrap(), 0xdead_beef);
        image.write_i32(0x200, -5);
        assert_eq!(image.read_signed(0x200, Scalar::I32).unwrap(), -5);
    }

    #[test]
    fn test_layout_errors() {
        let mut image = SnapshotImage::new(8);
        image.define_type(
            TypeDesc::new("struct mutex", 32).member(MemberDesc::new("owner", 0, "atomic_long_t")),
        );
        assert_eq!(image.member_offset("struct mutex", "owner"), Ok(0));
        assert_eq!(
            image.member_offset("struct mutex", "count"),
            Err(DecodeError::missing_member("struct mutex", "count"))
        );
        assert_eq!(
            image.size_of("struct rw_semaphore"),
            Err(DecodeError::MissingType("struct rw_semaphore".to_string()))
        );
    }

    #[test]
    fn test_symbol_resolution() {
        let mut image = SnapshotImage::new(8);
        image.define_symbol("process_one_work", 0xffff_0000, 0x100);
        image.define_symbol("jiffies", 0xffff_2000, 0);
        assert_eq!(image.resolve_symbol(0xffff_0010).as_deref(), Some("process_one_work"));
        assert_eq!(image.resolve_symbol(0xffff_2000).as_deref(), Some("jiffies"));
        assert_eq!(image.resolve_symbol(0xffff_2001), None);
        assert_eq!(image.symbol_address("jiffies"), Some(0xffff_2000));
    }

    #[test]
    fn test_task_table() {
        let mut image = SnapshotImage::new(8);
        image.add_task(TaskDesc {
            address: 0x9000,
            pid: 42,
            state: 'D',
            stack: Some(vec!["schedule".into(), "mutex_lock".into()]),
        });
        let task = image.find_task(42).unwrap();
        assert_eq!(image.state_char(&task), 'D');
        assert_eq!(image.stack_trace(42).unwrap(), "#0 schedule\n#1 mutex_lock");
        assert_eq!(image.stack_trace(7), Err(DecodeError::StackUnavailable(7)));
    }

    #[test]
    fn test_json_roundtrip_preserves_memory() {
        let mut image = SnapshotImage::new(8);
        image.write_word(0x1000, 0xabcdef);
        image.define_constant("WORK_STRUCT_PWQ", 4);
        let json = image.to_json_string().unwrap();
        let loaded = SnapshotImage::from_json_str(&json).unwrap();
        assert_eq!(loaded.read_typed(0x1000, Scalar::Word).unwrap(), 0xabcdef);
        assert_eq!(loaded.constant("WORK_STRUCT_PWQ"), Some(4));
    }

    #[test]
    fn test_hand_written_segments_are_split_into_pages() {
        let json = r#"{
            "word_size": 4,
            "segments": [{ "base": 4094, "bytes": "01020304" }]
        }"#;
        let image = SnapshotImage::from_json_str(json).unwrap();
        assert_eq!(image.word_size(), 4);
        assert_eq!(image.read_typed(4094, Scalar::Word).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_writes_at_top_of_address_space_are_clipped() {
        let mut image = SnapshotImage::new(8);
        image.write_bytes(0xffff_ffff_ffff_f000, &[0xaa; 8]);
        image.write_bytes(0xffff_ffff_ffff_fffe, &[1, 2, 3, 4]);
        assert_eq!(image.pages.len(), 1);
        let mut raw = [0u8; 2];
        image.read_bytes(0xffff_ffff_ffff_fffe, &mut raw).unwrap();
        assert_eq!(raw, [1, 2]);

        let json = r#"{ "segments": [{ "base": 18446744073709547520, "bytes": "0102" }] }"#;
        let loaded = SnapshotImage::from_json_str(json).unwrap();
        assert_eq!(loaded.read_typed(0xffff_ffff_ffff_f000, Scalar::U8).unwrap(), 1);
    }

    #[test]
    fn test_unusable_geometry_is_rejected_on_load() {
        for json in [
            r#"{ "int_bits": 0 }"#,
            r#"{ "int_bits": 80 }"#,
            r#"{ "word_size": 3 }"#,
        ] {
            assert!(SnapshotImage::from_json_str(json).is_err(), "{}", json);
        }
        let image = SnapshotImage::from_json_str(r#"{ "word_size": 4, "int_bits": 64 }"#).unwrap();
        assert_eq!(image.int_bits(), 64);
    }
}
