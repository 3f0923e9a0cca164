//! Synthetic kernel images for tests.
//!
//! [`KernelImage`] wraps a [`SnapshotImage`] with a bump allocator and the
//! type layouts of the structures the decoders understand, laid out the way a
//! kernel of the chosen pointer width lays them out. Builder methods link
//! objects together the same way the kernel would (`list_add_tail`,
//! `hlist_add_head`, tagged `work_struct.data`), so decoders see realistic
//! memory.
//!
//! Only compiled for tests or with the `fixtures` feature.

use snapdecode_types::Address;

use crate::idindex::IndexMode;
use crate::image::{MemberDesc, SnapshotImage, TaskDesc, TypeDesc};
use crate::oracle::{MemoryOracle, Scalar, TypeLayout};

/// Start of the fake kernel heap.
pub const HEAP_BASE: Address = 0xffff_8880_0100_0000;
/// Start of the fake kernel text.
pub const TEXT_BASE: Address = 0xffff_ffff_8100_0000;
/// Start of the fake heap in 32-bit images.
pub const HEAP_BASE_32: Address = 0xc100_0000;
/// Start of the fake text in 32-bit images.
pub const TEXT_BASE_32: Address = 0xc000_0000;
/// Link-time address of the per-cpu `cpu_worker_pools` template.
pub const PERCPU_TEMPLATE: Address = 0x0002_b000;

pub const WORK_STRUCT_PWQ: u64 = 1 << 2;
pub const WORK_STRUCT_WQ_DATA_MASK: u64 = !0xff;
pub const WORK_OFFQ_POOL_SHIFT: u64 = 5;
pub const WORK_OFFQ_POOL_NONE: u64 = work_offq_pool_none(8);
pub const PF_WQ_WORKER: u32 = 0x20;
pub const NR_STD_WORKER_POOLS: usize = 2;

const IDR_LAYER_SLOTS: u64 = 256;
const BUSY_HASH_BUCKETS: u64 = 64;
const XA_CHUNK_SHIFT: u32 = 6;
const XA_CHUNK: u64 = 1 << XA_CHUNK_SHIFT;

/// Layout generation of the lock structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLayout {
    /// Packed `atomic_long_t` owners (mutex since v4.10, rwsem since v5.3).
    Modern,
    /// `count` plus a plain `struct task_struct *` owner.
    Legacy,
}

/// Radix tree flavour backing a modern `struct idr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadixFlavor {
    XArray,
    RadixTree,
}

impl RadixFlavor {
    /// Root type, head member and node type.
    fn type_names(self) -> (&'static str, &'static str, &'static str) {
        match self {
            RadixFlavor::XArray => ("struct xarray", "xa_head", "struct xa_node"),
            RadixFlavor::RadixTree => ("struct radix_tree_root", "rnode", "struct radix_tree_node"),
        }
    }
}

fn list_head(name: &str, offset: u64) -> MemberDesc {
    MemberDesc::new(name, offset, "struct list_head")
}

fn ptr(name: &str, offset: u64, ty: &str) -> MemberDesc {
    MemberDesc::new(name, offset, &format!("{} *", ty))
}

pub struct KernelImage {
    image: SnapshotImage,
    word: u64,
    heap: Address,
    text: Address,
    pools: Vec<(u64, Address)>,
}

impl Default for KernelImage {
    fn default() -> Self {
        Self::new()
    }
}

/// The off-queue "no pool" sentinel for a `word_size`-byte `work_struct.data`.
pub const fn work_offq_pool_none(word_size: usize) -> u64 {
    (1 << (word_size as u32 * 8 - WORK_OFFQ_POOL_SHIFT as u32)) - 1
}

impl KernelImage {
    /// A 64-bit image with a 32-bit `int`.
    pub fn new() -> Self {
        Self::with_geometry(8, 32)
    }

    /// An image with `word_size`-byte pointers (4 or 8) and an `int_bits`-wide
    /// `int`. Structures are laid out for that pointer width.
    pub fn with_geometry(word_size: usize, int_bits: u32) -> Self {
        assert!(matches!(word_size, 4 | 8), "fixture word size {}", word_size);
        let (heap, text) = if word_size == 8 {
            (HEAP_BASE, TEXT_BASE)
        } else {
            (HEAP_BASE_32, TEXT_BASE_32)
        };
        let mut image = SnapshotImage::new(word_size);
        image.set_int_bits(int_bits);
        let mut k = Self {
            image,
            word: word_size as u64,
            heap,
            text,
            pools: Vec::new(),
        };
        k.define_core_types();
        k.define_workqueue_types();
        k.set_lock_layout(LockLayout::Modern);

        k.image.define_constant("WORK_STRUCT_PWQ", WORK_STRUCT_PWQ);
        k.image.define_constant("WORK_STRUCT_WQ_DATA_MASK", WORK_STRUCT_WQ_DATA_MASK);
        k.image.define_constant("WORK_OFFQ_POOL_SHIFT", WORK_OFFQ_POOL_SHIFT);
        k.image
            .define_constant("WORK_OFFQ_POOL_NONE", work_offq_pool_none(word_size));

        let size = 2 * k.word;
        let workqueues = k.alloc(size, 16);
        k.init_list_head(workqueues);
        k.image.define_symbol("workqueues", workqueues, size);
        k
    }

    pub fn image(&self) -> &SnapshotImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut SnapshotImage {
        &mut self.image
    }

    pub fn finish(self) -> SnapshotImage {
        self.image
    }

    /// Pointer width in bytes.
    pub fn word_size(&self) -> u64 {
        self.word
    }

    // =========================================================================
    // Raw memory
    // =========================================================================

    /// Allocate zeroed, mapped memory.
    pub fn alloc(&mut self, size: u64, align: u64) -> Address {
        let addr = self.heap.div_ceil(align) * align;
        self.heap = addr + size.max(1);
        self.image.map(addr, size.max(1));
        addr
    }

    pub fn read_word(&self, addr: Address) -> u64 {
        self.image.read_typed(addr, Scalar::Word).unwrap_or(0)
    }

    fn offset(&self, ty: &str, member: &str) -> u64 {
        self.image
            .member_offset(ty, member)
            .unwrap_or_else(|e| panic!("fixture layout: {}", e))
    }

    fn size(&self, ty: &str) -> u64 {
        self.image
            .size_of(ty)
            .unwrap_or_else(|e| panic!("fixture layout: {}", e))
    }

    fn read_i32(&self, addr: Address) -> i32 {
        self.image.read_signed(addr, Scalar::I32).unwrap_or(0) as i32
    }

    fn bump_i32(&mut self, addr: Address, by: i32) {
        let value = self.read_i32(addr) + by;
        self.image.write_i32(addr, value);
    }

    pub fn init_list_head(&mut self, head: Address) {
        self.image.write_word(head, head);
        self.image.write_word(head + self.word, head);
    }

    /// Kernel `list_add_tail`: link `node` just before `head`.
    pub fn list_add_tail(&mut self, head: Address, node: Address) {
        let w = self.word;
        let prev = self.read_word(head + w);
        self.image.write_word(node, head);
        self.image.write_word(node + w, prev);
        self.image.write_word(prev, node);
        self.image.write_word(head + w, node);
    }

    /// Kernel `hlist_add_head`.
    pub fn hlist_add_head(&mut self, head: Address, node: Address) {
        let w = self.word;
        let first = self.read_word(head);
        self.image.write_word(node, first);
        if first != 0 {
            self.image.write_word(first + w, node);
        }
        self.image.write_word(head, node);
        self.image.write_word(node + w, head);
    }

    /// Define a function symbol and return its address.
    pub fn function(&mut self, name: &str) -> Address {
        if let Some(addr) = self.image.symbol_address(name) {
            return addr;
        }
        let addr = self.text;
        self.text += 0x40;
        self.image.define_symbol(name, addr, 0x40);
        addr
    }

    /// Create a task with `pid`, scheduler state and a stack trace.
    pub fn task(&mut self, pid: u32, state: char, stack: &[&str]) -> Address {
        let addr = self.alloc(64, 64);
        let pid_at = self.offset("struct task_struct", "pid");
        let comm_at = self.offset("struct task_struct", "comm");
        self.image.write_i32(addr + pid_at, pid as i32);
        let comm = format!("task-{}", pid);
        self.image.write_bytes(addr + comm_at, comm.as_bytes());
        self.image.add_task(TaskDesc {
            address: addr,
            pid,
            state,
            stack: (!stack.is_empty()).then(|| stack.iter().map(|s| s.to_string()).collect()),
        });
        addr
    }

    pub fn set_task_flags(&mut self, task: Address, flags: u32) {
        let at = self.offset("struct task_struct", "flags");
        self.image.write_u32(task + at, flags);
    }

    // =========================================================================
    // Type layouts
    // =========================================================================

    fn define_core_types(&mut self) {
        let w = self.word;
        self.image.define_type(
            TypeDesc::new("struct list_head", 2 * w)
                .member(ptr("next", 0, "struct list_head"))
                .member(ptr("prev", w, "struct list_head")),
        );
        self.image.define_type(
            TypeDesc::new("struct task_struct", 64)
                .member(MemberDesc::new("__state", 0, "unsigned int"))
                .member(MemberDesc::new("flags", 4, "unsigned int"))
                .member(MemberDesc::new("pid", 8, "pid_t"))
                .member(MemberDesc::new("comm", 16, "char").array(16)),
        );
    }

    fn define_workqueue_types(&mut self) {
        let w = self.word;
        self.image.define_type(
            TypeDesc::new("struct work_struct", 4 * w)
                .member(MemberDesc::new("data", 0, "atomic_long_t"))
                .member(list_head("entry", w))
                .member(MemberDesc::new("func", 3 * w, "work_func_t")),
        );
        self.image.define_type(
            TypeDesc::new("struct worker", 12 * w)
                .member(list_head("entry", 0))
                .member(MemberDesc::new("hentry", 0, "struct hlist_node"))
                .member(ptr("current_work", 2 * w, "struct work_struct"))
                .member(MemberDesc::new("current_func", 3 * w, "work_func_t"))
                .member(ptr("current_pwq", 4 * w, "struct pool_workqueue"))
                .member(list_head("scheduled", 5 * w))
                .member(ptr("task", 7 * w, "struct task_struct"))
                .member(ptr("pool", 8 * w, "struct worker_pool"))
                .member(list_head("node", 9 * w))
                .member(ptr("rescue_wq", 11 * w, "struct workqueue_struct")),
        );
        let busy_hash = 32 + 4 * w;
        let workers = busy_hash + BUSY_HASH_BUCKETS * w;
        self.image.define_type(
            TypeDesc::new("struct worker_pool", workers + 3 * w)
                .member(MemberDesc::new("cpu", 4, "int"))
                .member(MemberDesc::new("node", 8, "int"))
                .member(MemberDesc::new("id", 12, "int"))
                .member(MemberDesc::new("flags", 16, "unsigned int"))
                .member(MemberDesc::new("nr_workers", 20, "int"))
                .member(MemberDesc::new("nr_idle", 24, "int"))
                .member(list_head("worklist", 32))
                .member(list_head("idle_list", 32 + 2 * w))
                .member(MemberDesc::new("busy_hash", busy_hash, "struct hlist_head").array(BUSY_HASH_BUCKETS))
                .member(list_head("workers", workers))
                .member(ptr("manager", workers + 2 * w, "struct worker")),
        );
        self.define_pwq_type("inactive_works");
        self.image.define_type(
            TypeDesc::new("struct workqueue_struct", 5 * w + 24)
                .member(list_head("pwqs", 0))
                .member(list_head("list", 2 * w))
                .member(MemberDesc::new("name", 4 * w, "char").array(24))
                .member(ptr("rescuer", 4 * w + 24, "struct worker")),
        );
    }

    fn define_pwq_type(&mut self, inactive: &str) {
        let w = self.word;
        let inactive_at = (2 * w + 12).div_ceil(w) * w;
        self.image.define_type(
            TypeDesc::new("struct pool_workqueue", inactive_at + 6 * w)
                .member(ptr("pool", 0, "struct worker_pool"))
                .member(ptr("wq", w, "struct workqueue_struct"))
                .member(MemberDesc::new("refcnt", 2 * w, "int"))
                .member(MemberDesc::new("nr_active", 2 * w + 4, "int"))
                .member(MemberDesc::new("max_active", 2 * w + 8, "int"))
                .member(list_head(inactive, inactive_at))
                .member(list_head("pwqs_node", inactive_at + 2 * w))
                .member(list_head("mayday_node", inactive_at + 4 * w)),
        );
    }

    /// Rename `pool_workqueue.inactive_works` to its pre-5.15 name.
    pub fn use_delayed_works_name(&mut self) {
        self.define_pwq_type("delayed_works");
    }

    /// Switch the mutex and rwsem layouts.
    pub fn set_lock_layout(&mut self, layout: LockLayout) {
        let w = self.word;
        match layout {
            LockLayout::Modern => {
                self.image.define_type(
                    TypeDesc::new("struct mutex", 4 * w)
                        .member(MemberDesc::new("owner", 0, "atomic_long_t"))
                        .member(MemberDesc::new("wait_lock", w, "raw_spinlock_t"))
                        .member(list_head("wait_list", 2 * w)),
                );
                self.image.define_type(
                    TypeDesc::new("struct rw_semaphore", 5 * w)
                        .member(MemberDesc::new("count", 0, "atomic_long_t"))
                        .member(MemberDesc::new("owner", w, "atomic_long_t"))
                        .member(MemberDesc::new("wait_lock", 2 * w, "raw_spinlock_t"))
                        .member(list_head("wait_list", 3 * w)),
                );
            }
            LockLayout::Legacy => {
                self.image.define_type(
                    TypeDesc::new("struct mutex", 4 * w)
                        .member(MemberDesc::new("count", 0, "atomic_t"))
                        .member(list_head("wait_list", w))
                        .member(ptr("owner", 3 * w, "struct task_struct")),
                );
                self.image.define_type(
                    TypeDesc::new("struct rw_semaphore", 5 * w)
                        .member(MemberDesc::new("count", 0, "atomic_long_t"))
                        .member(list_head("wait_list", w))
                        .member(MemberDesc::new("wait_lock", 3 * w, "raw_spinlock_t"))
                        .member(ptr("owner", 4 * w, "struct task_struct")),
                );
            }
        }
        self.image.define_type(
            TypeDesc::new("struct mutex_waiter", 3 * w)
                .member(list_head("list", 0))
                .member(ptr("task", 2 * w, "struct task_struct")),
        );
        self.image.define_type(
            TypeDesc::new("struct semaphore", 8 + 2 * w)
                .member(MemberDesc::new("lock", 0, "raw_spinlock_t"))
                .member(MemberDesc::new("count", 4, "int"))
                .member(list_head("wait_list", 8)),
        );
        self.image.define_type(
            TypeDesc::new("struct semaphore_waiter", 4 * w)
                .member(list_head("list", 0))
                .member(ptr("task", 2 * w, "struct task_struct"))
                .member(MemberDesc::new("up", 3 * w, "bool")),
        );
        self.image.define_type(
            TypeDesc::new("struct rwsem_waiter", 4 * w)
                .member(list_head("list", 0))
                .member(ptr("task", 2 * w, "struct task_struct"))
                .member(MemberDesc::new("type", 3 * w, "enum rwsem_waiter_type")),
        );
    }

    // =========================================================================
    // Legacy idr
    // =========================================================================

    fn define_legacy_idr_types(&mut self) {
        let w = self.word;
        self.image.define_type(
            TypeDesc::new("struct idr", 5 * w)
                .member(ptr("hint", 0, "struct idr_layer"))
                .member(ptr("top", w, "struct idr_layer"))
                .member(MemberDesc::new("layers", 2 * w, "int"))
                .member(MemberDesc::new("cur", 2 * w + 4, "int")),
        );
        let count_at = 8 + IDR_LAYER_SLOTS * w;
        self.image.define_type(
            TypeDesc::new("struct idr_layer", count_at + 16)
                .member(MemberDesc::new("prefix", 0, "int"))
                .member(MemberDesc::new("layer", 4, "int"))
                .member(MemberDesc::new("ary", 8, "struct idr_layer *").array(IDR_LAYER_SLOTS))
                .member(MemberDesc::new("count", count_at, "int")),
        );
    }

    fn idr_layer(&mut self, layer: u32, prefix: u64) -> Address {
        let size = self.size("struct idr_layer");
        let addr = self.alloc(size, 64);
        self.image.write_i32(addr, prefix as i32);
        self.image.write_i32(addr + 4, layer as i32);
        addr
    }

    fn idr_slot(&self, layer: Address, index: u64) -> Address {
        layer + self.offset("struct idr_layer", "ary") + (index & 0xff) * self.word
    }

    /// Build a legacy `struct idr` holding `entries`.
    ///
    /// `idr.hint` is left pointing at the leaf of the last inserted id.
    pub fn legacy_idr(&mut self, entries: &[(u64, Address)]) -> Address {
        self.define_legacy_idr_types();
        let root_size = self.size("struct idr");
        let root = self.alloc(root_size, 8);
        let Some(max) = entries.iter().map(|(id, _)| *id).max() else {
            return root;
        };

        let mut layers = 1u32;
        while max >> (layers * 8) != 0 {
            layers += 1;
        }
        let top = self.idr_layer(layers - 1, 0);
        let top_at = self.offset("struct idr", "top");
        let layers_at = self.offset("struct idr", "layers");
        self.image.write_word(root + top_at, top);
        self.image.write_i32(root + layers_at, layers as i32);

        let mut last_leaf = 0;
        for (id, entry) in entries {
            let mut node = top;
            for layer in (1..layers).rev() {
                let slot_addr = self.idr_slot(node, id >> (layer * 8));
                let mut child = self.read_word(slot_addr);
                if child == 0 {
                    let prefix = id & !((1u64 << (layer * 8)) - 1);
                    child = self.idr_layer(layer - 1, prefix);
                    self.image.write_word(slot_addr, child);
                }
                node = child;
            }
            let slot_addr = self.idr_slot(node, *id);
            self.image.write_word(slot_addr, *entry);
            last_leaf = node;
        }
        self.set_legacy_hint(root, last_leaf);
        root
    }

    /// Leaf layer that holds (or would hold) `id`.
    pub fn legacy_leaf_for(&self, root: Address, id: u64) -> Address {
        let mut node = self.read_word(root + self.offset("struct idr", "top"));
        let layers = self.read_i32(root + self.offset("struct idr", "layers")).max(1) as u64;
        for layer in (1..layers).rev() {
            if node == 0 {
                break;
            }
            node = self.read_word(self.idr_slot(node, id >> (layer * 8)));
        }
        node
    }

    pub fn set_legacy_hint(&mut self, root: Address, leaf: Address) {
        let at = self.offset("struct idr", "hint");
        self.image.write_word(root + at, leaf);
    }

    /// Overwrite the top layer's `layer` field.
    pub fn set_legacy_top_layer(&mut self, root: Address, layer: i32) {
        let top = self.read_word(root + self.offset("struct idr", "top"));
        let at = self.offset("struct idr_layer", "layer");
        self.image.write_i32(top + at, layer);
    }

    // =========================================================================
    // Modern idr
    // =========================================================================

    fn define_modern_idr_types(&mut self, flavor: RadixFlavor) {
        let w = self.word;
        let (root_ty, head, node_ty) = flavor.type_names();
        self.image.define_type(
            TypeDesc::new(root_ty, 8 + w)
                .member(MemberDesc::new("xa_lock", 0, "spinlock_t"))
                .member(MemberDesc::new("xa_flags", 4, "gfp_t"))
                .member(MemberDesc::new(head, 8, "void *")),
        );
        self.image.define_type(
            TypeDesc::new(node_ty, 72 * w)
                .member(MemberDesc::new("shift", 0, "unsigned char"))
                .member(MemberDesc::new("offset", 1, "unsigned char"))
                .member(MemberDesc::new("count", 2, "unsigned char"))
                .member(ptr("parent", w, node_ty))
                .member(MemberDesc::new("slots", 5 * w, "void *").array(XA_CHUNK)),
        );
        self.image.define_type(
            TypeDesc::new("struct idr", 16 + w)
                .member(MemberDesc::new("idr_rt", 0, root_ty))
                .member(MemberDesc::new("idr_base", 8 + w, "unsigned int"))
                .member(MemberDesc::new("idr_next", 12 + w, "unsigned int")),
        );
    }

    fn radix_node(&mut self, node_ty: &str, shift: u32) -> Address {
        let size = self.size(node_ty);
        let addr = self.alloc(size, 64);
        let at = self.offset(node_ty, "shift");
        self.image.write_u8(addr + at, shift as u8);
        addr
    }

    fn radix_slot(&self, node_ty: &str, node: Address, index: u64) -> Address {
        node + self.offset(node_ty, "slots") + (index & (XA_CHUNK - 1)) * self.word
    }

    /// Build an xarray-backed `struct idr` whose first id is `base`.
    pub fn modern_idr(&mut self, base: u64, entries: &[(u64, Address)]) -> Address {
        self.modern_idr_with(RadixFlavor::XArray, base, entries)
    }

    pub fn modern_idr_with(
        &mut self,
        flavor: RadixFlavor,
        base: u64,
        entries: &[(u64, Address)],
    ) -> Address {
        self.define_modern_idr_types(flavor);
        let (root_ty, head, node_ty) = flavor.type_names();
        let tag = match flavor {
            RadixFlavor::XArray => 2,
            RadixFlavor::RadixTree => 1,
        };
        let root_size = self.size("struct idr");
        let root = self.alloc(root_size, 8);
        let base_at = self.offset("struct idr", "idr_base");
        self.image.write_u32(root + base_at, base as u32);
        let head_addr = root + self.offset("struct idr", "idr_rt") + self.offset(root_ty, head);

        let indexed: Vec<(u64, Address)> = entries.iter().map(|(id, e)| (id - base, *e)).collect();
        let Some(max) = indexed.iter().map(|(i, _)| *i).max() else {
            return root;
        };
        if max == 0 {
            self.image.write_word(head_addr, indexed[0].1);
            return root;
        }

        let mut top_shift = 0;
        while max >> top_shift >= XA_CHUNK {
            top_shift += XA_CHUNK_SHIFT;
        }
        let top = self.radix_node(node_ty, top_shift);
        self.image.write_word(head_addr, top + tag);

        let parent_at = self.offset(node_ty, "parent");
        for (index, entry) in indexed {
            let mut node = top;
            let mut shift = top_shift;
            while shift > 0 {
                let slot_addr = self.radix_slot(node_ty, node, index >> shift);
                let mut child = self.read_word(slot_addr);
                if child == 0 {
                    let fresh = self.radix_node(node_ty, shift - XA_CHUNK_SHIFT);
                    self.image.write_word(fresh + parent_at, node);
                    child = fresh + tag;
                    self.image.write_word(slot_addr, child);
                }
                node = child - tag;
                shift -= XA_CHUNK_SHIFT;
            }
            let slot_addr = self.radix_slot(node_ty, node, index);
            self.image.write_word(slot_addr, entry);
        }
        root
    }

    /// Address of the top radix node of a modern idr, if the tree has one.
    pub fn modern_top_node(&self, root: Address, flavor: RadixFlavor) -> Option<Address> {
        let (root_ty, head, _) = flavor.type_names();
        let head_addr = root + self.offset("struct idr", "idr_rt") + self.offset(root_ty, head);
        let entry = self.read_word(head_addr);
        let tag = match flavor {
            RadixFlavor::XArray => 2,
            RadixFlavor::RadixTree => 1,
        };
        (entry & 3 == tag && entry > 4096).then(|| entry - tag)
    }

    /// Overwrite a radix node's `shift` byte.
    pub fn set_radix_shift(&mut self, node: Address, flavor: RadixFlavor, shift: u8) {
        let at = self.offset(flavor.type_names().2, "shift");
        self.image.write_u8(node + at, shift);
    }

    // =========================================================================
    // Workqueues
    // =========================================================================

    /// Create a `workqueue_struct` and add it to the global `workqueues` list.
    pub fn workqueue(&mut self, name: &str) -> Address {
        let size = self.size("struct workqueue_struct");
        let wq = self.alloc(size, 64);
        self.init_list_head(wq + self.offset("struct workqueue_struct", "pwqs"));
        let bytes = name.as_bytes();
        let name_at = self.offset("struct workqueue_struct", "name");
        self.image.write_bytes(wq + name_at, &bytes[..bytes.len().min(23)]);
        let global = self.image.symbol_address("workqueues").unwrap_or(0);
        let list_at = self.offset("struct workqueue_struct", "list");
        self.list_add_tail(global, wq + list_at);
        wq
    }

    fn init_pool(&mut self, pool: Address, cpu: i32, id: u64) {
        const POOL: &str = "struct worker_pool";
        let cpu_at = self.offset(POOL, "cpu");
        let id_at = self.offset(POOL, "id");
        self.image.write_i32(pool + cpu_at, cpu);
        self.image.write_i32(pool + id_at, id as i32);
        for member in ["worklist", "idle_list", "workers"] {
            let at = self.offset(POOL, member);
            self.init_list_head(pool + at);
        }
        self.pools.push((id, pool));
    }

    /// Create an unbound `worker_pool` with the given id.
    pub fn pool(&mut self, id: u64) -> Address {
        let size = self.size("struct worker_pool");
        let pool = self.alloc(size, 64);
        self.init_pool(pool, -1, id);
        pool
    }

    /// Lay out per-cpu `cpu_worker_pools` for `nr_cpus` CPUs.
    ///
    /// Pool ids are assigned `cpu * 2 + i` starting from `first_id`.
    pub fn cpu_worker_pools(&mut self, nr_cpus: usize, first_id: u64) -> Vec<[Address; NR_STD_WORKER_POOLS]> {
        let pool_size = self.size("struct worker_pool");
        let area = pool_size * NR_STD_WORKER_POOLS as u64;
        let w = self.word;
        self.image.define_symbol("cpu_worker_pools", PERCPU_TEMPLATE, area);
        let offsets = self.alloc(w * nr_cpus as u64, w);
        self.image.define_symbol("__per_cpu_offset", offsets, w * nr_cpus as u64);

        let mut out = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let base = self.alloc(area, 64);
            self.image
                .write_word(offsets + w * cpu as u64, base.wrapping_sub(PERCPU_TEMPLATE));
            let mut pools = [0; NR_STD_WORKER_POOLS];
            for (i, slot) in pools.iter_mut().enumerate() {
                let pool = base + pool_size * i as u64;
                let id = first_id + (cpu * NR_STD_WORKER_POOLS + i) as u64;
                self.init_pool(pool, cpu as i32, id);
                *slot = pool;
            }
            out.push(pools);
        }
        out
    }

    /// Publish every pool created so far as `worker_pool_idr`.
    pub fn publish_pools(&mut self, mode: IndexMode) -> Address {
        let entries = {
            let mut entries = self.pools.clone();
            entries.sort_unstable();
            entries
        };
        let root = match mode {
            IndexMode::Legacy => self.legacy_idr(&entries),
            IndexMode::Modern => self.modern_idr(0, &entries),
        };
        self.image.define_symbol("worker_pool_idr", root, 0);
        root
    }

    /// Bind `wq` to `pool` through a new `pool_workqueue`.
    pub fn pwq(&mut self, wq: Address, pool: Address, max_active: i32) -> Address {
        const PWQ: &str = "struct pool_workqueue";
        let size = self.size(PWQ);
        let pwq = self.alloc(size, 256);
        let wq_at = self.offset(PWQ, "wq");
        let refcnt_at = self.offset(PWQ, "refcnt");
        let max_active_at = self.offset(PWQ, "max_active");
        let inactive_at = self.inactive_offset();
        let mayday_at = self.offset(PWQ, "mayday_node");
        let node_at = self.offset(PWQ, "pwqs_node");
        self.image.write_word(pwq, pool);
        self.image.write_word(pwq + wq_at, wq);
        self.image.write_i32(pwq + refcnt_at, 1);
        self.image.write_i32(pwq + max_active_at, max_active);
        self.init_list_head(pwq + inactive_at);
        self.init_list_head(pwq + mayday_at);
        self.list_add_tail(wq, pwq + node_at);
        pwq
    }

    fn inactive_offset(&self) -> u64 {
        let member = if self.image.has_member("struct pool_workqueue", "inactive_works") {
            "inactive_works"
        } else {
            "delayed_works"
        };
        self.offset("struct pool_workqueue", member)
    }

    pub fn set_mayday(&mut self, pwq: Address) {
        let node = pwq + self.offset("struct pool_workqueue", "mayday_node");
        self.image.write_word(node, node + 0x1000);
    }

    /// Create an idle-less worker with a fresh task and attach it to `pool`.
    pub fn worker(&mut self, pool: Address, pid: u32) -> Address {
        const WORKER: &str = "struct worker";
        let task = self.task(pid, 'S', &["schedule", "worker_thread", "kthread"]);
        self.set_task_flags(task, PF_WQ_WORKER);
        let size = self.size(WORKER);
        let worker = self.alloc(size, 32);
        let scheduled_at = self.offset(WORKER, "scheduled");
        let task_at = self.offset(WORKER, "task");
        let pool_at = self.offset(WORKER, "pool");
        let node_at = self.offset(WORKER, "node");
        let workers_at = self.offset("struct worker_pool", "workers");
        let nr_workers_at = self.offset("struct worker_pool", "nr_workers");
        self.init_list_head(worker + scheduled_at);
        self.image.write_word(worker + task_at, task);
        self.image.write_word(worker + pool_at, pool);
        self.list_add_tail(pool + workers_at, worker + node_at);
        self.bump_i32(pool + nr_workers_at, 1);
        worker
    }

    pub fn set_idle(&mut self, worker: Address) {
        let pool = self.read_word(worker + self.offset("struct worker", "pool"));
        let idle_at = self.offset("struct worker_pool", "idle_list");
        let nr_idle_at = self.offset("struct worker_pool", "nr_idle");
        self.list_add_tail(pool + idle_at, worker);
        self.bump_i32(pool + nr_idle_at, 1);
    }

    pub fn set_manager(&mut self, pool: Address, worker: Address) {
        let at = self.offset("struct worker_pool", "manager");
        self.image.write_word(pool + at, worker);
    }

    pub fn set_rescuer(&mut self, wq: Address, worker: Address) {
        let rescuer_at = self.offset("struct workqueue_struct", "rescuer");
        let rescue_wq_at = self.offset("struct worker", "rescue_wq");
        self.image.write_word(wq + rescuer_at, worker);
        self.image.write_word(worker + rescue_wq_at, wq);
    }

    /// Create an unqueued `work_struct` running `func`.
    pub fn work(&mut self, func: &str) -> Address {
        const WORK: &str = "struct work_struct";
        let func = self.function(func);
        let size = self.size(WORK);
        let work = self.alloc(size, 32);
        let none = work_offq_pool_none(self.word as usize);
        self.image.write_word(work, none << WORK_OFFQ_POOL_SHIFT);
        let entry_at = self.offset(WORK, "entry");
        let func_at = self.offset(WORK, "func");
        self.init_list_head(work + entry_at);
        self.image.write_word(work + func_at, func);
        work
    }

    fn pwq_pool(&self, pwq: Address) -> Address {
        self.read_word(pwq)
    }

    fn work_entry(&self, work: Address) -> Address {
        work + self.offset("struct work_struct", "entry")
    }

    /// Queue `work` on the pool worklist on behalf of `pwq`.
    pub fn queue_work(&mut self, pwq: Address, work: Address) {
        self.image.write_word(work, pwq | WORK_STRUCT_PWQ | 1);
        let pool = self.pwq_pool(pwq);
        let worklist_at = self.offset("struct worker_pool", "worklist");
        let nr_active_at = self.offset("struct pool_workqueue", "nr_active");
        let entry = self.work_entry(work);
        self.list_add_tail(pool + worklist_at, entry);
        self.bump_i32(pwq + nr_active_at, 1);
    }

    /// Park `work` on the pwq's inactive list.
    pub fn defer_work(&mut self, pwq: Address, work: Address) {
        self.image.write_word(work, pwq | WORK_STRUCT_PWQ | 1);
        let inactive_at = self.inactive_offset();
        let entry = self.work_entry(work);
        self.list_add_tail(pwq + inactive_at, entry);
    }

    /// Make `worker` busy executing `work` for `pwq`.
    pub fn start_work(&mut self, worker: Address, pwq: Address, work: Address) {
        const WORKER: &str = "struct worker";
        let pool = self.pwq_pool(pwq);
        let pool_id = self.read_i32(pool + self.offset("struct worker_pool", "id")) as u64;
        self.image.write_word(work, pool_id << WORK_OFFQ_POOL_SHIFT);
        let func = self.read_word(work + self.offset("struct work_struct", "func"));
        let current_work_at = self.offset(WORKER, "current_work");
        let current_func_at = self.offset(WORKER, "current_func");
        let current_pwq_at = self.offset(WORKER, "current_pwq");
        self.image.write_word(worker + current_work_at, work);
        self.image.write_word(worker + current_func_at, func);
        self.image.write_word(worker + current_pwq_at, pwq);
        let bucket = (work >> 5) % BUSY_HASH_BUCKETS;
        let head = pool + self.offset("struct worker_pool", "busy_hash") + bucket * self.word;
        self.hlist_add_head(head, worker);
        let nr_active_at = self.offset("struct pool_workqueue", "nr_active");
        self.bump_i32(pwq + nr_active_at, 1);
    }

    /// Queue `work` on `worker`'s scheduled list.
    pub fn schedule_on(&mut self, worker: Address, work: Address) {
        let scheduled_at = self.offset("struct worker", "scheduled");
        let entry = self.work_entry(work);
        self.list_add_tail(worker + scheduled_at, entry);
    }

    // =========================================================================
    // Locks
    // =========================================================================

    pub fn mutex(&mut self) -> Address {
        let size = self.size("struct mutex");
        let lock = self.alloc(size, 8);
        let wait_list = self.offset("struct mutex", "wait_list");
        self.init_list_head(lock + wait_list);
        if self.image.has_member("struct mutex", "count") {
            self.image.write_i32(lock, 1);
        }
        lock
    }

    pub fn lock_mutex(&mut self, lock: Address, owner: Address, flags: u64) {
        if self.image.has_member("struct mutex", "count") {
            let owner_at = self.offset("struct mutex", "owner");
            self.image.write_i32(lock, 0);
            self.image.write_word(lock + owner_at, owner);
        } else {
            self.image.write_word(lock, owner | flags);
        }
    }

    pub fn mutex_wait(&mut self, lock: Address, task: Address) -> Address {
        self.wait_on("struct mutex", "struct mutex_waiter", lock, task)
    }

    fn wait_on(&mut self, lock_ty: &str, waiter_ty: &str, lock: Address, task: Address) -> Address {
        let size = self.size(waiter_ty);
        let waiter = self.alloc(size, 8);
        let task_at = self.offset(waiter_ty, "task");
        self.image.write_word(waiter + task_at, task);
        let wait_list = self.offset(lock_ty, "wait_list");
        self.list_add_tail(lock + wait_list, waiter);
        waiter
    }

    pub fn semaphore(&mut self, count: i32) -> Address {
        let size = self.size("struct semaphore");
        let sem = self.alloc(size, 8);
        let count_at = self.offset("struct semaphore", "count");
        let wait_list = self.offset("struct semaphore", "wait_list");
        self.image.write_i32(sem + count_at, count);
        self.init_list_head(sem + wait_list);
        sem
    }

    pub fn semaphore_wait(&mut self, sem: Address, task: Address) -> Address {
        self.wait_on("struct semaphore", "struct semaphore_waiter", sem, task)
    }

    pub fn rwsem(&mut self) -> Address {
        let size = self.size("struct rw_semaphore");
        let sem = self.alloc(size, 8);
        let wait_list = self.offset("struct rw_semaphore", "wait_list");
        self.init_list_head(sem + wait_list);
        sem
    }

    /// Raw `count` and `owner` words of an rwsem.
    pub fn set_rwsem_state(&mut self, sem: Address, count: u64, owner: u64) {
        let owner_offset = self.offset("struct rw_semaphore", "owner");
        self.image.write_word(sem, count);
        self.image.write_word(sem + owner_offset, owner);
    }

    /// `kind` 0 waits for write, 1 for read.
    pub fn rwsem_wait(&mut self, sem: Address, task: Address, kind: u32) -> Address {
        let waiter = self.wait_on("struct rw_semaphore", "struct rwsem_waiter", sem, task);
        let type_at = self.offset("struct rwsem_waiter", "type");
        self.image.write_u32(waiter + type_at, kind);
        waiter
    }
}
