//! Lock ownership and waiter inspection.
//!
//! Three primitives are understood:
//!
//! - `struct mutex`: at most one owner. Before v4.10 a `count` of 1 means
//!   unlocked and `owner` is a plain task pointer; since then `owner` is an
//!   `atomic_long_t` whose low bits carry state flags.
//! - `struct semaphore`: no owner tracking; locked when `count <= 0`.
//! - `struct rw_semaphore`: a writer, some readers, or nobody. Since v5.3
//!   `owner` is an `atomic_long_t` and `count` carries the exact reader count;
//!   before that `owner` is a pointer with flag bits and the reader count
//!   cannot be recovered.
//!
//! The layout generation is detected from the declared type of `owner`.
//! Bit constants come from the target when it exports them and from
//! [`LockConstants`] otherwise.

use serde::Serialize;
use snapdecode_types::{Address, DecodeResult, TaskRef};
use tracing::{debug, warn};

use crate::config::LockConstants;
use crate::oracle::{Scalar, Target};
use crate::probe::{member_kind, MemberKind};
use crate::report::{CallStack, LockInfo, WaiterInfo};

pub const MUTEX: &str = "struct mutex";
pub const MUTEX_WAITER: &str = "struct mutex_waiter";
pub const SEMAPHORE: &str = "struct semaphore";
pub const SEMAPHORE_WAITER: &str = "struct semaphore_waiter";
pub const RW_SEMAPHORE: &str = "struct rw_semaphore";
pub const RWSEM_WAITER: &str = "struct rwsem_waiter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Mutex,
    Semaphore,
    RwSemaphore,
}

impl LockKind {
    pub fn type_name(self) -> &'static str {
        match self {
            LockKind::Mutex => MUTEX,
            LockKind::Semaphore => SEMAPHORE,
            LockKind::RwSemaphore => RW_SEMAPHORE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LockKind::Mutex => "mutex",
            LockKind::Semaphore => "semaphore",
            LockKind::RwSemaphore => "rwsem",
        }
    }

    fn waiter_type(self) -> &'static str {
        match self {
            LockKind::Mutex => MUTEX_WAITER,
            LockKind::Semaphore => SEMAPHORE_WAITER,
            LockKind::RwSemaphore => RWSEM_WAITER,
        }
    }
}

/// Access requested by an rwsem waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

/// A task blocked on a lock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Waiter {
    pub waiter: Address,
    pub task: TaskRef,
    /// Only set for rwsem waiters.
    pub access: Option<Access>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "count", rename_all = "snake_case")]
pub enum ReaderCount {
    Exact(u64),
    AtLeastOne,
}

/// Who holds an rwsem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RwOwner {
    Free,
    Writer { task: TaskRef },
    Readers { readers: ReaderCount },
    /// Locked, but neither writer nor reader ownership can be established.
    Indeterminate,
}

/// Owner of any lock kind, as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OwnerState {
    Free,
    Task { task: TaskRef },
    Readers { readers: ReaderCount },
    /// Held, and the primitive does not record by whom.
    Untracked,
    Indeterminate,
}

impl From<RwOwner> for OwnerState {
    fn from(owner: RwOwner) -> Self {
        match owner {
            RwOwner::Free => OwnerState::Free,
            RwOwner::Writer { task } => OwnerState::Task { task },
            RwOwner::Readers { readers } => OwnerState::Readers { readers },
            RwOwner::Indeterminate => OwnerState::Indeterminate,
        }
    }
}

/// Resolved bit constants.
#[derive(Debug, Clone, Copy)]
struct Bits {
    mutex_flags: u64,
    writer_locked: u64,
    reader_owned: u64,
    anonymously_owned: u64,
    owner_flags_mask: u64,
    reader_shift: u64,
    reader_mask: u64,
    waiting_for_write: u64,
    waiting_for_read: u64,
}

impl Bits {
    fn resolve(target: &Target<'_>, fallback: &LockConstants) -> Self {
        Self {
            mutex_flags: target.constant_or("MUTEX_FLAGS", fallback.mutex_flags),
            writer_locked: target.constant_or("RWSEM_WRITER_LOCKED", fallback.rwsem_writer_locked),
            reader_owned: target.constant_or("RWSEM_READER_OWNED", fallback.rwsem_reader_owned),
            anonymously_owned: target
                .constant_or("RWSEM_ANONYMOUSLY_OWNED", fallback.rwsem_anonymously_owned),
            owner_flags_mask: target
                .constant_or("RWSEM_OWNER_FLAGS_MASK", fallback.rwsem_owner_flags_mask),
            reader_shift: target.constant_or("RWSEM_READER_SHIFT", fallback.rwsem_reader_shift),
            reader_mask: target.constant_or("RWSEM_READER_MASK", fallback.rwsem_reader_mask),
            waiting_for_write: target
                .constant_or("RWSEM_WAITING_FOR_WRITE", fallback.rwsem_waiting_for_write),
            waiting_for_read: target
                .constant_or("RWSEM_WAITING_FOR_READ", fallback.rwsem_waiting_for_read),
        }
    }
}

/// Lock inspector bound to one snapshot.
pub struct LockInspector<'a> {
    target: Target<'a>,
    bits: Bits,
}

impl<'a> LockInspector<'a> {
    pub fn new(target: Target<'a>, fallback: &LockConstants) -> Self {
        Self {
            target,
            bits: Bits::resolve(&target, fallback),
        }
    }

    fn task(&self, address: Address) -> DecodeResult<TaskRef> {
        self.target.task_at(address)
    }

    // =========================================================================
    // Waiters
    // =========================================================================

    /// Blocked tasks of the `kind` lock at `lock`, oldest first.
    pub fn waiters(&self, kind: LockKind, lock: Address) -> DecodeResult<Vec<Waiter>> {
        let waiter_ty = kind.waiter_type();
        let mut out = Vec::new();
        for waiter in self
            .target
            .walk_member_list(lock, kind.type_name(), "wait_list", waiter_ty, "list")?
        {
            let waiter = waiter?;
            let task = self.task(self.target.read_word_member(waiter, waiter_ty, "task")?)?;
            let access = match kind {
                LockKind::RwSemaphore => self.rwsem_waiter_access(waiter)?,
                _ => None,
            };
            out.push(Waiter {
                waiter,
                task,
                access,
            });
        }
        Ok(out)
    }

    pub fn has_waiters(&self, kind: LockKind, lock: Address) -> DecodeResult<bool> {
        let head = self
            .target
            .member_address(lock, kind.type_name(), "wait_list")?;
        Ok(!self.target.list_empty(head)?)
    }

    pub fn mutex_for_each_waiter(&self, lock: Address) -> DecodeResult<Vec<Waiter>> {
        self.waiters(LockKind::Mutex, lock)
    }

    pub fn mutex_for_each_waiter_task(&self, lock: Address) -> DecodeResult<Vec<TaskRef>> {
        Ok(self.mutex_for_each_waiter(lock)?.into_iter().map(|w| w.task).collect())
    }

    pub fn semaphore_for_each_waiter(&self, lock: Address) -> DecodeResult<Vec<Waiter>> {
        self.waiters(LockKind::Semaphore, lock)
    }

    pub fn semaphore_for_each_waiter_task(&self, lock: Address) -> DecodeResult<Vec<TaskRef>> {
        Ok(self
            .semaphore_for_each_waiter(lock)?
            .into_iter()
            .map(|w| w.task)
            .collect())
    }

    fn rwsem_waiter_access(&self, waiter: Address) -> DecodeResult<Option<Access>> {
        let ty = self
            .target
            .read_member(waiter, RWSEM_WAITER, "type", Scalar::U32)?;
        Ok(if ty == self.bits.waiting_for_write {
            Some(Access::Write)
        } else if ty == self.bits.waiting_for_read {
            Some(Access::Read)
        } else {
            None
        })
    }

    // =========================================================================
    // Mutex
    // =========================================================================

    pub fn mutex_is_locked(&self, lock: Address) -> DecodeResult<bool> {
        if self.target.layout.has_member(MUTEX, "count") {
            let count = self
                .target
                .read_signed_member(lock, MUTEX, "count", Scalar::I32)?;
            return Ok(count != 1);
        }
        Ok(self.mutex_owner(lock)?.is_some())
    }

    pub fn mutex_owner(&self, lock: Address) -> DecodeResult<Option<TaskRef>> {
        let owner = match member_kind(self.target.layout, MUTEX, "owner") {
            MemberKind::Absent => {
                warn!(lock = format_args!("0x{:x}", lock), "mutex has no owner information");
                return Ok(None);
            }
            MemberKind::Pointer(_) => self.target.read_word_member(lock, MUTEX, "owner")?,
            _ => self.target.read_word_member(lock, MUTEX, "owner")? & !self.bits.mutex_flags,
        };
        if owner == 0 {
            return Ok(None);
        }
        Ok(Some(self.task(owner)?))
    }

    // =========================================================================
    // Semaphore
    // =========================================================================

    pub fn semaphore_is_locked(&self, lock: Address) -> DecodeResult<bool> {
        let count = self
            .target
            .read_signed_member(lock, SEMAPHORE, "count", Scalar::I32)?;
        Ok(count <= 0)
    }

    // =========================================================================
    // rwsem
    // =========================================================================

    fn rwsem_is_atomic_owner(&self) -> bool {
        member_kind(self.target.layout, RW_SEMAPHORE, "owner") == MemberKind::Atomic
    }

    fn rwsem_words(&self, lock: Address) -> DecodeResult<(u64, u64)> {
        Ok((
            self.target.read_word_member(lock, RW_SEMAPHORE, "count")?,
            self.target.read_word_member(lock, RW_SEMAPHORE, "owner")?,
        ))
    }

    pub fn rwsem_is_locked(&self, lock: Address) -> DecodeResult<bool> {
        Ok(self.rwsem_words(lock)?.0 != 0)
    }

    pub fn rwsem_is_writer_owned(&self, lock: Address) -> DecodeResult<bool> {
        let (count, owner) = self.rwsem_words(lock)?;
        if self.rwsem_is_atomic_owner() {
            return Ok(count & self.bits.writer_locked != 0);
        }
        let flags = self.bits.reader_owned | self.bits.anonymously_owned;
        Ok(owner != 0 && owner & flags == 0)
    }

    pub fn rwsem_is_reader_owned(&self, lock: Address) -> DecodeResult<bool> {
        let (_, owner) = self.rwsem_words(lock)?;
        Ok(owner & self.bits.reader_owned != 0)
    }

    /// Resolve rwsem ownership, probing writer before reader.
    pub fn rwsem_owner(&self, lock: Address) -> DecodeResult<RwOwner> {
        if !self.rwsem_is_locked(lock)? {
            return Ok(RwOwner::Free);
        }
        let (count, owner) = self.rwsem_words(lock)?;
        let atomic = self.rwsem_is_atomic_owner();

        if self.rwsem_is_writer_owned(lock)? {
            let task = if atomic {
                owner & !self.bits.owner_flags_mask
            } else {
                owner
            };
            if task == 0 {
                debug!(lock = format_args!("0x{:x}", lock), "rwsem writer not recorded");
                return Ok(RwOwner::Indeterminate);
            }
            return Ok(RwOwner::Writer {
                task: self.task(task)?,
            });
        }

        if self.rwsem_is_reader_owned(lock)? {
            // an unusable exported shift leaves the readers uncounted
            let counted = u32::try_from(self.bits.reader_shift)
                .ok()
                .and_then(|shift| (count & self.bits.reader_mask).checked_shr(shift));
            let readers = match counted {
                Some(n) if atomic => ReaderCount::Exact(n),
                _ => ReaderCount::AtLeastOne,
            };
            return Ok(RwOwner::Readers { readers });
        }

        debug!(lock = format_args!("0x{:x}", lock), "rwsem owner indeterminate");
        Ok(RwOwner::Indeterminate)
    }

    // =========================================================================
    // Reports
    // =========================================================================

    pub fn waiter_infos(&self, kind: LockKind, lock: Address) -> DecodeResult<Vec<WaiterInfo>> {
        Ok(self
            .waiters(kind, lock)?
            .into_iter()
            .map(|w| WaiterInfo {
                state: self.target.tasks.state_char(&w.task),
                task: w.task,
                access: w.access,
            })
            .collect())
    }

    pub fn owner(&self, kind: LockKind, lock: Address) -> DecodeResult<OwnerState> {
        Ok(match kind {
            LockKind::Mutex => match self.mutex_owner(lock)? {
                Some(task) => OwnerState::Task { task },
                None if self.mutex_is_locked(lock)? => OwnerState::Indeterminate,
                None => OwnerState::Free,
            },
            LockKind::Semaphore => {
                if self.semaphore_is_locked(lock)? {
                    OwnerState::Untracked
                } else {
                    OwnerState::Free
                }
            }
            LockKind::RwSemaphore => self.rwsem_owner(lock)?.into(),
        })
    }

    /// Owner, lock state and waiters of one lock.
    pub fn info(&self, kind: LockKind, lock: Address) -> DecodeResult<LockInfo> {
        let owner = self.owner(kind, lock)?;
        let owner_state = match &owner {
            OwnerState::Task { task } => Some(self.target.tasks.state_char(task)),
            _ => None,
        };
        Ok(LockInfo {
            kind,
            address: lock,
            locked: owner != OwnerState::Free,
            owner,
            owner_state,
            waiters: self.waiter_infos(kind, lock)?,
        })
    }

    fn call_stack(&self, task: &TaskRef) -> CallStack {
        CallStack {
            pid: task.pid,
            trace: self.target.tasks.stack_trace(task.pid).map_err(|e| e.to_string()),
        }
    }

    pub fn waiter_call_stacks(&self, kind: LockKind, lock: Address) -> DecodeResult<Vec<CallStack>> {
        Ok(self
            .waiters(kind, lock)?
            .iter()
            .map(|w| self.call_stack(&w.task))
            .collect())
    }

    /// Stack of the owning task, when exactly one task owns the lock.
    pub fn owner_call_stack(&self, kind: LockKind, lock: Address) -> DecodeResult<Option<CallStack>> {
        Ok(match self.owner(kind, lock)? {
            OwnerState::Task { task } => Some(self.call_stack(&task)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{KernelImage, LockLayout};

    fn inspector(image: &crate::image::SnapshotImage) -> LockInspector<'_> {
        LockInspector::new(Target::from_snapshot(image), &LockConstants::default())
    }

    #[test]
    fn test_free_mutex_keeps_full_waiter_queue() {
        let mut k = KernelImage::new();
        let lock = k.mutex();
        let tasks: Vec<_> = (0..3).map(|i| k.task(200 + i, 'D', &[])).collect();
        for task in &tasks {
            k.mutex_wait(lock, *task);
        }
        let image = k.finish();
        let locks = inspector(&image);

        assert!(!locks.mutex_is_locked(lock).unwrap());
        assert_eq!(locks.mutex_owner(lock).unwrap(), None);
        let pids: Vec<_> = locks
            .waiters(LockKind::Mutex, lock)
            .unwrap()
            .iter()
            .map(|w| w.task.pid)
            .collect();
        assert_eq!(pids, vec![200, 201, 202]);
        let waiting: Vec<_> = locks.mutex_for_each_waiter_task(lock).unwrap();
        assert_eq!(waiting.len(), 3);
        assert_eq!(waiting[0].address, tasks[0]);
        assert_eq!(locks.owner(LockKind::Mutex, lock).unwrap(), OwnerState::Free);
    }

    #[test]
    fn test_modern_mutex_owner_masks_flags() {
        let mut k = KernelImage::new();
        let owner = k.task(10, 'R', &["mutex_lock", "do_work"]);
        let lock = k.mutex();
        k.lock_mutex(lock, owner, 0x1);
        let image = k.finish();
        let locks = inspector(&image);

        assert!(locks.mutex_is_locked(lock).unwrap());
        let task = locks.mutex_owner(lock).unwrap().unwrap();
        assert_eq!(task.address, owner);
        assert_eq!(task.pid, 10);
        let stack = locks.owner_call_stack(LockKind::Mutex, lock).unwrap().unwrap();
        assert_eq!(stack.trace.unwrap(), "#0 mutex_lock\n#1 do_work");
    }

    #[test]
    fn test_legacy_mutex() {
        let mut k = KernelImage::new();
        k.set_lock_layout(LockLayout::Legacy);
        let owner = k.task(11, 'R', &[]);
        let lock = k.mutex();
        let image_unlocked = k.image().clone();
        k.lock_mutex(lock, owner, 0);
        let image = k.finish();

        assert!(!inspector(&image_unlocked).mutex_is_locked(lock).unwrap());
        let locks = inspector(&image);
        assert!(locks.mutex_is_locked(lock).unwrap());
        assert_eq!(locks.mutex_owner(lock).unwrap().map(|t| t.pid), Some(11));
        // no stack recorded for pid 11
        let stack = locks.owner_call_stack(LockKind::Mutex, lock).unwrap().unwrap();
        assert!(stack.trace.is_err());
    }

    #[test]
    fn test_semaphore() {
        let mut k = KernelImage::new();
        let free = k.semaphore(1);
        let held = k.semaphore(0);
        let waiter = k.task(30, 'D', &["__down", "down"]);
        k.semaphore_wait(held, waiter);
        let image = k.finish();
        let locks = inspector(&image);

        assert!(!locks.semaphore_is_locked(free).unwrap());
        assert!(locks.semaphore_is_locked(held).unwrap());
        assert_eq!(locks.owner(LockKind::Semaphore, held).unwrap(), OwnerState::Untracked);
        let info = locks.info(LockKind::Semaphore, held).unwrap();
        assert!(info.locked);
        assert_eq!(info.waiters.len(), 1);
        assert_eq!(info.waiters[0].state, 'D');
        assert_eq!(info.waiters[0].access, None);
        assert!(locks.semaphore_for_each_waiter_task(free).unwrap().is_empty());
        assert_eq!(locks.semaphore_for_each_waiter_task(held).unwrap()[0].pid, 30);
        let stacks = locks.waiter_call_stacks(LockKind::Semaphore, held).unwrap();
        assert_eq!(stacks[0].pid, 30);
        assert!(locks.owner_call_stack(LockKind::Semaphore, held).unwrap().is_none());
    }

    #[test]
    fn test_rwsem_three_readers_with_combined_counter() {
        let mut k = KernelImage::new();
        let sem = k.rwsem();
        let last_reader = k.task(40, 'R', &[]);
        k.set_rwsem_state(sem, 3 << 8, last_reader | 1);
        let image = k.finish();
        let locks = inspector(&image);

        assert!(locks.rwsem_is_reader_owned(sem).unwrap());
        assert!(!locks.rwsem_is_writer_owned(sem).unwrap());
        assert_eq!(
            locks.rwsem_owner(sem).unwrap(),
            RwOwner::Readers {
                readers: ReaderCount::Exact(3)
            }
        );
    }

    #[test]
    fn test_rwsem_oversized_reader_shift_is_uncounted() {
        let mut k = KernelImage::new();
        let sem = k.rwsem();
        k.set_rwsem_state(sem, 2 << 8, 1);
        k.image_mut().define_constant("RWSEM_READER_SHIFT", 64);
        let image = k.finish();

        assert_eq!(
            inspector(&image).rwsem_owner(sem).unwrap(),
            RwOwner::Readers {
                readers: ReaderCount::AtLeastOne
            }
        );
    }

    #[test]
    fn test_rwsem_modern_writer_and_indeterminate() {
        let mut k = KernelImage::new();
        let sem = k.rwsem();
        let anon = k.rwsem();
        let writer = k.task(41, 'R', &[]);
        k.set_rwsem_state(sem, 1, writer | 0x2);
        // writer bit without a recorded owner
        k.set_rwsem_state(anon, 1, 0);
        let image = k.finish();
        let locks = inspector(&image);

        assert_eq!(
            locks.rwsem_owner(sem).unwrap(),
            RwOwner::Writer {
                task: TaskRef::new(writer, 41)
            }
        );
        assert_eq!(locks.rwsem_owner(anon).unwrap(), RwOwner::Indeterminate);
        assert!(locks.info(LockKind::RwSemaphore, anon).unwrap().locked);
    }

    #[test]
    fn test_rwsem_legacy_readers_are_uncounted() {
        let mut k = KernelImage::new();
        k.set_lock_layout(LockLayout::Legacy);
        let readers = k.rwsem();
        let writer_held = k.rwsem();
        let free = k.rwsem();
        let writer = k.task(42, 'R', &[]);
        k.set_rwsem_state(readers, 2, 1);
        k.set_rwsem_state(writer_held, 0xffff_ffff_0000_0001, writer);
        let image = k.finish();
        let locks = inspector(&image);

        assert_eq!(
            locks.rwsem_owner(readers).unwrap(),
            RwOwner::Readers {
                readers: ReaderCount::AtLeastOne
            }
        );
        assert_eq!(
            locks.rwsem_owner(writer_held).unwrap(),
            RwOwner::Writer {
                task: TaskRef::new(writer, 42)
            }
        );
        assert_eq!(locks.rwsem_owner(free).unwrap(), RwOwner::Free);
    }

    #[test]
    fn test_rwsem_waiters_carry_access() {
        let mut k = KernelImage::new();
        let sem = k.rwsem();
        let reader = k.task(50, 'D', &[]);
        let writer = k.task(51, 'D', &[]);
        k.set_rwsem_state(sem, 1 << 8, reader | 1);
        k.rwsem_wait(sem, writer, 0);
        k.rwsem_wait(sem, reader, 1);
        let image = k.finish();
        let locks = inspector(&image);

        let waiters = locks.waiters(LockKind::RwSemaphore, sem).unwrap();
        let seen: Vec<_> = waiters.iter().map(|w| (w.task.pid, w.access)).collect();
        assert_eq!(seen, vec![(51, Some(Access::Write)), (50, Some(Access::Read))]);
        assert!(locks.has_waiters(LockKind::RwSemaphore, sem).unwrap());
    }

    #[test]
    fn test_exported_constants_take_precedence() {
        let mut k = KernelImage::new();
        let owner = k.task(60, 'R', &[]);
        let lock = k.mutex();
        // flags wider than the fallback mask
        k.lock_mutex(lock, owner, 0x8);
        k.image_mut().define_constant("MUTEX_FLAGS", 0x0f);
        let image = k.finish();
        let locks = inspector(&image);
        assert_eq!(locks.mutex_owner(lock).unwrap().map(|t| t.address), Some(owner));
    }
}
