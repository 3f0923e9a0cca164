//! Workqueue graph reconstruction.
//!
//! The objects involved and how they reference each other:
//!
//! ```text
//! workqueues ──list──▶ workqueue_struct ──pwqs──▶ pool_workqueue ──pool──▶ worker_pool
//!                                                     ▲                      │ worklist (work_struct.entry)
//!                        work_struct.data (tagged) ───┘                      │ workers  (worker.node)
//!                                                                            │ idle_list (worker.entry)
//!                                                                            └ busy_hash (worker.hentry)
//! ```
//!
//! Pools are enumerated through the `worker_pool_idr` registry. A work item's
//! owner comes from its tagged `data` word: a `pool_workqueue` pointer while
//! queued, an off-queue pool id otherwise.
//!
//! Relative to one `pool_workqueue` an item is
//! - **in flight** when a busy worker's `current_work` points at it,
//! - **pending** when it sits on the pool worklist and decodes to that pwq,
//! - **inactive** when it sits on the pwq's own deferred list
//!   (`inactive_works`, or `delayed_works` before 5.15).

use serde::Serialize;
use snapdecode_types::{Address, DecodeResult};
use tracing::{debug, trace};

use crate::config::DecoderConfig;
use crate::idindex::IdIndex;
use crate::oracle::{AddressIter, Scalar, Target, TASK_STRUCT};
use crate::probe::{first_present, require_first_present};
use crate::report::{InFlightWork, PoolReport, PwqReport, QueuesReport, WorkSummary, WorkqueueReport};
use crate::tagged::{decode, TagLayout, TaggedPointer};

pub const WORKQUEUE_STRUCT: &str = "struct workqueue_struct";
pub const POOL_WORKQUEUE: &str = "struct pool_workqueue";
pub const WORKER_POOL: &str = "struct worker_pool";
pub const WORKER: &str = "struct worker";
pub const WORK_STRUCT: &str = "struct work_struct";

const DEFAULT_BUSY_HASH_BUCKETS: u64 = 64;

/// How a work item relates to a `pool_workqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    InFlight,
    Pending,
    Inactive,
}

/// One work item attributed to a `pool_workqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub work: Address,
    pub func: Address,
    pub state: ItemState,
}

/// Read-only view of the workqueue subsystem of one snapshot.
pub struct QueueGraph<'a> {
    target: Target<'a>,
    config: &'a DecoderConfig,
    pools: IdIndex<'a>,
    tags: TagLayout,
    inactive_member: &'static str,
}

impl<'a> QueueGraph<'a> {
    pub fn new(target: Target<'a>, config: &'a DecoderConfig) -> DecodeResult<Self> {
        let pools = IdIndex::from_symbol(target, &config.symbols.worker_pool_idr)?;
        let tags = TagLayout::work_data(&target)?;
        let inactive_member = require_first_present(
            target.layout,
            POOL_WORKQUEUE,
            &["inactive_works", "delayed_works"],
        )?;
        debug!(inactive_member, mode = ?pools.mode(), "queue graph ready");
        Ok(Self {
            target,
            config,
            pools,
            tags,
            inactive_member,
        })
    }

    pub fn pool_index(&self) -> &IdIndex<'a> {
        &self.pools
    }

    // =========================================================================
    // Workqueues and pwqs
    // =========================================================================

    pub fn for_each_workqueue(&self) -> DecodeResult<AddressIter<'a>> {
        let head = self.target.symbol(&self.config.symbols.workqueues)?;
        let link = self.target.layout.member_offset(WORKQUEUE_STRUCT, "list")?;
        Ok(self.target.walk_list(head, link))
    }

    pub fn workqueue_name(&self, wq: Address) -> DecodeResult<String> {
        self.target.read_inline_string(wq, WORKQUEUE_STRUCT, "name")
    }

    pub fn find_workqueue(&self, name: &str) -> DecodeResult<Option<Address>> {
        for wq in self.for_each_workqueue()? {
            let wq = wq?;
            if self.workqueue_name(wq)? == name {
                return Ok(Some(wq));
            }
        }
        Ok(None)
    }

    pub fn for_each_pwq(&self, wq: Address) -> DecodeResult<AddressIter<'a>> {
        self.target
            .walk_member_list(wq, WORKQUEUE_STRUCT, "pwqs", POOL_WORKQUEUE, "pwqs_node")
    }

    fn pwq_pool(&self, pwq: Address) -> DecodeResult<Address> {
        self.target.read_word_member(pwq, POOL_WORKQUEUE, "pool")
    }

    fn pwq_int(&self, pwq: Address, member: &str) -> DecodeResult<i64> {
        self.target
            .read_signed_member(pwq, POOL_WORKQUEUE, member, Scalar::I32)
    }

    // =========================================================================
    // Pools and workers
    // =========================================================================

    /// Every registered `worker_pool`, in pool-id order.
    pub fn for_each_pool(&self) -> impl Iterator<Item = DecodeResult<Address>> + '_ {
        self.pools.iter().map(|entry| entry.map(|(_, pool)| pool))
    }

    pub fn pool_id(&self, pool: Address) -> DecodeResult<i64> {
        self.target
            .read_signed_member(pool, WORKER_POOL, "id", Scalar::I32)
    }

    pub fn for_each_pool_worker(&self, pool: Address) -> DecodeResult<AddressIter<'a>> {
        self.target
            .walk_member_list(pool, WORKER_POOL, "workers", WORKER, "node")
    }

    pub fn for_each_worker(&self) -> DecodeResult<Vec<Address>> {
        let mut workers = Vec::new();
        for pool in self.for_each_pool() {
            for worker in self.for_each_pool_worker(pool?)? {
                workers.push(worker?);
            }
        }
        Ok(workers)
    }

    /// Standard per-cpu pools of `cpu`.
    pub fn for_each_cpu_worker_pool(&self, cpu: u64) -> DecodeResult<Vec<Address>> {
        let template = self.target.symbol(&self.config.symbols.cpu_worker_pools)?;
        let offsets = self.target.symbol(&self.config.symbols.per_cpu_offset)?;
        let word = self.target.word_size() as u64;
        let offset = self.target.read_word(offsets + cpu * word)?;
        let base = template.wrapping_add(offset);
        let size = self.target.layout.size_of(WORKER_POOL)?;
        Ok((0..self.config.std_worker_pools as u64)
            .map(|i| base + i * size)
            .collect())
    }

    fn worker_task(&self, worker: Address) -> DecodeResult<Address> {
        self.target.read_word_member(worker, WORKER, "task")
    }

    fn worker_pid(&self, worker: Address) -> DecodeResult<u32> {
        let task = self.worker_task(worker)?;
        Ok(self.target.task_at(task)?.pid)
    }

    /// Workers currently executing something, from the pool's busy hash.
    pub fn busy_workers(&self, pool: Address) -> DecodeResult<Vec<Address>> {
        let buckets = self
            .target
            .layout
            .array_len(WORKER_POOL, "busy_hash")
            .unwrap_or(DEFAULT_BUSY_HASH_BUCKETS);
        let table = self.target.member_address(pool, WORKER_POOL, "busy_hash")?;
        let link = self.target.layout.member_offset(WORKER, "hentry")?;
        let word = self.target.word_size() as u64;

        let mut busy = Vec::new();
        for bucket in 0..buckets {
            for worker in self.target.walk_hlist(table + bucket * word, link) {
                busy.push(worker?);
            }
        }
        Ok(busy)
    }

    /// Whether the task with `pid` is a workqueue worker thread.
    pub fn is_task_a_worker(&self, pid: u32) -> DecodeResult<bool> {
        let Some(task) = self.target.tasks.find_task(pid) else {
            return Ok(false);
        };
        let flags = self
            .target
            .read_member(task.address, TASK_STRUCT, "flags", Scalar::U32)?;
        Ok(flags & self.config.pf_wq_worker != 0)
    }

    // =========================================================================
    // Work items
    // =========================================================================

    pub fn for_each_pending_work_in_pool(&self, pool: Address) -> DecodeResult<AddressIter<'a>> {
        self.target
            .walk_member_list(pool, WORKER_POOL, "worklist", WORK_STRUCT, "entry")
    }

    pub fn for_each_pending_work(&self) -> DecodeResult<Vec<Address>> {
        let mut works = Vec::new();
        for pool in self.for_each_pool() {
            for work in self.for_each_pending_work_in_pool(pool?)? {
                works.push(work?);
            }
        }
        Ok(works)
    }

    pub fn for_each_pending_work_on_cpu(&self, cpu: u64) -> DecodeResult<Vec<Address>> {
        let mut works = Vec::new();
        for pool in self.for_each_cpu_worker_pool(cpu)? {
            for work in self.for_each_pending_work_in_pool(pool)? {
                works.push(work?);
            }
        }
        Ok(works)
    }

    pub fn for_each_pending_work_of_pwq(&self, pwq: Address) -> DecodeResult<Vec<Address>> {
        let mut works = Vec::new();
        for work in self.for_each_pending_work_in_pool(self.pwq_pool(pwq)?)? {
            let work = work?;
            if self.get_work_pwq(work)? == Some(pwq) {
                works.push(work);
            }
        }
        Ok(works)
    }

    fn work_func(&self, work: Address) -> DecodeResult<Address> {
        self.target.read_word_member(work, WORK_STRUCT, "func")
    }

    /// Decoded owner of `work`.
    pub fn work_owner(&self, work: Address) -> DecodeResult<TaggedPointer> {
        let data = self.target.read_word_member(work, WORK_STRUCT, "data")?;
        decode(data, &self.tags, &self.pools)
    }

    /// The `pool_workqueue` `work` is queued on, if any.
    pub fn get_work_pwq(&self, work: Address) -> DecodeResult<Option<Address>> {
        Ok(match self.work_owner(work)? {
            TaggedPointer::DirectPointer { address } => Some(address),
            _ => None,
        })
    }

    /// The `worker_pool` `work` is associated with, if any.
    pub fn get_work_pool(&self, work: Address) -> DecodeResult<Option<Address>> {
        match self.work_owner(work)? {
            TaggedPointer::DirectPointer { address } => Ok(Some(self.pwq_pool(address)?)),
            TaggedPointer::EncodedId { target, .. } => Ok(Some(target)),
            TaggedPointer::Unknown => {
                trace!(work = format_args!("0x{:x}", work), "work has no pool");
                Ok(None)
            }
        }
    }

    /// Busy worker running `work` right now, matched on both the item and its
    /// function so a recycled `work_struct` is not mistaken for the original.
    pub fn find_worker_executing_work(&self, work: Address) -> DecodeResult<Option<Address>> {
        let Some(pool) = self.get_work_pool(work)? else {
            return Ok(None);
        };
        let func = self.work_func(work)?;
        for worker in self.busy_workers(pool)? {
            let current = self.target.read_word_member(worker, WORKER, "current_work")?;
            let current_func = self.target.read_word_member(worker, WORKER, "current_func")?;
            if current == work && current_func == func {
                return Ok(Some(worker));
            }
        }
        Ok(None)
    }

    fn inactive_head(&self, pwq: Address) -> DecodeResult<Address> {
        self.target
            .member_address(pwq, POOL_WORKQUEUE, self.inactive_member)
    }

    /// Busy workers of `pwq`'s pool that run on behalf of `pwq`.
    fn in_flight_workers(&self, pwq: Address) -> DecodeResult<Vec<Address>> {
        let mut out = Vec::new();
        for worker in self.busy_workers(self.pwq_pool(pwq)?)? {
            if self.target.read_word_member(worker, WORKER, "current_pwq")? == pwq {
                out.push(worker);
            }
        }
        Ok(out)
    }

    /// Every item attributed to `pwq`, in-flight first, then pending in
    /// worklist order, then inactive.
    pub fn items_of_pwq(&self, pwq: Address) -> DecodeResult<Vec<QueueItem>> {
        let mut items = Vec::new();
        for worker in self.in_flight_workers(pwq)? {
            items.push(QueueItem {
                work: self.target.read_word_member(worker, WORKER, "current_work")?,
                func: self.target.read_word_member(worker, WORKER, "current_func")?,
                state: ItemState::InFlight,
            });
        }
        for work in self.for_each_pending_work_of_pwq(pwq)? {
            if items.iter().any(|item| item.work == work) {
                continue;
            }
            items.push(QueueItem {
                work,
                func: self.work_func(work)?,
                state: ItemState::Pending,
            });
        }
        let link = self.target.layout.member_offset(WORK_STRUCT, "entry")?;
        for work in self.target.walk_list(self.inactive_head(pwq)?, link) {
            let work = work?;
            items.push(QueueItem {
                work,
                func: self.work_func(work)?,
                state: ItemState::Inactive,
            });
        }
        Ok(items)
    }

    /// Idle: nothing in flight, nothing pending and an empty inactive list.
    pub fn pwq_is_idle(&self, pwq: Address) -> DecodeResult<bool> {
        Ok(self.in_flight_workers(pwq)?.is_empty()
            && self.for_each_pending_work_of_pwq(pwq)?.is_empty()
            && self.target.list_empty(self.inactive_head(pwq)?)?)
    }

    // =========================================================================
    // Reports
    // =========================================================================

    fn summarize(&self, work: Address) -> DecodeResult<WorkSummary> {
        Ok(WorkSummary {
            address: work,
            func: self.target.function_name(self.work_func(work)?),
        })
    }

    pub fn pwq_report(&self, pwq: Address) -> DecodeResult<PwqReport> {
        let pool = self.pwq_pool(pwq)?;
        let mayday = match first_present(self.target.layout, POOL_WORKQUEUE, &["mayday_node"]) {
            Some(member) => {
                !self
                    .target
                    .list_empty(self.target.member_address(pwq, POOL_WORKQUEUE, member)?)?
            }
            None => false,
        };

        let mut in_flight = Vec::new();
        for worker in self.in_flight_workers(pwq)? {
            let scheduled = self
                .target
                .walk_member_list(worker, WORKER, "scheduled", WORK_STRUCT, "entry")?
                .map(|work| self.summarize(work?))
                .collect::<DecodeResult<Vec<_>>>()?;
            in_flight.push(InFlightWork {
                worker,
                pid: self.worker_pid(worker)?,
                rescuer: self.target.read_word_member(worker, WORKER, "rescue_wq")? != 0,
                work: self.target.read_word_member(worker, WORKER, "current_work")?,
                func: self
                    .target
                    .function_name(self.target.read_word_member(worker, WORKER, "current_func")?),
                scheduled,
            });
        }

        let mut pending = Vec::new();
        let mut inactive = Vec::new();
        for item in self.items_of_pwq(pwq)? {
            match item.state {
                ItemState::InFlight => {}
                ItemState::Pending => pending.push(self.summarize(item.work)?),
                ItemState::Inactive => inactive.push(self.summarize(item.work)?),
            }
        }

        Ok(PwqReport {
            address: pwq,
            pool_id: self.pool_id(pool)?,
            nr_active: self.pwq_int(pwq, "nr_active")?,
            max_active: self.pwq_int(pwq, "max_active")?,
            refcnt: self.pwq_int(pwq, "refcnt")?,
            mayday,
            in_flight,
            pending,
            inactive,
        })
    }

    pub fn workqueue_report(&self, wq: Address) -> DecodeResult<WorkqueueReport> {
        let mut busy = Vec::new();
        for pwq in self.for_each_pwq(wq)? {
            let report = self.pwq_report(pwq?)?;
            if !report.is_idle() {
                busy.push(report);
            }
        }
        Ok(WorkqueueReport {
            name: self.workqueue_name(wq)?,
            address: wq,
            idle: busy.is_empty(),
            busy,
        })
    }

    pub fn pool_report(&self, pool: Address) -> DecodeResult<PoolReport> {
        let read = |member: &str| {
            self.target
                .read_signed_member(pool, WORKER_POOL, member, Scalar::I32)
        };
        let nr_workers = read("nr_workers")?;
        let nr_idle = read("nr_idle")?;

        let manager = self.target.read_word_member(pool, WORKER_POOL, "manager")?;
        let manager_pid = if manager != 0 {
            Some(self.worker_pid(manager)?)
        } else {
            None
        };

        let mut idle_pids = Vec::new();
        for worker in self
            .target
            .walk_member_list(pool, WORKER_POOL, "idle_list", WORKER, "entry")?
        {
            idle_pids.push(self.worker_pid(worker?)?);
        }
        let mut worker_pids = Vec::new();
        for worker in self.for_each_pool_worker(pool)? {
            worker_pids.push(self.worker_pid(worker?)?);
        }

        Ok(PoolReport {
            id: self.pool_id(pool)?,
            address: pool,
            cpu: read("cpu")?,
            nr_workers,
            nr_idle,
            all_idle: nr_workers == nr_idle,
            manager_pid,
            idle_pids,
            worker_pids,
        })
    }

    /// Every workqueue followed by every pool.
    pub fn queues_report(&self) -> DecodeResult<QueuesReport> {
        let workqueues = self
            .for_each_workqueue()?
            .map(|wq| self.workqueue_report(wq?))
            .collect::<DecodeResult<Vec<_>>>()?;
        let pools = self
            .for_each_pool()
            .map(|pool| self.pool_report(pool?))
            .collect::<DecodeResult<Vec<_>>>()?;
        Ok(QueuesReport { workqueues, pools })
    }
}
