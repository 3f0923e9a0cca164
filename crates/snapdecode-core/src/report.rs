//! Report shapes and their text rendering.
//!
//! Every report is a plain serializable value built by
//! [`QueueGraph`](crate::workqueue::QueueGraph) or
//! [`LockInspector`](crate::locks::LockInspector). The `render_*` functions
//! turn them into the human-readable dumps; JSON output serializes the same
//! values directly.

use serde::Serialize;
use snapdecode_types::{Address, TaskRef};

use crate::locks::{Access, LockKind, OwnerState, ReaderCount};

const TASK_PTR: &str = "struct task_struct *";

// =============================================================================
// Workqueue reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkSummary {
    pub address: Address,
    pub func: String,
}

/// A busy worker running an item of the reported pwq.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightWork {
    pub worker: Address,
    pub pid: u32,
    pub rescuer: bool,
    pub work: Address,
    pub func: String,
    pub scheduled: Vec<WorkSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PwqReport {
    pub address: Address,
    pub pool_id: i64,
    pub nr_active: i64,
    pub max_active: i64,
    pub refcnt: i64,
    pub mayday: bool,
    pub in_flight: Vec<InFlightWork>,
    pub pending: Vec<WorkSummary>,
    pub inactive: Vec<WorkSummary>,
}

impl PwqReport {
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.pending.is_empty() && self.inactive.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkqueueReport {
    pub name: String,
    pub address: Address,
    pub idle: bool,
    /// Only the pwqs that are not idle.
    pub busy: Vec<PwqReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub id: i64,
    pub address: Address,
    pub cpu: i64,
    pub nr_workers: i64,
    pub nr_idle: i64,
    pub all_idle: bool,
    pub manager_pid: Option<u32>,
    pub idle_pids: Vec<u32>,
    pub worker_pids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuesReport {
    pub workqueues: Vec<WorkqueueReport>,
    pub pools: Vec<PoolReport>,
}

fn render_works(out: &mut String, works: &[WorkSummary]) {
    for work in works {
        out.push_str(&format!(
            "        (struct work_struct *)0x{:x}: func: {}\n",
            work.address, work.func
        ));
    }
}

pub fn render_pwq(report: &PwqReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("pwq: (struct pool_workqueue *)0x{:x}\n", report.address));
    out.push_str(&format!("pool id: {}\n", report.pool_id));
    out.push_str(&format!(
        "active/max_active {}/{}\n",
        report.nr_active, report.max_active
    ));
    out.push_str(&format!("refcnt: {} Mayday: {}\n", report.refcnt, report.mayday));

    if report.in_flight.is_empty() {
        out.push_str("  There are no in-flight work items for this pwq.\n");
    } else {
        out.push_str("  in-flight:\n");
        for w in &report.in_flight {
            let rescuer = if w.rescuer { " (RESCUER)" } else { "" };
            out.push_str(&format!(
                "    worker pid: {}{} current_work: 0x{:x} current_func: {}\n",
                w.pid, rescuer, w.work, w.func
            ));
            if w.scheduled.is_empty() {
                out.push_str("    There are no scheduled works for this worker\n");
            } else {
                out.push_str("    Scheduled work(s):\n");
                render_works(&mut out, &w.scheduled);
            }
        }
    }

    if report.pending.is_empty() {
        out.push_str("  There are no pending work items for this pwq.\n");
    } else {
        out.push_str("  pending:\n");
        render_works(&mut out, &report.pending);
    }

    if report.inactive.is_empty() {
        out.push_str("  There are no inactive works for this pwq\n");
    } else {
        out.push_str("  inactive:\n");
        render_works(&mut out, &report.inactive);
    }
    out
}

pub fn render_workqueue(report: &WorkqueueReport) -> String {
    let mut out = format!(
        "{} (struct workqueue_struct *)0x{:x}\n",
        report.name.escape_default(),
        report.address
    );
    if report.idle {
        out.push_str("  workqueue is idle\n");
    }
    for pwq in &report.busy {
        out.push_str(&render_pwq(pwq));
    }
    out
}

pub fn render_pool(report: &PoolReport) -> String {
    let mut out = format!(
        "pool: {} number of workers: {}\n",
        report.id, report.nr_workers
    );
    if report.all_idle {
        out.push_str("  All workers idle.\n");
        return out;
    }
    if let Some(pid) = report.manager_pid {
        out.push_str(&format!("  manager pid: {}\n", pid));
    }
    if !report.idle_pids.is_empty() {
        let pids: Vec<String> = report.idle_pids.iter().map(|p| p.to_string()).collect();
        out.push_str(&format!("  idle worker pids: [{}]\n", pids.join(", ")));
    }
    out
}

pub fn render_queues(report: &QueuesReport) -> String {
    let mut out = String::new();
    for wq in &report.workqueues {
        out.push_str(&render_workqueue(wq));
    }
    out.push('\n');
    for pool in &report.pools {
        out.push_str(&render_pool(pool));
    }
    out
}

// =============================================================================
// Lock reports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaiterInfo {
    pub task: TaskRef,
    pub state: char,
    pub access: Option<Access>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub kind: LockKind,
    pub address: Address,
    pub locked: bool,
    pub owner: OwnerState,
    /// Scheduler state of the owning task, when there is one.
    pub owner_state: Option<char>,
    pub waiters: Vec<WaiterInfo>,
}

/// One task's stack, or why it could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStack {
    pub pid: u32,
    pub trace: Result<String, String>,
}

pub fn render_waiters(kind: LockKind, lock: Address, waiters: &[WaiterInfo]) -> String {
    let label = kind.label();
    if waiters.is_empty() {
        return format!("  {}: {:x} has no waiters.\n", label, lock);
    }
    let mut out = format!("  The waiters of {}: {:x} are as follows:\n", label, lock);
    for w in waiters {
        let access = match w.access {
            Some(Access::Read) => " type: read",
            Some(Access::Write) => " type: write",
            None => "",
        };
        out.push_str(&format!(
            "    ({})0x{:x} pid: {}{} state: {}\n",
            TASK_PTR, w.task.address, w.task.pid, access, w.state
        ));
    }
    out
}

pub fn render_lock_info(info: &LockInfo) -> String {
    let label = info.kind.label();
    let lock = info.address;
    let mut out = match &info.owner {
        OwnerState::Free if info.kind == LockKind::RwSemaphore => {
            format!("  {}: {:x} is free.\n", label, lock)
        }
        OwnerState::Free => format!("  {}: {:x} is not locked.\n", label, lock),
        OwnerState::Task { task } => format!(
            "  {}: {:x} is owned by ({})0x{:x} pid: {} state: {}\n",
            label,
            lock,
            TASK_PTR,
            task.address,
            task.pid,
            info.owner_state.unwrap_or('?')
        ),
        OwnerState::Readers {
            readers: ReaderCount::Exact(n),
        } => format!("  {}: {:x} is owned by {} reader(s).\n", label, lock, n),
        OwnerState::Readers {
            readers: ReaderCount::AtLeastOne,
        } => format!("  {}: {:x} is owned by one or more readers.\n", label, lock),
        OwnerState::Untracked => format!("  {}: {:x} is locked.\n", label, lock),
        OwnerState::Indeterminate => {
            format!("  Can't determine type of owner for {}: {:x}.\n", label, lock)
        }
    };
    out.push_str(&render_waiters(info.kind, lock, &info.waiters));
    out
}

fn render_stack(out: &mut String, stack: &CallStack) {
    out.push_str(&format!("\ncall stack for pid: {}\n", stack.pid));
    match &stack.trace {
        Ok(trace) => out.push_str(trace),
        Err(reason) => out.push_str(reason),
    }
    out.push('\n');
}

pub fn render_waiter_call_stacks(kind: LockKind, lock: Address, stacks: &[CallStack]) -> String {
    if stacks.is_empty() {
        return format!("  {}: {:x} has no waiters.\n", kind.label(), lock);
    }
    let mut out = format!(
        "Dumping call stack for waiter(s) of {}: {:x}\n",
        kind.label(),
        lock
    );
    for stack in stacks {
        render_stack(&mut out, stack);
    }
    out
}

pub fn render_owner_call_stack(kind: LockKind, lock: Address, stack: Option<&CallStack>) -> String {
    match stack {
        Some(stack) => {
            let mut out = format!("Dumping call stack for owner of {}: {:x}\n", kind.label(), lock);
            render_stack(&mut out, stack);
            out
        }
        None => format!(
            "{}: {:x} is free or its owner could not be found reliably\n",
            kind.label(),
            lock
        ),
    }
}
