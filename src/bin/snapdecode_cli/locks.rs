//! Lock commands - owners, waiters and call stacks of mutexes, semaphores
//! and rw-semaphores

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use serde::Serialize;
use snapdecode_core::locks::{LockInspector, LockKind};
use snapdecode_core::report::{self, CallStack, WaiterInfo};
use snapdecode_types::encoding::{format_address, parse_address};
use snapdecode_types::Address;

use super::output::emit;
use super::Session;

#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("view").args(["info", "waiter_list", "waiter_callstack", "owner_callstack"])))]
pub struct LockCmd {
    /// Lock addresses (hex, with or without 0x)
    #[arg(required = true)]
    pub addresses: Vec<String>,

    /// Owner and waiters (default)
    #[arg(long)]
    pub info: bool,

    /// Waiting tasks only
    #[arg(long)]
    pub waiter_list: bool,

    /// Call stack of every waiting task
    #[arg(long)]
    pub waiter_callstack: bool,

    /// Call stack of the owning task
    #[arg(long)]
    pub owner_callstack: bool,
}

#[derive(Serialize)]
struct WaiterList {
    address: Address,
    waiters: Vec<WaiterInfo>,
}

#[derive(Serialize)]
struct WaiterStacks {
    address: Address,
    stacks: Vec<CallStack>,
}

#[derive(Serialize)]
struct OwnerStack {
    address: Address,
    stack: Option<CallStack>,
}

impl LockCmd {
    pub fn execute(&self, session: &Session, kind: LockKind, json_output: bool) -> Result<()> {
        let locks = LockInspector::new(session.target(), &session.config.locks);
        let addresses = self
            .addresses
            .iter()
            .map(|a| parse_address(a, &format!("{} address", kind.label())))
            .collect::<Result<Vec<_>>>()?;

        for lock in addresses {
            let context = || format!("failed to decode {} at {}", kind.label(), format_address(lock));
            if self.waiter_list {
                let waiters = locks.waiter_infos(kind, lock).with_context(context)?;
                let list = WaiterList {
                    address: lock,
                    waiters,
                };
                emit(&list, json_output, |l| {
                    report::render_waiters(kind, l.address, &l.waiters)
                })?;
            } else if self.waiter_callstack {
                let stacks = WaiterStacks {
                    address: lock,
                    stacks: locks.waiter_call_stacks(kind, lock).with_context(context)?,
                };
                emit(&stacks, json_output, |s| {
                    report::render_waiter_call_stacks(kind, s.address, &s.stacks)
                })?;
            } else if self.owner_callstack {
                let stack = OwnerStack {
                    address: lock,
                    stack: locks.owner_call_stack(kind, lock).with_context(context)?,
                };
                emit(&stack, json_output, |s| {
                    report::render_owner_call_stack(kind, s.address, s.stack.as_ref())
                })?;
            } else {
                let info = locks.info(kind, lock).with_context(context)?;
                emit(&info, json_output, report::render_lock_info)?;
            }
        }
        Ok(())
    }
}
