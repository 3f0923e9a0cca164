//! Workqueue commands - whole-system dump, one workqueue, one worker pool

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use snapdecode_core::report;
use snapdecode_core::QueueGraph;

use super::output::emit;
use super::Session;

fn graph(session: &Session) -> Result<QueueGraph<'_>> {
    QueueGraph::new(session.target(), &session.config).context("failed to build queue graph")
}

#[derive(Parser, Debug)]
pub struct WorkqueuesCmd {}

impl WorkqueuesCmd {
    pub fn execute(&self, session: &Session, json_output: bool) -> Result<()> {
        let report = graph(session)?
            .queues_report()
            .context("failed to walk workqueues and pools")?;
        emit(&report, json_output, report::render_queues)
    }
}

#[derive(Parser, Debug)]
pub struct WorkqueueCmd {
    /// Workqueue name (e.g. "events_unbound")
    pub name: String,
}

impl WorkqueueCmd {
    pub fn execute(&self, session: &Session, json_output: bool) -> Result<()> {
        let graph = graph(session)?;
        let wq = graph
            .find_workqueue(&self.name)?
            .ok_or_else(|| anyhow!("workqueue '{}' not found", self.name))?;
        let report = graph
            .workqueue_report(wq)
            .with_context(|| format!("failed to decode workqueue '{}'", self.name))?;
        emit(&report, json_output, report::render_workqueue)
    }
}

#[derive(Parser, Debug)]
pub struct PoolCmd {
    /// Worker pool id
    pub id: i64,
}

impl PoolCmd {
    pub fn execute(&self, session: &Session, json_output: bool) -> Result<()> {
        let graph = graph(session)?;
        let pool = graph
            .pool_index()
            .lookup(self.id)?
            .ok_or_else(|| anyhow!("worker pool {} not found", self.id))?;
        let report = graph
            .pool_report(pool)
            .with_context(|| format!("failed to decode worker pool {}", self.id))?;
        emit(&report, json_output, report::render_pool)
    }
}
