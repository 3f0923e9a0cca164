//! Decoder configuration.
//!
//! Everything here is a fallback. Decoders always prefer what the target
//! itself exports (constants, symbols) and only consult [`DecoderConfig`]
//! when the snapshot is silent.
//!
//! # Example
//!
//! ```
//! use snapdecode_core::config::DecoderConfig;
//!
//! let config = DecoderConfig::default()
//!     .with_pf_wq_worker(0x20)
//!     .with_mutex_flags(0x07);
//! assert_eq!(config.symbols.worker_pool_idr, "worker_pool_idr");
//! ```
//!
//! # Environment
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `SNAPDECODE_CONFIG` | JSON file loaded by [`DecoderConfig::load`] |
//! | `SNAPDECODE_PF_WQ_WORKER` | overrides [`DecoderConfig::pf_wq_worker`] |
//! | `SNAPDECODE_MUTEX_FLAGS` | overrides [`LockConstants::mutex_flags`] |

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use snapdecode_types::env_utils::{env_string, env_u64};
use tracing::debug;

pub const CONFIG_ENV: &str = "SNAPDECODE_CONFIG";
pub const PF_WQ_WORKER_ENV: &str = "SNAPDECODE_PF_WQ_WORKER";
pub const MUTEX_FLAGS_ENV: &str = "SNAPDECODE_MUTEX_FLAGS";

/// Names of the global roots the queue graph starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolNames {
    /// Registry of all worker pools (default: `worker_pool_idr`).
    pub worker_pool_idr: String,
    /// Global list of workqueues (default: `workqueues`).
    pub workqueues: String,
    /// Per-cpu array of standard worker pools (default: `cpu_worker_pools`).
    pub cpu_worker_pools: String,
    /// Per-cpu area offsets (default: `__per_cpu_offset`).
    pub per_cpu_offset: String,
}

impl Default for SymbolNames {
    fn default() -> Self {
        Self {
            worker_pool_idr: "worker_pool_idr".to_string(),
            workqueues: "workqueues".to_string(),
            cpu_worker_pools: "cpu_worker_pools".to_string(),
            per_cpu_offset: "__per_cpu_offset".to_string(),
        }
    }
}

/// Lock-word constants used when the target does not export them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConstants {
    /// State bits packed into `mutex.owner` (default: 0x07).
    pub mutex_flags: u64,
    /// Writer bit in `rw_semaphore.count` (default: 1).
    pub rwsem_writer_locked: u64,
    /// Reader-owned bit in `rw_semaphore.owner` (default: 1).
    pub rwsem_reader_owned: u64,
    /// Anonymous-owner bit in legacy `rw_semaphore.owner` (default: 2).
    pub rwsem_anonymously_owned: u64,
    /// State bits packed into `rw_semaphore.owner` (default: 7).
    pub rwsem_owner_flags_mask: u64,
    /// Reader count shift in `rw_semaphore.count` (default: 8).
    pub rwsem_reader_shift: u64,
    /// Reader count mask in `rw_semaphore.count` (default: `!0xff`).
    pub rwsem_reader_mask: u64,
    /// `rwsem_waiter.type` of a writer (default: 0).
    pub rwsem_waiting_for_write: u64,
    /// `rwsem_waiter.type` of a reader (default: 1).
    pub rwsem_waiting_for_read: u64,
}

impl Default for LockConstants {
    fn default() -> Self {
        Self {
            mutex_flags: 0x07,
            rwsem_writer_locked: 1,
            rwsem_reader_owned: 1,
            rwsem_anonymously_owned: 2,
            rwsem_owner_flags_mask: 7,
            rwsem_reader_shift: 8,
            rwsem_reader_mask: !0xff,
            rwsem_waiting_for_write: 0,
            rwsem_waiting_for_read: 1,
        }
    }
}

/// Fallback knobs for all decoders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub symbols: SymbolNames,
    pub locks: LockConstants,
    /// `task_struct.flags` bit marking workqueue workers (default: 0x20).
    pub pf_wq_worker: u64,
    /// Standard worker pools per CPU (default: 2, normal and high priority).
    pub std_worker_pools: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            symbols: SymbolNames::default(),
            locks: LockConstants::default(),
            pf_wq_worker: 0x20,
            std_worker_pools: 2,
        }
    }
}

impl DecoderConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Defaults, then `SNAPDECODE_CONFIG`, then per-field environment overrides.
    pub fn load() -> Result<Self> {
        let config = match env_string(CONFIG_ENV) {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Apply `SNAPDECODE_PF_WQ_WORKER` and `SNAPDECODE_MUTEX_FLAGS`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(flag) = env_u64(PF_WQ_WORKER_ENV) {
            debug!(flag, "PF_WQ_WORKER overridden from environment");
            self.pf_wq_worker = flag;
        }
        if let Some(flags) = env_u64(MUTEX_FLAGS_ENV) {
            debug!(flags, "mutex flags overridden from environment");
            self.locks.mutex_flags = flags;
        }
        self
    }

    pub fn with_pf_wq_worker(mut self, flag: u64) -> Self {
        self.pf_wq_worker = flag;
        self
    }

    pub fn with_mutex_flags(mut self, flags: u64) -> Self {
        self.locks.mutex_flags = flags;
        self
    }
}
