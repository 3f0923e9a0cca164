//! Shared types for the snapdecode workspace.
//!
//! This crate holds the vocabulary every other crate speaks: target addresses,
//! task references, and the structural [`DecodeError`]. It has no knowledge of
//! how memory is read; that lives in `snapdecode-core`.
//!
//! ## Modules
//!
//! - [`error`] - [`DecodeError`] and the [`DecodeResult`] alias
//! - [`encoding`] - Hex parsing and formatting for addresses and byte blobs
//! - [`env_utils`] - Typed environment variable parsing

pub mod encoding;
pub mod env_utils;
pub mod error;

pub use error::{DecodeError, DecodeResult};

use serde::{Deserialize, Serialize};

/// A virtual address inside the traced system.
///
/// Always 64 bits wide on the host, regardless of the target's word width.
pub type Address = u64;

/// A task (thread) of the traced system, as seen from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    /// Address of the task descriptor in the snapshot
    pub address: Address,
    /// Task id
    pub pid: u32,
}

impl TaskRef {
    pub fn new(address: Address, pid: u32) -> Self {
        Self { address, pid }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x} (pid {})", self.address, self.pid)
    }
}
