//! snapdecode
//!
//! Offline introspection of kernel bookkeeping structures in a memory
//! snapshot:
//!
//! - **ID registries**: `struct idr` lookups and ordered iteration
//! - **Work queues**: in-flight, pending and inactive work per pwq, workqueue
//!   and worker pool
//! - **Locks**: owners and waiters of mutexes, semaphores and rw-semaphores
//!
//! The decoders live in [`snapdecode_core`]; this crate re-exports them and
//! ships the `snapdecode` command-line tool.

pub use snapdecode_core::{
    config, idindex, image, lists, locks, oracle, probe, report, tagged, workqueue,
};
pub use snapdecode_core::{
    DecoderConfig, IdIndex, IndexMode, ItemState, LockInspector, LockKind, OwnerState,
    QueueGraph, SnapshotImage, TagLayout, TaggedPointer, Target,
};
pub use snapdecode_types::{Address, DecodeError, DecodeResult, TaskRef};
