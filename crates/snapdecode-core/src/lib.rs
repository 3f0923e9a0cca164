//! Snapshot decoders for kernel bookkeeping structures.
//!
//! Given read access to a memory snapshot and its type description, this crate
//! answers four kinds of question:
//!
//! - **ID registries** ([`idindex`]): which pointer is registered under an id
//!   in a `struct idr`, in either of its two historical encodings
//! - **Tagged words** ([`tagged`]): what a `work_struct.data` word points at
//! - **Work queues** ([`workqueue`]): which work items are in flight, pending
//!   or inactive, per pwq, workqueue and pool
//! - **Locks** ([`locks`]): who owns a mutex, semaphore or rw-semaphore, and
//!   who waits on it
//!
//! All access to the snapshot goes through the collaborator traits in
//! [`oracle`]. [`image::SnapshotImage`] implements all of them over a
//! JSON-serialized image.
//!
//! ## Caveats
//!
//! Decoders assume a consistent snapshot. On a live target the structures can
//! change under the reader, so results there are best effort. List walks do
//! no cycle detection; a corrupted list that loops back on itself without
//! reaching its head is walked forever.

pub mod config;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod idindex;
pub mod image;
pub mod lists;
pub mod locks;
pub mod oracle;
pub mod probe;
pub mod report;
pub mod tagged;
pub mod workqueue;

pub use config::DecoderConfig;
pub use idindex::{IdIndex, IndexMode};
pub use image::SnapshotImage;
pub use locks::{LockInspector, LockKind, OwnerState};
pub use oracle::{MemoryOracle, Scalar, TaskTable, Target, TypeLayout};
pub use tagged::{TagLayout, TaggedPointer};
pub use workqueue::{ItemState, QueueGraph};
