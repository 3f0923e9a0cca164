#![allow(dead_code)]
//! Shared test utilities for integration tests.
//!
//! [`System`] is one synthetic snapshot holding a small but complete
//! workqueue setup plus a handful of locks, built with the core crate's
//! `fixtures` feature.

use std::path::PathBuf;

use snapdecode_core::fixtures::{KernelImage, LockLayout};
use snapdecode_core::{IndexMode, SnapshotImage};
use snapdecode_types::Address;
use tempfile::TempDir;

pub struct System {
    pub image: SnapshotImage,
    pub busy_wq: Address,
    pub pool: Address,
    pub pwq: Address,
    pub works: [Address; 3],
    pub held_mutex: Address,
    pub free_mutex: Address,
    pub semaphore: Address,
    pub rwsem: Address,
}

/// Build the shared scene with the pool registry in `mode`.
pub fn system(mode: IndexMode) -> System {
    system_with(mode, 8)
}

/// The shared scene on a target with `word_size`-byte pointers.
pub fn system_with(mode: IndexMode, word_size: usize) -> System {
    let mut k = KernelImage::with_geometry(word_size, 32);
    let pool = k.pool(0);
    k.pool(1);
    k.publish_pools(mode);

    let busy_wq = k.workqueue("events");
    let pwq = k.pwq(busy_wq, pool, 2);
    let idle_wq = k.workqueue("writeback");
    k.pwq(idle_wq, pool, 256);

    let worker = k.worker(pool, 40);
    let idle = k.worker(pool, 41);
    k.set_idle(idle);
    k.set_manager(pool, idle);

    let works = [
        k.work("console_callback"),
        k.work("vmstat_shepherd"),
        k.work("sync_hw_clock"),
    ];
    k.start_work(worker, pwq, works[0]);
    k.queue_work(pwq, works[1]);
    k.defer_work(pwq, works[2]);

    let owner = k.task(500, 'R', &["ext4_writepages", "mutex_lock"]);
    let blocked = k.task(501, 'D', &["schedule", "__mutex_lock", "mutex_lock"]);
    let held_mutex = k.mutex();
    k.lock_mutex(held_mutex, owner, 0x1);
    k.mutex_wait(held_mutex, blocked);
    let free_mutex = k.mutex();

    let semaphore = k.semaphore(0);
    let sem_waiter = k.task(502, 'D', &[]);
    k.semaphore_wait(semaphore, sem_waiter);

    // two readers in the combined counter
    let rwsem = k.rwsem();
    k.set_rwsem_state(rwsem, 2 << 8, 1);
    let writer = k.task(503, 'D', &["rwsem_down_write_slowpath"]);
    k.rwsem_wait(rwsem, writer, 0);

    System {
        image: k.finish(),
        busy_wq,
        pool,
        pwq,
        works,
        held_mutex,
        free_mutex,
        semaphore,
        rwsem,
    }
}

/// A system with pre-v4.10 mutexes and pre-v5.3 rw-semaphores.
pub fn legacy_lock_system() -> (SnapshotImage, Address, Address) {
    let mut k = KernelImage::new();
    k.set_lock_layout(LockLayout::Legacy);
    let owner = k.task(600, 'S', &[]);
    let lock = k.mutex();
    k.lock_mutex(lock, owner, 0);
    let rwsem = k.rwsem();
    k.set_rwsem_state(rwsem, 0xffff_ffff_0000_0002, 1);
    (k.finish(), lock, rwsem)
}

/// Serialize `image` into a temp dir; keep the dir alive for the test.
pub fn write_image(image: &SnapshotImage) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, image.to_json_string().unwrap()).unwrap();
    (dir, path)
}
