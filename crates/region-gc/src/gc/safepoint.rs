//! Stop-the-world coordination between mutators and collector pauses.
//!
//! Every mutator operation that touches the heap holds a shared
//! [`MutatorGuard`]. A pause (initial mark, remark, cleanup, full
//! compaction) takes the exclusive [`SafepointGuard`], which waits for all
//! in-flight mutator operations and blocks new ones until it is dropped.
//!
//! ## Lock Order
//!
//! | Level | Lock                     | Held by                              |
//! |-------|--------------------------|--------------------------------------|
//! | 1     | full collection lock     | `invoke_full_compaction`             |
//! | 2     | safepoint                | mutator operations, pauses           |
//! | 3     | allocation region        | `Heap::allocate`                     |
//! | 4     | free region list         | region manager                       |
//!
//! Locks are only taken in increasing level. Joining the concurrent mark
//! thread happens with no safepoint held, because that thread takes the
//! safepoint for remark and cleanup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared/exclusive gate between mutators and pauses.
#[derive(Debug, Default)]
pub struct Safepoint {
    gate: RwLock<()>,
    at_safepoint: AtomicBool,
    pauses: AtomicU64,
}

/// Held by a mutator for the duration of one heap operation.
pub struct MutatorGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Held by the collector for the duration of a pause.
pub struct SafepointGuard<'a> {
    safepoint: &'a Safepoint,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Safepoint {
    /// A safepoint with no pause in progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a mutator operation; waits while a pause is in progress.
    pub fn mutator(&self) -> MutatorGuard<'_> {
        MutatorGuard {
            _guard: self.gate.read(),
        }
    }

    /// Begin a pause; waits for in-flight mutator operations.
    pub fn begin(&self) -> SafepointGuard<'_> {
        let guard = self.gate.write();
        self.at_safepoint.store(true, Ordering::Release);
        self.pauses.fetch_add(1, Ordering::Relaxed);
        SafepointGuard {
            safepoint: self,
            _guard: guard,
        }
    }

    /// Whether a pause is in progress.
    #[must_use]
    pub fn is_at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    /// Number of pauses taken so far.
    #[must_use]
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.at_safepoint.store(false, Ordering::Release);
    }
}
