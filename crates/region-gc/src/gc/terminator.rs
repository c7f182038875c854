//! Distributed termination for a fixed team of marking workers.
//!
//! A worker that runs out of local work and fails to steal offers
//! termination. The phase ends when all `n` workers have offered at the same
//! time. A waiting worker spins, then yields, then sleeps, and after every
//! wait step checks whether work has reappeared in the queue set or whether
//! an external condition (abort, overflow, pending SATB entries) asks it to
//! leave; in either case it withdraws its offer and goes back to work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;

use super::worklist::PeekableQueues;
use crate::config::TerminationConfig;

/// External condition that makes a waiting worker leave termination.
pub trait TerminatorTerminator {
    /// Whether the waiting worker should withdraw its offer.
    fn should_exit_termination(&self) -> bool;
}

impl<F: Fn() -> bool> TerminatorTerminator for F {
    fn should_exit_termination(&self) -> bool {
        self()
    }
}

/// Termination protocol over a queue set.
pub struct ParallelTaskTerminator<Q: ?Sized> {
    n_threads: AtomicUsize,
    queue_set: Arc<Q>,
    offered: CachePadded<AtomicUsize>,
    config: TerminationConfig,
}

impl<Q: PeekableQueues + ?Sized> ParallelTaskTerminator<Q> {
    /// A terminator for `n_threads` workers sharing `queue_set`.
    #[must_use]
    pub fn new(n_threads: usize, queue_set: Arc<Q>, config: TerminationConfig) -> Self {
        Self {
            n_threads: AtomicUsize::new(n_threads),
            queue_set,
            offered: CachePadded::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Number of participating workers.
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads.load(Ordering::Relaxed)
    }

    /// Number of workers currently offering termination.
    #[must_use]
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::Acquire)
    }

    fn peek_in_queue_set(&self) -> bool {
        self.queue_set.peek()
    }

    /// Offer termination.
    ///
    /// Returns `true` once all workers have offered, meaning the phase is
    /// complete. Returns `false` after withdrawing the offer because work
    /// reappeared or `terminator` asked to exit.
    pub fn offer_termination(&self, terminator: Option<&dyn TerminatorTerminator>) -> bool {
        let n = self.n_threads();
        debug_assert!(self.offered() < n, "more offers than workers");
        self.offered.fetch_add(1, Ordering::AcqRel);

        let mut yield_count = 0u32;
        let mut hard_spin_count = 0u32;
        let mut hard_spin_limit = self.config.hard_spin_limit >> self.config.hard_spin_ratio;
        let mut hard_spin_start = hard_spin_limit;

        loop {
            debug_assert!(self.offered() <= n, "too many offers");
            if self.offered() == n {
                return true;
            }

            if yield_count <= self.config.yields_before_sleep {
                yield_count += 1;
                if hard_spin_count > self.config.hard_spin_ratio {
                    if self.config.hard_spin_limit > 0 {
                        for _ in 0..hard_spin_limit {
                            std::hint::spin_loop();
                        }
                    }
                    std::thread::yield_now();
                    hard_spin_count = 0;
                    hard_spin_start = (hard_spin_start << 1).min(self.config.hard_spin_limit);
                    hard_spin_limit = hard_spin_start;
                } else {
                    for _ in 0..hard_spin_limit {
                        std::hint::spin_loop();
                    }
                    hard_spin_count += 1;
                }
            } else {
                std::thread::sleep(Duration::from_millis(self.config.sleep_millis));
                yield_count = 0;
            }

            let exit = terminator.is_some_and(TerminatorTerminator::should_exit_termination);
            if self.peek_in_queue_set() || exit {
                // Re-check completion first: once every worker has offered,
                // nobody may withdraw.
                let mut offered = self.offered();
                loop {
                    if offered == n {
                        return true;
                    }
                    match self.offered.compare_exchange_weak(
                        offered,
                        offered - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(current) => offered = current,
                    }
                }
            }
        }
    }

    /// Prepare for another round with the same worker count.
    ///
    /// Only valid while no worker is inside [`offer_termination`](Self::offer_termination).
    pub fn reset_for_reuse(&self) {
        self.offered.store(0, Ordering::Release);
    }

    /// Prepare for another round with `n_threads` workers.
    pub fn reset_for_reuse_with(&self, n_threads: usize) {
        self.reset_for_reuse();
        self.n_threads.store(n_threads, Ordering::Relaxed);
    }
}
