//! The sense-reversing barrier every graph node transition passes through.
//!
//! Grounded on the original library's `lm_ggml_barrier`: two monotonic
//! counters, no mutex, no allocation, seq-cst on both the arrival increment
//! and the release increment. The cache-line padding follows the
//! `CachePadding` idiom used elsewhere in this codebase's reference pack
//! for hot shared atomics (`other_examples/.../thread.rs.rs`), sized to 64
//! bytes (the common x86/ARM cache line) rather than that example's 128, to
//! match the original's `CACHE_LINE_SIZE_F32` padding of exactly one line.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicI32, Ordering};

#[repr(align(64))]
struct Aligned(AtomicI32);

/// A reusable barrier for up to [`ThreadPool`](crate::pool::ThreadPool)'s
/// `n_threads_max` workers, where the number of *participants* can change
/// between calls (set via [`set_participants`](Self::set_participants)
/// before each graph, mirroring `n_threads_cur`).
pub struct Barrier {
    n_barrier: Aligned,
    n_barrier_passed: Aligned,
    participants: AtomicI32,
}

impl Barrier {
    pub fn new(participants: usize) -> Self {
        Barrier {
            n_barrier: Aligned(AtomicI32::new(0)),
            n_barrier_passed: Aligned(AtomicI32::new(0)),
            participants: AtomicI32::new(participants as i32),
        }
    }

    /// Sets how many workers must arrive before the barrier releases. Must
    /// only be called when no worker is currently inside [`wait`](Self::wait)
    /// (i.e. between graphs, under the pool's kickoff).
    pub fn set_participants(&self, n: usize) {
        self.participants.store(n as i32, Ordering::Relaxed);
    }

    /// Blocks the calling worker until every participant has called `wait`.
    /// A single participant returns immediately without touching the
    /// counters, matching the original's single-thread fast path.
    pub fn wait(&self) {
        let n_threads = self.participants.load(Ordering::Relaxed);
        if n_threads <= 1 {
            return;
        }

        let n_passed = self.n_barrier_passed.0.load(Ordering::Relaxed);

        if self.n_barrier.0.fetch_add(1, Ordering::SeqCst) == n_threads - 1 {
            // Last arrival: reset and release everyone else.
            self.n_barrier.0.store(0, Ordering::Relaxed);
            self.n_barrier_passed.0.fetch_add(1, Ordering::SeqCst);
            return;
        }

        while self.n_barrier_passed.0.load(Ordering::Relaxed) == n_passed {
            spin_loop();
        }
        // Pair with the releaser's SeqCst fetch_add so every write made
        // before the release is visible here.
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Number of completed barrier passes. Exposed for tests; not used on
    /// the executor's hot path.
    pub fn passes(&self) -> i32 {
        self.n_barrier_passed.0.load(Ordering::Relaxed)
    }

    /// True once every arrival for the current pass has been reset to 0.
    /// Used by tests to assert the barrier is quiescent between graphs.
    pub fn is_quiescent(&self) -> bool {
        self.n_barrier.0.load(Ordering::Relaxed) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn single_participant_is_a_no_op() {
        let b = Barrier::new(1);
        b.wait();
        assert_eq!(b.passes(), 0);
    }

    #[test]
    fn sixteen_workers_pass_the_barrier_one_million_times() {
        const WORKERS: usize = 16;
        const PASSES: i32 = 1_000_000;
        let barrier = Arc::new(Barrier::new(WORKERS));
        std::thread::scope(|scope| {
            for _ in 0..WORKERS {
                let barrier = barrier.clone();
                scope.spawn(move || {
                    for _ in 0..PASSES {
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(barrier.passes(), PASSES);
        assert!(barrier.is_quiescent());
    }

    #[test]
    fn every_worker_completes_the_same_number_of_passes() {
        const WORKERS: usize = 8;
        const PASSES: i32 = 10_000;
        let barrier = Arc::new(Barrier::new(WORKERS));
        let seen = Arc::new(thread_local::ThreadLocal::new());
        std::thread::scope(|scope| {
            for _ in 0..WORKERS {
                let barrier = barrier.clone();
                let seen = seen.clone();
                scope.spawn(move || {
                    let mut local = 0;
                    for _ in 0..PASSES {
                        barrier.wait();
                        local += 1;
                    }
                    seen.get_or(|| std::cell::Cell::new(0)).set(local);
                });
            }
        });
        let seen = Arc::try_unwrap(seen).unwrap_or_else(|_| panic!("worker threads still hold a reference"));
        let totals: Vec<i32> = seen.into_iter().map(std::cell::Cell::into_inner).collect();
        assert_eq!(totals.len(), WORKERS);
        assert!(totals.iter().all(|&n| n == PASSES));
    }

    #[test]
    fn every_worker_observes_writes_made_before_the_barrier() {
        let barrier = Arc::new(Barrier::new(4));
        let flags: Arc<Vec<AtomicI32>> = Arc::new((0..4).map(|_| AtomicI32::new(0)).collect());
        std::thread::scope(|scope| {
            for i in 0..4 {
                let barrier = barrier.clone();
                let flags = flags.clone();
                scope.spawn(move || {
                    flags[i].store(1, Ordering::Relaxed);
                    barrier.wait();
                    let total: i32 = flags.iter().map(|f| f.load(Ordering::Relaxed)).sum();
                    assert_eq!(total, 4);
                });
            }
        });
    }
}
