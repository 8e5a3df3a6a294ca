//! The persistent worker pool.
//!
//! The coordination shape (a mutex-guarded critical section plus a condvar
//! for parking idle workers) is the same one this codebase already used for
//! its node-starvation handling in `solver/barrier.rs`'s `Shared`/`Critical`
//! pair — `parking_lot::{Mutex, Condvar}`, one shared struct, workers spawned
//! once and looping until told to stop. The lifecycle state machine itself
//! (sleeping → polling → active → exiting) and the hybrid poll-then-wait
//! idle strategy are grounded on the original library's
//! `lm_ggml_graph_compute_thread_ready`, `_poll_for_work`,
//! `_check_for_work`, and `lm_ggml_graph_compute_secondary_thread`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bitset_fixed::BitSet;
use parking_lot::{Condvar, Mutex};

use crate::barrier::Barrier;
use crate::numa::NumaStrategy;

/// How many spin iterations a worker polls before falling back to a
/// condvar wait. The original defaults `poll` to a few tens of
/// milliseconds' worth of spinning; this crate keeps the same knob.
const POLL_ROUNDS_PER_UNIT: u32 = 128 * 1024;

/// Construction parameters for a [`ThreadPool`] — this crate's equivalent
/// of a configuration layer (`SPEC_FULL.md` §2.1): there is no on-disk
/// config, so the pool's builder is the whole configuration surface,
/// following this codebase's `with_*`-consuming-builder convention
/// (`solver/barrier.rs`'s `custom`/`with_nb_threads`).
#[derive(Clone)]
pub struct PoolParams {
    pub n_threads: usize,
    pub cpu_mask: Option<BitSet>,
    pub priority: i32,
    /// Spin-poll budget before a worker parks on the condvar, in units of
    /// [`POLL_ROUNDS_PER_UNIT`] iterations. `0` disables polling entirely.
    /// Defaults from [`kmp_blocktime_ms`]'s reading of `KMP_BLOCKTIME`.
    pub poll: u32,
    pub start_paused: bool,
    pub numa_strategy: NumaStrategy,
}

/// Reads the `KMP_BLOCKTIME` environment variable once, the idiomatic way
/// (`std::env::var`), defaulting to `200` when it's unset or not a valid
/// `u32` — the original OpenMP-runtime knob for how long an idle thread
/// spins (in milliseconds) before yielding the CPU. This crate has no
/// OpenMP backend to forward the value to, so it surfaces only as
/// `PoolParams::default`'s `poll` value; a library must not mutate
/// process-wide environment state as a side effect of being linked, so
/// this only ever reads the variable, never sets it.
fn kmp_blocktime_ms() -> u32 {
    std::env::var("KMP_BLOCKTIME").ok().and_then(|v| v.parse().ok()).unwrap_or(200)
}

impl Default for PoolParams {
    fn default() -> Self {
        PoolParams {
            n_threads: num_cpus::get(),
            cpu_mask: None,
            priority: 0,
            poll: kmp_blocktime_ms(),
            start_paused: false,
            numa_strategy: NumaStrategy::Disabled,
        }
    }
}

impl PoolParams {
    pub fn with_n_threads(mut self, n: usize) -> Self {
        self.n_threads = n;
        self
    }

    pub fn with_poll(mut self, poll: u32) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn paused(mut self) -> Self {
        self.start_paused = true;
        self
    }
}

/// A type-erased per-round job: `f(ith, nth)`. Stored behind a raw pointer
/// because the pool's worker threads are persistent (spawned once, living
/// far longer than any single graph) while the jobs they run borrow data
/// (a graph, a scratch buffer) that is only valid for one
/// [`ThreadPool::execute`] call.
///
/// # Safety invariant
/// [`ThreadPool::execute`] does not return until every participating
/// worker has returned from the stored job. This is not left to the job
/// itself to arrange: `execute` wraps the caller's `f` in a closure that
/// appends one [`Barrier::wait`] call, so every participant — including
/// ones that never touch the barrier on their own — rendezvous there
/// before `execute` unlocks `job` and the caller's closure (often a
/// stack temporary, see `executor.rs`) goes out of scope. That means the
/// borrows captured by the job outlive every point at which a worker
/// thread can dereference this pointer, which is what makes the erasure
/// below sound — the same "block until the scope completes" argument
/// `std::thread::scope` itself relies on, applied here to a pool that
/// outlives any one call instead of being spawned per-call.
type RawJob = *const (dyn Fn(usize, usize) + Sync);

struct PoolShared {
    n_threads_max: usize,
    n_threads_cur: AtomicUsize,
    n_graph: AtomicU64,
    current_chunk: AtomicI32,
    abort: AtomicI32,
    stop: AtomicBool,
    pause: AtomicBool,
    poll: u32,
    barrier: Barrier,
    job: Mutex<Option<RawJob>>,
    idle: Mutex<()>,
    cond: Condvar,
}

// SAFETY: `RawJob` pointers stored in `job` are only ever dereferenced while
// the submitting `execute` call is still on the stack, per the invariant
// documented on `RawJob`.
unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

/// Owns `n_threads - 1` persistent background workers; the caller's own
/// thread doubles as worker 0 for every [`execute`](Self::execute) call,
/// exactly as the original's main thread runs
/// `lm_ggml_graph_compute_thread` directly instead of spawning an extra
/// thread for itself.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    params: PoolParams,
}

impl ThreadPool {
    pub fn new(params: PoolParams) -> Self {
        if !matches!(params.numa_strategy, NumaStrategy::Disabled) {
            crate::numa::numa_init(params.numa_strategy);
        }

        let shared = Arc::new(PoolShared {
            n_threads_max: params.n_threads,
            n_threads_cur: AtomicUsize::new(params.n_threads),
            n_graph: AtomicU64::new(0),
            current_chunk: AtomicI32::new(0),
            abort: AtomicI32::new(-1),
            stop: AtomicBool::new(false),
            pause: AtomicBool::new(params.start_paused),
            poll: params.poll,
            barrier: Barrier::new(params.n_threads),
            job: Mutex::new(None),
            idle: Mutex::new(()),
            cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(params.n_threads.saturating_sub(1));
        for ith in 1..params.n_threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tensorops-worker-{ith}"))
                .spawn(move || worker_loop(shared, ith))
                .expect("failed to spawn pool worker thread");
            workers.push(handle);
        }

        log::debug!("thread pool started with {} threads (1 main + {} background)", params.n_threads, workers.len());

        ThreadPool { shared, workers, params }
    }

    pub fn n_threads_max(&self) -> usize {
        self.shared.n_threads_max
    }

    pub fn barrier(&self) -> &Barrier {
        &self.shared.barrier
    }

    pub fn current_chunk(&self) -> &AtomicI32 {
        &self.shared.current_chunk
    }

    /// Index of the first node the executor must not run, or `-1` to run
    /// every node. Latched by the abort callback (§4.6); cleared by
    /// [`reset_abort`](Self::reset_abort) before the next graph.
    pub fn abort_index(&self) -> &AtomicI32 {
        &self.shared.abort
    }

    pub fn reset_abort(&self) {
        self.shared.abort.store(-1, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.load(Ordering::Relaxed)
    }

    /// Parks every worker in a condvar wait. Must not be called while an
    /// `execute` is in flight.
    pub fn pause(&self) {
        self.shared.pause.store(true, Ordering::Relaxed);
        log::debug!("thread pool paused");
    }

    pub fn resume(&self) {
        self.shared.pause.store(false, Ordering::Relaxed);
        self.shared.cond.notify_all();
        log::debug!("thread pool resumed");
    }

    /// Kicks off one round: `n_threads` workers (including the calling
    /// thread, as worker 0) each call `f(ith, n_threads)`. Does not return
    /// until every worker has returned from `f` — see the safety note on
    /// [`RawJob`]. Every participant hits one [`Barrier::wait`] right after
    /// `f` returns, whether or not `f` barriers internally, so callers never
    /// need to remember to self-barrier to keep the raw job pointer sound.
    pub fn execute(&self, n_threads: usize, f: &(dyn Fn(usize, usize) + Sync)) {
        assert!(n_threads >= 1 && n_threads <= self.shared.n_threads_max, "n_threads out of range");
        assert!(!self.shared.pause.load(Ordering::Relaxed), "cannot execute on a paused pool");

        let barrier = &self.shared.barrier;
        let job = |ith: usize, nth: usize| {
            f(ith, nth);
            barrier.wait();
        };

        // SAFETY: erasing the borrow's lifetime here is sound per the
        // invariant documented on `RawJob` — `execute` does not return
        // (and `job` does not go out of scope) until every participant
        // has returned from the stored job.
        let erased: RawJob = unsafe {
            std::mem::transmute::<&(dyn Fn(usize, usize) + Sync), RawJob>(&job)
        };
        *self.shared.job.lock() = Some(erased);
        self.shared.barrier.set_participants(n_threads);
        self.shared.n_threads_cur.store(n_threads, Ordering::Relaxed);
        self.shared.n_graph.fetch_add(1, Ordering::SeqCst);
        self.shared.cond.notify_all();

        log::trace!("kickoff: n_threads={n_threads}");
        job(0, n_threads);
        // `job`'s trailing barrier has released by the time it returns, so
        // every other participating worker has also returned from it here.
        *self.shared.job.lock() = None;
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.shared.pause.store(false, Ordering::Relaxed);
        self.shared.cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        log::debug!("thread pool with {} threads stopped", self.params.n_threads);
    }
}

fn worker_loop(shared: Arc<PoolShared>, ith: usize) {
    let mut last_graph = 0u64;
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }

        match poll_for_work(&shared, ith, last_graph) {
            Some(g) => last_graph = g,
            None => match wait_for_work(&shared, ith, last_graph) {
                WaitOutcome::Stop => return,
                WaitOutcome::Ready(g) => last_graph = g,
            },
        }

        if shared.stop.load(Ordering::Relaxed) {
            return;
        }

        let job = *shared.job.lock();
        if let Some(job) = job {
            // SAFETY: see the invariant documented on `RawJob`.
            unsafe { (*job)(ith, shared.n_threads_cur.load(Ordering::Relaxed)) };
        }
    }
}

/// Spins for a bounded number of iterations looking for a new graph
/// generation this worker should participate in. Returns the new
/// generation if found, `None` if the poll budget ran out.
fn poll_for_work(shared: &PoolShared, ith: usize, last_graph: u64) -> Option<u64> {
    let rounds = shared.poll as u64 * POLL_ROUNDS_PER_UNIT as u64;
    for _ in 0..rounds {
        if shared.stop.load(Ordering::Relaxed) || shared.pause.load(Ordering::Relaxed) {
            return None;
        }
        let g = shared.n_graph.load(Ordering::SeqCst);
        if g != last_graph && ith < shared.n_threads_cur.load(Ordering::Relaxed) {
            return Some(g);
        }
        std::hint::spin_loop();
    }
    None
}

enum WaitOutcome {
    Stop,
    Ready(u64),
}

fn wait_for_work(shared: &PoolShared, ith: usize, last_graph: u64) -> WaitOutcome {
    let mut idle = shared.idle.lock();
    loop {
        if shared.stop.load(Ordering::Relaxed) {
            return WaitOutcome::Stop;
        }
        let g = shared.n_graph.load(Ordering::SeqCst);
        if !shared.pause.load(Ordering::Relaxed) && g != last_graph && ith < shared.n_threads_cur.load(Ordering::Relaxed) {
            return WaitOutcome::Ready(g);
        }
        shared.cond.wait(&mut idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn kmp_blocktime_env_var_overrides_the_two_hundred_millisecond_default() {
        std::env::remove_var("KMP_BLOCKTIME");
        assert_eq!(kmp_blocktime_ms(), 200);
        std::env::set_var("KMP_BLOCKTIME", "7");
        assert_eq!(kmp_blocktime_ms(), 7);
        std::env::set_var("KMP_BLOCKTIME", "not a number");
        assert_eq!(kmp_blocktime_ms(), 200);
        std::env::remove_var("KMP_BLOCKTIME");
    }

    #[test]
    fn execute_runs_every_worker_exactly_once() {
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(4));
        let counter = StdAtomicUsize::new(0);
        pool.execute(4, &|ith, nth| {
            assert!(ith < nth);
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn execute_with_fewer_threads_than_max_only_wakes_that_many() {
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(4));
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        pool.execute(2, &move |ith, _nth| {
            seen2.lock().push(ith);
        });
        let mut v = seen.lock().clone();
        v.sort();
        assert_eq!(v, vec![0, 1]);
    }

    #[test]
    fn pause_then_resume_still_completes_a_round() {
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(2));
        pool.pause();
        std::thread::sleep(std::time::Duration::from_millis(20));
        pool.resume();
        let counter = StdAtomicUsize::new(0);
        pool.execute(2, &|_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn running_several_rounds_reuses_the_same_barrier_each_time() {
        let pool = ThreadPool::new(PoolParams::default().with_n_threads(3));
        for _ in 0..5 {
            pool.execute(3, &|ith, nth| {
                let _ = (ith, nth);
            });
        }
        assert!(pool.barrier().is_quiescent());
    }
}
