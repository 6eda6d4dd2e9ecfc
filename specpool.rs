//! Speculative work-stealing thread pool with private per-worker run-queues.
//!
//! Specpool targets fork/join and data-parallel workloads made of many short,
//! dynamically generated tasks, where the tasks themselves enqueue follow-up
//! work. Every worker owns a bounded ring queue whose hot end only the owner
//! may touch, so the common case of a task forking children onto its own
//! worker needs no global mutex and no wake-up call. The pool is
//! "speculative" in exactly that sense: a worker pushing onto its own queue
//! skips the notification, betting that it will pop the task itself moments
//! later.
//!
//! ### Task routing
//!
//! | Caller               | Route                              | Ordering |
//! |----------------------|------------------------------------|----------|
//! | pool worker          | own queue, hot end (`push_front`)  | LIFO     |
//! | owner / other thread | round-robin victim (`push_back`)   | none     |
//! | any, on a full queue | global overflow FIFO               | FIFO     |
//!
//! Idle workers scan in a fixed order: own queue, then every peer exactly
//! once (xorshift-seeded start, coprime stride), then the overflow queue,
//! and only then park on their condition variable. The last worker to go
//! idle re-checks every queue before declaring the pool quiescent, which is
//! what lets [`ThreadPool::wait_for_all`] return without missing work that
//! was still in flight.
//!
//! ### Example
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use specpool::ThreadPool;
//!
//! let pool = ThreadPool::try_spawn(4).expect("spawning workers");
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..1_000 {
//!     let counter = Arc::clone(&counter);
//!     pool.silent_async(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//! pool.wait_for_all().expect("called from the owning thread");
//! assert_eq!(counter.load(Ordering::Relaxed), 1_000);
//! ```
//!
//! Tasks that need to fork hold the pool through an [`Arc`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use specpool::ThreadPool;
//!
//! let pool = Arc::new(ThreadPool::try_spawn(2).expect("spawning workers"));
//! let forker = Arc::clone(&pool);
//! pool.silent_async(move || {
//!     for _ in 0..100 {
//!         forker.silent_async(|| { /* child work */ });
//!     }
//! });
//! pool.wait_for_all().expect("called from the owning thread");
//! ```
//!
//! Lifecycle operations (`wait_for_all`, `shutdown`, `spawn`) are reserved
//! for the thread that constructed the pool; any other caller gets
//! [`Error::NotOwner`]. Submissions are allowed from everywhere.

use core::fmt::Write as _;
use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, Receiver};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

/// A submitted unit of work: move-only, single-shot.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Capacity of each worker's private run-queue.
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A lifecycle operation was invoked from a thread other than the one
    /// that constructed the pool.
    #[error("only the owning thread may manage the pool")]
    NotOwner,
    /// The operating system refused to start a worker thread.
    #[error("thread-spawn failure: {0}")]
    Spawn(#[from] io::Error),
}

// Slot states. BUSY is a mutual-exclusion token held by whichever side won
// the claiming CAS; it is never observable as a resting state for long.
const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded ring with asymmetric access: the owning worker drives the front
/// (lock-free, LIFO), while any thread may visit the back under the queue's
/// internal mutex (stealers use a try-lock and give up on contention).
///
/// Positions are counted modulo `2N` so that `front == back` means empty
/// without ambiguity; the slot index is `pos & (N - 1)`. Occupancy is
/// decided by the per-slot state byte, never by inspecting the payload, so
/// fullness needs no extra bookkeeping: pushing into a non-EMPTY slot simply
/// fails and the caller spills to the overflow queue.
///
/// The back grows downward (push claims `(back - 1) & mask` and decrements,
/// pop reads `back & mask` and increments), the front grows upward. The two
/// ends chase each other around the ring and meet exactly when the queue
/// drains.
struct RunQueue<T, const N: usize> {
    back_lock: Mutex<()>,
    front: CachePadded<AtomicU32>,
    back: CachePadded<AtomicU32>,
    slots: [Slot<T>; N],
}

// SAFETY: slot payloads are only touched by the thread that won the
// EMPTY->BUSY or READY->BUSY transition on that slot's state byte, so the
// queue may be shared freely as long as the payload itself can cross threads.
unsafe impl<T: Send, const N: usize> Send for RunQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for RunQueue<T, N> {}

impl<T, const N: usize> RunQueue<T, N> {
    const IDX_MASK: u32 = {
        assert!(N > 2, "queue capacity must be larger than two");
        assert!(N & (N - 1) == 0, "queue capacity must be a power of two");
        assert!(N <= 1 << 30, "queue capacity must leave room for 2N positions");
        (N as u32) - 1
    };
    const POS_MASK: u32 = ((N as u32) << 1) - 1;

    fn new() -> Self {
        Self {
            back_lock: Mutex::new(()),
            front: CachePadded::new(AtomicU32::new(0)),
            back: CachePadded::new(AtomicU32::new(0)),
            slots: std::array::from_fn(|_| Slot {
                state: AtomicU8::new(EMPTY),
                payload: UnsafeCell::new(MaybeUninit::uninit()),
            }),
        }
    }

    /// Insert at the hot end. Owner thread only.
    ///
    /// Returns the value back when the target slot is occupied, which covers
    /// both "queue full" and "a stealer still holds the slot BUSY".
    fn push_front(&self, value: T) -> Result<(), T> {
        let front = self.front.load(Ordering::Relaxed);
        let slot = &self.slots[(front & Self::IDX_MASK) as usize];
        if slot.state.load(Ordering::Relaxed) != EMPTY
            || slot
                .state
                .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return Err(value);
        }
        // SAFETY: winning the EMPTY->BUSY transition grants exclusive access
        // to the payload until we publish a new state below.
        unsafe { (*slot.payload.get()).write(value) };
        self.front
            .store(front.wrapping_add(1) & Self::POS_MASK, Ordering::Relaxed);
        slot.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Remove from the hot end. Owner thread only.
    fn pop_front(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let front = self.front.load(Ordering::Relaxed);
        let slot = &self.slots[(front.wrapping_sub(1) & Self::IDX_MASK) as usize];
        if slot.state.load(Ordering::Relaxed) != READY
            || slot
                .state
                .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return None;
        }
        // SAFETY: a READY slot holds an initialized payload, and winning the
        // READY->BUSY transition makes this thread its only reader.
        let value = unsafe { (*slot.payload.get()).assume_init_read() };
        self.front
            .store(front.wrapping_sub(1) & Self::POS_MASK, Ordering::Relaxed);
        slot.state.store(EMPTY, Ordering::Release);
        Some(value)
    }

    /// Insert at the cold end. Any thread; blocks on the back mutex.
    fn push_back(&self, value: T) -> Result<(), T> {
        let _back_guard = self.back_lock.lock();
        let back = self.back.load(Ordering::Relaxed);
        let slot = &self.slots[(back.wrapping_sub(1) & Self::IDX_MASK) as usize];
        if slot.state.load(Ordering::Relaxed) != EMPTY
            || slot
                .state
                .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return Err(value);
        }
        // SAFETY: as in push_front, BUSY makes this thread the sole writer.
        unsafe { (*slot.payload.get()).write(value) };
        self.back
            .store(back.wrapping_sub(1) & Self::POS_MASK, Ordering::Relaxed);
        slot.state.store(READY, Ordering::Release);
        Ok(())
    }

    /// Remove the oldest element. Any thread; fails fast instead of
    /// blocking, so a stealing worker moves on to the next victim.
    fn pop_back(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let _back_guard = self.back_lock.try_lock()?;
        let back = self.back.load(Ordering::Relaxed);
        let slot = &self.slots[(back & Self::IDX_MASK) as usize];
        if slot.state.load(Ordering::Relaxed) != READY
            || slot
                .state
                .compare_exchange(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
        {
            return None;
        }
        // SAFETY: as in pop_front.
        let value = unsafe { (*slot.payload.get()).assume_init_read() };
        self.back
            .store(back.wrapping_add(1) & Self::POS_MASK, Ordering::Relaxed);
        slot.state.store(EMPTY, Ordering::Release);
        Some(value)
    }

    /// Approximate emptiness check. Deliberately racy: both counters are
    /// read relaxed, and callers must tolerate stale answers in either
    /// direction.
    fn is_empty(&self) -> bool {
        self.front.load(Ordering::Relaxed) == self.back.load(Ordering::Relaxed)
    }
}

impl<T, const N: usize> Drop for RunQueue<T, N> {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if *slot.state.get_mut() == READY {
                // SAFETY: READY slots hold initialized payloads, and &mut
                // self guarantees nobody else is touching them.
                unsafe { slot.payload.get_mut().assume_init_drop() };
            }
        }
    }
}

/// One executor thread's state: its private run-queue and the condition
/// variable it parks on (paired with the pool mutex).
struct Worker {
    queue: RunQueue<Task, QUEUE_DEPTH>,
    cv: Condvar,
}

impl Worker {
    fn new() -> Self {
        Self {
            queue: RunQueue::new(),
            cv: Condvar::new(),
        }
    }
}

/// Worker set plus everything derived from its size. Mutated only at
/// quiescence (spawn/shutdown) under the write lock; hot paths take brief
/// read locks. `coprimes` and `thread_map` are rebuilt whenever `workers`
/// changes, under the same write lock.
struct Registry {
    workers: Vec<Arc<Worker>>,
    coprimes: Vec<usize>,
    thread_map: HashMap<ThreadId, usize>,
}

impl Registry {
    /// Index of the first worker whose queue is observably non-empty.
    fn first_nonempty(&self) -> Option<usize> {
        self.workers.iter().position(|w| !w.queue.is_empty())
    }
}

/// State guarded by the pool mutex.
struct PoolState {
    overflow: VecDeque<Task>,
    idle_workers: usize,
    wait_for_all: bool,
    sync: bool,
    exiting: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    quiescence_cv: Condvar,
    registry: RwLock<Registry>,
    next_queue: AtomicUsize,
    owner: ThreadId,
}

/// Marsaglia's xorshift32. The state must never be zero; worker seeds start
/// at `index + 1`.
fn xorshift32(x: &mut u32) {
    *x ^= *x << 13;
    *x ^= *x >> 17;
    *x ^= *x << 5;
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// All strides in `[1, n]` coprime with `n`. Walking `start, start + k,
/// start + 2k, …` (mod `n`) with such a stride visits every index exactly
/// once, so a steal scan covers the whole pool from a pseudo-random start.
fn coprimes_of(n: usize) -> Vec<usize> {
    (1..=n).filter(|&k| gcd(k, n) == 1).collect()
}

/// One full pseudo-random scan over every worker's back end. Returns on the
/// first successful steal; `None` after exactly `W` failed probes.
fn steal(shared: &Shared, seed: &mut u32) -> Option<Task> {
    let registry = shared.registry.read();
    let count = registry.workers.len();
    if count == 0 {
        return None;
    }
    xorshift32(seed);
    let stride = registry.coprimes[*seed as usize % registry.coprimes.len()];
    let mut victim = *seed as usize % count;
    for _ in 0..count {
        if let Some(task) = registry.workers[victim].queue.pop_back() {
            return Some(task);
        }
        victim += stride;
        if victim >= count {
            victim -= count;
        }
    }
    None
}

/// The scheduling loop: local pop, steal, overflow drain, park. Tasks run
/// with no pool locks held. The loop exits when it observes the exit flag
/// after a fruitless scan.
fn worker_loop(shared: Arc<Shared>, me: Arc<Worker>, index: usize) {
    let mut seed = index as u32 + 1;
    loop {
        if let Some(task) = me.queue.pop_front() {
            task();
            continue;
        }
        if let Some(task) = steal(&shared, &mut seed) {
            trace!(worker = index, "stole a task");
            task();
            continue;
        }

        let mut state = shared.state.lock();
        if state.exiting {
            trace!(worker = index, "exiting");
            return;
        }
        if let Some(task) = state.overflow.pop_front() {
            drop(state);
            trace!(worker = index, "drained overflow");
            task();
            continue;
        }

        state.idle_workers += 1;
        let registry = shared.registry.read();
        if state.idle_workers == registry.workers.len() && state.wait_for_all {
            // Last worker to go idle: verify the pool really is drained.
            match registry.first_nonempty() {
                // The residual work is ours; the earlier pop was a spurious
                // miss. Withdraw from idleness and rescan.
                Some(j) if j == index => {
                    state.idle_workers -= 1;
                    continue;
                }
                // A peer still has queued work it may never have been told
                // about; re-arm it before parking.
                Some(j) => {
                    registry.workers[j].cv.notify_one();
                }
                None => {
                    state.sync = true;
                    shared.quiescence_cv.notify_one();
                }
            }
        }
        drop(registry);
        trace!(worker = index, "parking");
        me.cv.wait(&mut state);
        state.idle_workers -= 1;
    }
}

/// The pool: a set of worker threads, their queues, the overflow FIFO, and
/// the quiescence machinery. See the crate docs for the scheduling model.
///
/// All operations take `&self`; share the pool into tasks or other threads
/// with an [`Arc`]. Lifecycle operations ([`wait_for_all`], [`shutdown`],
/// [`spawn`]) are restricted to the constructing thread at runtime and
/// return [`Error::NotOwner`] elsewhere.
///
/// Dropping the pool shuts it down, draining queued tasks and joining every
/// worker thread.
///
/// [`wait_for_all`]: ThreadPool::wait_for_all
/// [`shutdown`]: ThreadPool::shutdown
/// [`spawn`]: ThreadPool::spawn
pub struct ThreadPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    name: String,
}

impl ThreadPool {
    /// Creates a pool with `workers` executor threads.
    ///
    /// `workers == 0` is legal: every submission then executes inline on the
    /// calling thread.
    pub fn try_spawn(workers: usize) -> Result<Self, Error> {
        Self::try_named_spawn("specpool", workers)
    }

    /// Creates a pool whose worker threads are named `{name}-{index:03}`.
    pub fn try_named_spawn(name: &str, workers: usize) -> Result<Self, Error> {
        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    overflow: VecDeque::new(),
                    idle_workers: 0,
                    wait_for_all: false,
                    sync: false,
                    exiting: false,
                }),
                quiescence_cv: Condvar::new(),
                registry: RwLock::new(Registry {
                    workers: Vec::new(),
                    coprimes: Vec::new(),
                    thread_map: HashMap::new(),
                }),
                next_queue: AtomicUsize::new(0),
                owner: thread::current().id(),
            }),
            threads: Mutex::new(Vec::new()),
            name: name.to_owned(),
        };
        if workers > 0 {
            pool.spawn_workers(workers)?;
        }
        Ok(pool)
    }

    /// Fire-and-forget submission.
    ///
    /// Called from a pool worker, the task lands on that worker's own queue
    /// without waking anyone; called from the owner or an external thread,
    /// it is routed round-robin to some worker's cold end and that worker is
    /// notified. Tasks that do not fit anywhere spill to the overflow FIFO.
    pub fn silent_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(f));
    }

    /// Submission returning a handle to the task's result.
    ///
    /// With zero workers the closure runs inline and the returned future is
    /// already fulfilled.
    pub fn async_task<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        if self.num_workers() == 0 {
            let _ = tx.send(f());
            return TaskFuture { result: rx };
        }
        self.silent_async(move || {
            let _ = tx.send(f());
        });
        TaskFuture { result: rx }
    }

    /// Blocks the owner until every worker is parked and every queue,
    /// per-worker and overflow alike, is empty. Tasks submitted before this
    /// have all executed once it returns.
    ///
    /// A second call with no intervening submission returns immediately.
    pub fn wait_for_all(&self) -> Result<(), Error> {
        self.check_owner()?;
        self.wait_for_all_impl();
        Ok(())
    }

    /// Quiesces the pool, then terminates and joins every worker thread.
    ///
    /// Also runs implicitly on drop. Callable repeatedly; with no workers
    /// left it is a no-op. The pool can be regrown afterwards with
    /// [`ThreadPool::spawn`].
    pub fn shutdown(&self) -> Result<(), Error> {
        self.check_owner()?;
        self.shutdown_impl();
        Ok(())
    }

    /// Grows the pool by `count` workers. Existing workers are first brought
    /// to quiescence, so no task is in flight while the worker set changes.
    pub fn spawn(&self, count: usize) -> Result<(), Error> {
        self.check_owner()?;
        // Quiesce unconditionally: spawn(0) still acts as a barrier.
        self.wait_for_all_impl();
        if count == 0 {
            return Ok(());
        }
        debug!(count, "growing worker set");
        self.spawn_workers(count)
    }

    /// Number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.shared.registry.read().workers.len()
    }

    /// Number of tasks currently parked in the overflow queue. Per-worker
    /// queues are not counted.
    pub fn num_tasks(&self) -> usize {
        self.shared.state.lock().overflow.len()
    }

    /// Whether the calling thread constructed this pool.
    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    fn check_owner(&self) -> Result<(), Error> {
        if self.is_owner() {
            Ok(())
        } else {
            Err(Error::NotOwner)
        }
    }

    fn submit(&self, task: Task) {
        let (target, own_queue) = {
            let registry = self.shared.registry.read();
            if registry.workers.is_empty() {
                drop(registry);
                task();
                return;
            }
            match registry.thread_map.get(&thread::current().id()) {
                Some(&i) => (Arc::clone(&registry.workers[i]), true),
                None => {
                    let id = self.shared.next_queue.fetch_add(1, Ordering::Relaxed)
                        % registry.workers.len();
                    (Arc::clone(&registry.workers[id]), false)
                }
            }
        };

        if own_queue {
            // Speculative path: no notification, the pushing worker will pop
            // this task itself once its current one finishes.
            if let Err(task) = target.queue.push_front(task) {
                trace!("own queue full, spilling to overflow");
                self.shared.state.lock().overflow.push_back(task);
            }
        } else {
            if let Err(task) = target.queue.push_back(task) {
                trace!("target queue full, spilling to overflow");
                self.shared.state.lock().overflow.push_back(task);
            }
            // External submissions always wake the chosen worker, whether
            // the task landed in its queue or in the overflow FIFO.
            target.cv.notify_one();
        }
    }

    fn wait_for_all_impl(&self) {
        let mut state = self.shared.state.lock();
        let registry = self.shared.registry.read();
        if registry.workers.is_empty() {
            return;
        }
        // Fast path: already quiescent, nothing to wake.
        if state.idle_workers == registry.workers.len()
            && state.overflow.is_empty()
            && registry.first_nonempty().is_none()
        {
            return;
        }
        state.wait_for_all = true;
        // Wake every worker in case some are already parked; the last one
        // back to idleness performs the drained-pool check.
        for worker in &registry.workers {
            worker.cv.notify_one();
        }
        drop(registry);
        while !state.sync {
            self.shared.quiescence_cv.wait(&mut state);
        }
        state.sync = false;
        state.wait_for_all = false;
        debug!("pool reached quiescence");
    }

    fn shutdown_impl(&self) {
        if self.num_workers() == 0 {
            return;
        }
        self.wait_for_all_impl();
        debug!("shutting down workers");
        {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            let registry = self.shared.registry.read();
            for worker in &registry.workers {
                // A trivial task per worker drives each one around its loop
                // far enough to observe the exit flag.
                let _ = worker.queue.push_back(Box::new(|| {}));
                worker.cv.notify_one();
            }
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        {
            let mut registry = self.shared.registry.write();
            registry.workers.clear();
            registry.coprimes.clear();
            registry.thread_map.clear();
        }
        let mut state = self.shared.state.lock();
        state.exiting = false;
        state.idle_workers = 0;
    }

    /// Starts `count` additional workers. The registry write lock is held
    /// across thread creation and map insertion, so a new worker cannot
    /// obtain any task (stealing and external pushes both need a registry
    /// read) before its thread-id is registered.
    fn spawn_workers(&self, count: usize) -> Result<(), Error> {
        let mut registry = self.shared.registry.write();
        let mut threads = self.threads.lock();
        let base = registry.workers.len();
        let mut failure = None;
        for offset in 0..count {
            let index = base + offset;
            let worker = Arc::new(Worker::new());
            let mut thread_name = self.name.clone();
            let _ = write!(&mut thread_name, "-{:03}", index);
            let shared = Arc::clone(&self.shared);
            let own = Arc::clone(&worker);
            match thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(shared, own, index))
            {
                Ok(handle) => {
                    registry.thread_map.insert(handle.thread().id(), index);
                    registry.workers.push(worker);
                    threads.push(handle);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        // Rebuilt even on failure so the stride table always matches the
        // number of workers that actually started.
        registry.coprimes = coprimes_of(registry.workers.len());
        debug!(workers = registry.workers.len(), "worker set ready");
        match failure {
            Some(e) => Err(Error::Spawn(e)),
            None => Ok(()),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

/// Handle to the result of a [`ThreadPool::async_task`] submission.
pub struct TaskFuture<R> {
    result: Receiver<R>,
}

impl<R> TaskFuture<R> {
    /// Blocks until the task has run and returns its result.
    ///
    /// # Panics
    ///
    /// Panics if the task was dropped before completing, which can only
    /// happen when its worker unwound or the pool tore down mid-flight.
    pub fn wait(self) -> R {
        self.result
            .recv()
            .expect("task was dropped before completing")
    }

    /// Returns the result if the task has already finished.
    pub fn try_wait(&self) -> Option<R> {
        self.result.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hw_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    #[test]
    fn run_queue_front_is_lifo() {
        let queue: RunQueue<u32, 8> = RunQueue::new();
        for i in 0..4 {
            assert!(queue.push_front(i).is_ok());
        }
        for i in (0..4).rev() {
            assert_eq!(queue.pop_front(), Some(i));
        }
        assert_eq!(queue.pop_front(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn run_queue_steals_oldest_first() {
        let queue: RunQueue<u32, 8> = RunQueue::new();
        for i in 0..4 {
            assert!(queue.push_front(i).is_ok());
        }
        for i in 0..4 {
            assert_eq!(queue.pop_back(), Some(i));
        }
        assert_eq!(queue.pop_back(), None);
    }

    #[test]
    fn run_queue_back_meets_front() {
        let queue: RunQueue<u32, 8> = RunQueue::new();
        assert!(queue.push_back(1).is_ok());
        assert!(queue.push_back(2).is_ok());
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(2));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn run_queue_rejects_when_full() {
        let queue: RunQueue<u32, 4> = RunQueue::new();
        for i in 0..4 {
            assert!(queue.push_front(i).is_ok());
        }
        assert_eq!(queue.push_front(99), Err(99));
        assert_eq!(queue.push_back(99), Err(99));
        // Freeing one slot makes room on either end again.
        assert_eq!(queue.pop_front(), Some(3));
        assert!(queue.push_back(99).is_ok());
    }

    #[test]
    fn run_queue_drops_leftover_payloads() {
        struct Tracker(Arc<AtomicUsize>);
        impl Drop for Tracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue: RunQueue<Tracker, 4> = RunQueue::new();
            assert!(queue.push_front(Tracker(Arc::clone(&drops))).is_ok());
            assert!(queue.push_front(Tracker(Arc::clone(&drops))).is_ok());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn run_queue_concurrent_owner_and_thief() {
        const TOTAL: usize = 100_000;
        let queue: Arc<RunQueue<usize, 64>> = Arc::new(RunQueue::new());
        let stolen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let thief = {
            let queue = Arc::clone(&queue);
            let stolen = Arc::clone(&stolen);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) || !queue.is_empty() {
                    if queue.pop_back().is_some() {
                        stolen.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut pushed = 0usize;
        let mut taken = 0usize;
        while pushed < TOTAL {
            if queue.push_front(pushed).is_ok() {
                pushed += 1;
            }
            if queue.pop_front().is_some() {
                taken += 1;
            }
        }
        while queue.pop_front().is_some() {
            taken += 1;
        }
        done.store(true, Ordering::Release);
        thief.join().unwrap();

        assert_eq!(taken + stolen.load(Ordering::Relaxed), TOTAL);
    }

    #[test]
    fn coprime_table_matches_worker_count() {
        assert_eq!(coprimes_of(1), vec![1]);
        assert_eq!(coprimes_of(4), vec![1, 3]);
        assert_eq!(coprimes_of(6), vec![1, 5]);
        assert_eq!(coprimes_of(7), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn coprime_walk_covers_every_worker() {
        for count in 1..=16usize {
            for &stride in &coprimes_of(count) {
                for start in 0..count {
                    let mut seen = vec![false; count];
                    let mut victim = start;
                    for _ in 0..count {
                        seen[victim] = true;
                        victim += stride;
                        if victim >= count {
                            victim -= count;
                        }
                    }
                    assert!(
                        seen.iter().all(|&v| v),
                        "stride {stride} misses a worker at count {count}"
                    );
                }
            }
        }
    }

    #[test]
    fn xorshift_stays_nonzero() {
        for seed in 1..=64u32 {
            let mut x = seed;
            for _ in 0..1_000 {
                xorshift32(&mut x);
                assert_ne!(x, 0);
            }
        }
    }

    #[test]
    fn zero_workers_execute_inline() {
        let pool = ThreadPool::try_spawn(0).expect("spawn");
        assert_eq!(pool.num_workers(), 0);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.silent_async(move || flag.store(true, Ordering::Relaxed));
        assert!(ran.load(Ordering::Relaxed));

        let future = pool.async_task(|| 42);
        assert_eq!(future.try_wait(), Some(42));

        pool.wait_for_all().expect("owner");
    }

    #[test]
    fn owner_submissions_all_run() {
        const TASKS: usize = 10_000;
        let pool = ThreadPool::try_spawn(4).expect("spawn");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..TASKS {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), TASKS);
    }

    #[test]
    fn forked_children_all_run() {
        const CHILDREN: usize = 1_000;
        let pool = Arc::new(ThreadPool::try_spawn(2).expect("spawn"));
        let counter = Arc::new(AtomicUsize::new(0));
        let forker = Arc::clone(&pool);
        let root_counter = Arc::clone(&counter);
        pool.silent_async(move || {
            root_counter.fetch_add(1, Ordering::Relaxed);
            for _ in 0..CHILDREN {
                let counter = Arc::clone(&root_counter);
                forker.silent_async(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), CHILDREN + 1);
    }

    #[test]
    fn external_threads_submit() {
        const THREADS: usize = 100;
        const PER_THREAD: usize = 100;
        let pool = Arc::new(ThreadPool::try_spawn(8).expect("spawn"));
        let counter = Arc::new(AtomicUsize::new(0));
        let submitters: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    assert!(!pool.is_owner());
                    for _ in 0..PER_THREAD {
                        let counter = Arc::clone(&counter);
                        pool.silent_async(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();
        for handle in submitters {
            handle.join().unwrap();
        }
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * PER_THREAD);
    }

    #[test]
    fn grow_at_quiescence() {
        let pool = ThreadPool::try_spawn(4).expect("spawn");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        // spawn quiesces before touching the worker set, so even a zero-count
        // call acts as a barrier for the first batch.
        pool.spawn(0).expect("owner");
        assert_eq!(pool.num_workers(), 4);
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        pool.spawn(4).expect("owner");
        assert_eq!(pool.num_workers(), 8);
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn lifecycle_rejected_off_owner() {
        let pool = Arc::new(ThreadPool::try_spawn(2).expect("spawn"));
        assert!(pool.is_owner());

        let inner = Arc::clone(&pool);
        let verdict = pool.async_task(move || {
            matches!(inner.shutdown(), Err(Error::NotOwner))
                && matches!(inner.wait_for_all(), Err(Error::NotOwner))
                && matches!(inner.spawn(1), Err(Error::NotOwner))
                && !inner.is_owner()
        });
        assert!(verdict.wait());

        let stranger = Arc::clone(&pool);
        let handle =
            std::thread::spawn(move || matches!(stranger.wait_for_all(), Err(Error::NotOwner)));
        assert!(handle.join().unwrap());

        // The pool keeps working after the rejected calls.
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn wait_for_all_is_idempotent() {
        let pool = ThreadPool::try_spawn(4).expect("spawn");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1_000 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_all().expect("owner");
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), 1_000);
    }

    #[test]
    fn self_submissions_run_lifo() {
        let pool = Arc::new(ThreadPool::try_spawn(1).expect("spawn"));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let forker = Arc::clone(&pool);
        let recorder = Arc::clone(&order);
        pool.silent_async(move || {
            let first = Arc::clone(&recorder);
            forker.silent_async(move || first.lock().push('a'));
            let second = Arc::clone(&recorder);
            forker.silent_async(move || second.lock().push('b'));
        });
        pool.wait_for_all().expect("owner");
        assert_eq!(*order.lock(), vec!['b', 'a']);
    }

    #[test]
    fn async_task_returns_values() {
        let pool = ThreadPool::try_spawn(hw_threads()).expect("spawn");
        let futures: Vec<_> = (0..64usize).map(|i| pool.async_task(move || i * i)).collect();
        let total: usize = futures.into_iter().map(|f| f.wait()).sum();
        assert_eq!(total, (0..64usize).map(|i| i * i).sum::<usize>());
    }

    #[test]
    fn overflow_absorbs_queue_rejections() {
        const TASKS: usize = 4_000;
        let pool = Arc::new(ThreadPool::try_spawn(1).expect("spawn"));
        let gate = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicUsize::new(0));

        // Occupy the only worker so the flood below cannot drain.
        let held = Arc::clone(&gate);
        pool.silent_async(move || {
            while !held.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        });
        for _ in 0..TASKS {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        // More submissions than the run-queue holds: some must have spilled.
        assert!(pool.num_tasks() > 0);

        gate.store(true, Ordering::Release);
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), TASKS);
        assert_eq!(pool.num_tasks(), 0);
    }

    #[test]
    fn shutdown_then_respawn() {
        let pool = ThreadPool::try_spawn(2).expect("spawn");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.shutdown().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert_eq!(pool.num_workers(), 0);
        assert_eq!(pool.num_tasks(), 0);
        pool.shutdown().expect("owner");

        pool.spawn(2).expect("owner");
        assert_eq!(pool.num_workers(), 2);
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.silent_async(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_for_all().expect("owner");
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn dynamic_forking_executes_exactly_once() {
        const ROOTS: usize = 64;
        const PER_ROOT: usize = 256;
        let pool = Arc::new(ThreadPool::try_spawn(hw_threads()).expect("spawn"));
        let visited = Arc::new(
            (0..ROOTS * PER_ROOT)
                .map(|_| AtomicBool::new(false))
                .collect::<Vec<_>>(),
        );
        let duplicate = Arc::new(AtomicBool::new(false));

        for root in 0..ROOTS {
            let forker = Arc::clone(&pool);
            let visited = Arc::clone(&visited);
            let duplicate = Arc::clone(&duplicate);
            pool.silent_async(move || {
                for child in 0..PER_ROOT {
                    let visited = Arc::clone(&visited);
                    let duplicate = Arc::clone(&duplicate);
                    forker.silent_async(move || {
                        if visited[root * PER_ROOT + child].swap(true, Ordering::Relaxed) {
                            duplicate.store(true, Ordering::Relaxed);
                        }
                    });
                }
            });
        }
        pool.wait_for_all().expect("owner");

        assert!(
            !duplicate.load(Ordering::Relaxed),
            "a task executed more than once"
        );
        for flag in visited.iter() {
            assert!(flag.load(Ordering::Relaxed), "a task never executed");
        }
    }
}
