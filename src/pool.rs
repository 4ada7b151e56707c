//! Elastic worker pool for blocking operations.
//!
//! The pool scales from zero up to a configured maximum and keeps no
//! long-lived idle threads: a worker that sits idle past the inactivity
//! timeout retires. Work distribution is deliberately biased — lower-indexed
//! workers claim work first, enforced by a per-slot "serving" bit that
//! higher-indexed workers wait on before popping the queue. The bias keeps
//! load on the first few threads so the tail goes idle and retires; a fair
//! FIFO would also be correct, this is a scheduling policy, not a
//! correctness requirement.
//!
//! # Lifecycle
//!
//! ```text
//! spawn ──▶ promote slot ──▶ OS thread ──▶ serve ⟲ idle-wait
//!                                            │         │ timeout
//!                                            ▼         ▼
//!                                        serve more   retire
//! ```
//!
//! `shutdown` flips every slot inactive, broadcasts, and joins whatever is
//! still running. A successfully enqueued closure is never dropped.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default inactivity timeout before a worker retires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Error returned when work cannot be handed to the pool.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The pool is tearing down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
    /// The OS refused to start a worker thread.
    #[error("failed to start worker thread: {0}")]
    Thread(#[from] io::Error),
}

#[derive(Default)]
struct SlotState {
    active: bool,
    handle: Option<JoinHandle<()>>,
}

struct PoolState {
    queue: VecDeque<Job>,
    slots: Box<[SlotState]>,
    serving: Box<[bool]>,
    active: usize,
    idle: usize,
    shutdown: bool,
}

impl std::fmt::Debug for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotState")
            .field("active", &self.active)
            .field("joined", &self.handle.is_none())
            .finish()
    }
}

impl PoolState {
    /// True while some lower-indexed active worker has not yet claimed the
    /// queue. Index 0 never waits.
    fn predecessors_pending(&self, index: usize) -> bool {
        (0..index).any(|j| self.slots[j].active && !self.serving[j])
    }
}

struct PoolInner {
    max_threads: usize,
    idle_timeout: Duration,
    name_prefix: String,
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Elastic pool of worker threads with ordered acquisition.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("WorkerPool")
            .field("max_threads", &self.inner.max_threads)
            .field("active", &state.active)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool that may grow to `max_threads` workers.
    ///
    /// No thread is started until work arrives.
    #[must_use]
    pub fn new(max_threads: usize, idle_timeout: Duration, name_prefix: &str) -> Self {
        let slots = (0..max_threads).map(|_| SlotState::default()).collect();
        Self {
            inner: Arc::new(PoolInner {
                max_threads,
                idle_timeout,
                name_prefix: name_prefix.to_string(),
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    slots,
                    serving: vec![false; max_threads].into_boxed_slice(),
                    active: 0,
                    idle: 0,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Hands a closure to the pool.
    ///
    /// If every active worker is busy and the pool is below capacity, a new
    /// worker is promoted first; either way the closure is prepended to the
    /// run queue and the workers are broadcast awake.
    ///
    /// # Panics
    ///
    /// Panics when called on a zero-capacity pool; single-threaded
    /// configurations must execute blocking work inline instead.
    pub fn spawn<F>(&self, f: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.inner.max_threads > 0,
            "spawn on a zero-capacity worker pool"
        );
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                return Err(SpawnError::ShuttingDown);
            }
            if state.idle == 0 && state.active < self.inner.max_threads {
                let index = state
                    .slots
                    .iter()
                    .position(|slot| !slot.active)
                    .expect("active count below capacity implies a free slot");
                state.slots[index].active = true;
                state.serving[index] = false;
                state.active += 1;

                let inner = Arc::clone(&self.inner);
                let spawned = thread::Builder::new()
                    .name(format!("{}-{index}", self.inner.name_prefix))
                    .spawn(move || worker_loop(&inner, index));
                match spawned {
                    Ok(handle) => {
                        state.slots[index].handle = Some(handle);
                        tracing::trace!(index, active = state.active, "worker promoted");
                    }
                    Err(err) => {
                        state.slots[index].active = false;
                        state.active -= 1;
                        return Err(SpawnError::Thread(err));
                    }
                }
            }
            state.queue.push_front(Box::new(f));
        }
        // Broadcast, not signal: the acquisition protocol may force a woken
        // higher-indexed worker straight back to sleep.
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    /// Number of closures waiting in the run queue.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Flips every worker inactive, broadcasts, and joins them.
    ///
    /// Already-queued closures still execute before the workers observe the
    /// flag; the pool never drops accepted work.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                for slot in state.slots.iter_mut() {
                    slot.active = false;
                }
                state
                    .slots
                    .iter_mut()
                    .filter_map(|slot| slot.handle.take())
                    .collect()
            }
        };
        self.inner.cond.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Arc<PoolInner>, index: usize) {
    tracing::trace!(index, "worker started");
    let mut state = inner.state.lock().unwrap();
    let mut idle_since = Instant::now();

    'run: loop {
        // Serial acquisition: yield until every lower-indexed active worker
        // is serving, the queue drains, or the idle budget runs out.
        while index > 0 && state.predecessors_pending(index) && !state.queue.is_empty() {
            if idle_since.elapsed() >= inner.idle_timeout {
                break 'run;
            }
            drop(state);
            thread::yield_now();
            state = inner.state.lock().unwrap();
        }

        // Serve until the queue empties; deactivation does not abandon
        // accepted work.
        if !state.queue.is_empty() {
            state.serving[index] = true;
            while let Some(job) = state.queue.pop_front() {
                drop(state);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    tracing::error!(index, "worker closure panicked");
                }
                idle_since = Instant::now();
                state = inner.state.lock().unwrap();
            }
            state.serving[index] = false;
        }

        if !state.slots[index].active {
            break;
        }
        if !state.queue.is_empty() {
            continue;
        }
        let remaining = inner.idle_timeout.saturating_sub(idle_since.elapsed());
        if remaining.is_zero() {
            break;
        }
        state.idle += 1;
        let (guard, wait) = inner.cond.wait_timeout(state, remaining).unwrap();
        state = guard;
        state.idle -= 1;
        if wait.timed_out() && state.queue.is_empty() {
            break;
        }
    }

    // Retirement: keep successors unblocked, detach, clear the slot.
    state.active -= 1;
    state.serving[index] = true;
    state.slots[index].active = false;
    drop(state.slots[index].handle.take());
    drop(state);
    tracing::trace!(index, "worker retired");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn executes_spawned_work() {
        init_test_logging();
        let pool = WorkerPool::new(2, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .expect("spawn");
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn run_queue_is_lifo() {
        init_test_logging();
        let pool = WorkerPool::new(1, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        let gate = Arc::new(Barrier::new(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        let g = Arc::clone(&gate);
        pool.spawn(move || {
            g.wait();
        })
        .expect("spawn");

        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            pool.spawn(move || {
                order.lock().unwrap().push(label);
            })
            .expect("spawn");
        }

        gate.wait();
        pool.shutdown();
        // Prepend means the most recently queued closure runs first.
        assert_eq!(*order.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn grows_up_to_capacity_under_load() {
        init_test_logging();
        let pool = WorkerPool::new(3, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        let gate = Arc::new(Barrier::new(4));

        for _ in 0..3 {
            let g = Arc::clone(&gate);
            pool.spawn(move || {
                g.wait();
            })
            .expect("spawn");
        }

        // All three jobs block, so all three slots must have been promoted.
        assert_eq!(pool.active_threads(), 3);
        gate.wait();
        pool.shutdown();
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn idle_workers_retire_after_timeout() {
        init_test_logging();
        let pool = WorkerPool::new(4, Duration::from_millis(50), "winaio-test");
        let gate = Arc::new(Barrier::new(5));

        for _ in 0..4 {
            let g = Arc::clone(&gate);
            pool.spawn(move || {
                g.wait();
            })
            .expect("spawn");
        }
        gate.wait();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active_threads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(pool.active_threads(), 0, "idle workers should retire");
    }

    #[test]
    fn shutdown_joins_idle_workers_promptly() {
        init_test_logging();
        let pool = WorkerPool::new(8, Duration::from_secs(60), "winaio-test");
        let gate = Arc::new(Barrier::new(9));
        for _ in 0..8 {
            let g = Arc::clone(&gate);
            pool.spawn(move || {
                g.wait();
            })
            .expect("spawn");
        }
        gate.wait();

        let start = Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn spawn_after_shutdown_is_rejected() {
        init_test_logging();
        let pool = WorkerPool::new(1, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        pool.shutdown();
        let err = pool.spawn(|| {}).expect_err("pool is down");
        assert!(matches!(err, SpawnError::ShuttingDown));
    }

    #[test]
    #[should_panic(expected = "zero-capacity")]
    fn zero_capacity_spawn_is_fatal() {
        let pool = WorkerPool::new(0, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        let _ = pool.spawn(|| {});
    }

    #[test]
    fn queued_work_survives_shutdown_race() {
        init_test_logging();
        let pool = Arc::new(WorkerPool::new(2, DEFAULT_IDLE_TIMEOUT, "winaio-test"));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut spawners = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            spawners.push(thread::spawn(move || {
                for _ in 0..50 {
                    let counter = Arc::clone(&counter);
                    if pool
                        .spawn(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }
        for spawner in spawners {
            spawner.join().expect("spawner panicked");
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 200);
    }

    #[test]
    fn lower_indexed_worker_claims_first() {
        init_test_logging();
        let pool = WorkerPool::new(2, DEFAULT_IDLE_TIMEOUT, "winaio-test");
        let names = Arc::new(Mutex::new(Vec::new()));

        // A single quick job must be served by worker 0; worker 1 is never
        // promoted for it.
        let n = Arc::clone(&names);
        pool.spawn(move || {
            n.lock()
                .unwrap()
                .push(thread::current().name().unwrap_or("?").to_string());
        })
        .expect("spawn");

        pool.shutdown();
        let names = names.lock().unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("-0"), "served by {}", names[0]);
    }
}
