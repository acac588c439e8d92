//! Worker pools: priority queues, dynamic worker lifecycle, dispatch loop.
//!
//! A pool keeps one FIFO queue per priority level. Workers drain the
//! highest-priority non-empty queue; an object with further pending
//! submissions is re-appended at the tail of its queue before its callback
//! runs, so one busy object cannot monopolize a priority level. Workers are
//! spawned on demand up to `max_workers` and retire after five idle seconds,
//! subject to the min-workers rule.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use taskpool_core::constants::{DEFAULT_MAX_WORKERS, WORKER_TIMEOUT_MS};
use taskpool_core::state::Priority;
use taskpool_core::{tp_debug, tp_error, PoolError, PoolResult};

use crate::object::Object;

/// Stack sizing for newly created worker threads.
///
/// `reserve` is passed to the thread builder; `commit` is advisory on this
/// host and kept for symmetry with `query_stack_information`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackInfo {
    pub reserve: usize,
    pub commit: usize,
}

pub(crate) struct PoolInner {
    pub queues: [VecDeque<Arc<Object>>; Priority::COUNT],
    pub shutdown: bool,
    /// Live objects allocated against this pool.
    pub objcount: usize,
    pub max_workers: usize,
    pub min_workers: usize,
    pub num_workers: usize,
    /// Outstanding queue entries plus executing drains; the high-water
    /// signal for spawning.
    pub num_busy_workers: usize,
    pub stack_info: StackInfo,
    /// Niceness applied to newly created workers.
    pub base_priority: i32,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            shutdown: false,
            objcount: 0,
            max_workers: DEFAULT_MAX_WORKERS,
            min_workers: 0,
            num_workers: 0,
            num_busy_workers: 0,
            stack_info: StackInfo::default(),
            base_priority: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, object: Arc<Object>, priority: Priority) {
        self.num_busy_workers += 1;
        self.queues[priority.as_index()].push_back(object);
    }

    /// Head of the first non-empty queue, in strict priority order.
    pub(crate) fn next_item(&mut self) -> Option<Arc<Object>> {
        for queue in self.queues.iter_mut() {
            if let Some(object) = queue.pop_front() {
                return Some(object);
            }
        }
        None
    }

    pub(crate) fn has_items(&self) -> bool {
        self.queues.iter().any(|queue| !queue.is_empty())
    }

    pub(crate) fn remove_queued(&mut self, object: &Arc<Object>) -> Option<Arc<Object>> {
        let queue = &mut self.queues[object.priority.as_index()];
        let pos = queue.iter().position(|entry| Arc::ptr_eq(entry, object))?;
        queue.remove(pos)
    }
}

pub(crate) struct ThreadPool {
    pub inner: Mutex<PoolInner>,
    pub update: Condvar,
}

impl ThreadPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::new()),
            update: Condvar::new(),
        }
    }

    /// Create and account one worker thread. Caller holds the pool lock.
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        inner: &mut PoolInner,
    ) -> PoolResult<()> {
        let pool = self.clone();
        let nice = inner.base_priority;
        let mut builder = std::thread::Builder::new().name("tp-worker".into());
        if inner.stack_info.reserve > 0 {
            builder = builder.stack_size(inner.stack_info.reserve);
        }

        inner.num_workers += 1;
        match builder.spawn(move || worker_proc(pool, nice)) {
            Ok(_) => Ok(()),
            Err(err) => {
                inner.num_workers -= 1;
                tp_error!("failed to spawn worker thread: {}", err);
                Err(PoolError::SpawnFailed)
            }
        }
    }
}

/// Take the pool reference for a new object: guarantee at least one worker
/// and raise the live-object count.
pub(crate) fn threadpool_lock(pool: &Arc<ThreadPool>) -> PoolResult<()> {
    let mut inner = pool.inner.lock().unwrap();
    if inner.num_workers == 0 {
        pool.spawn_worker(&mut inner)?;
    }
    inner.objcount += 1;
    Ok(())
}

static DEFAULT_POOL: OnceLock<Arc<ThreadPool>> = OnceLock::new();

/// The lazily created process-wide pool. Never shut down.
pub(crate) fn default_pool() -> Arc<ThreadPool> {
    DEFAULT_POOL
        .get_or_init(|| Arc::new(ThreadPool::new()))
        .clone()
}

fn apply_thread_priority(nice: i32) {
    if nice == 0 {
        return;
    }
    // Best effort: lowering below 0 needs privileges.
    unsafe {
        let tid = libc::syscall(libc::SYS_gettid);
        if libc::setpriority(libc::PRIO_PROCESS as _, tid as _, nice) != 0 {
            tp_debug!("setpriority({}) failed, keeping default", nice);
        }
    }
}

fn worker_proc(pool: Arc<ThreadPool>, nice: i32) {
    apply_thread_priority(nice);
    tp_debug!("starting worker thread");

    let mut inner = pool.inner.lock().unwrap();
    loop {
        while let Some(object) = inner.next_item() {
            // Claim one invocation while still holding the pool lock, so a
            // racing cancel cannot pull the pending count out from under
            // this drain.
            let (run, remaining) = object.begin_invocation();
            // Round-robin fairness: an object with more pending submissions
            // goes back to the tail of its priority queue.
            if remaining > 0 {
                inner.enqueue(object.clone(), object.priority);
            }
            drop(inner);

            object.invoke(run);

            inner = pool.inner.lock().unwrap();
            debug_assert!(inner.num_busy_workers > 0);
            inner.num_busy_workers -= 1;
            drop(inner);

            // Release the submission's reference outside the lock.
            drop(object);
            inner = pool.inner.lock().unwrap();
        }

        if inner.shutdown {
            break;
        }

        // Idle: wait for new work. A worker retires on timeout when the
        // queue stayed empty and either the min-workers floor allows it, or
        // min is zero and no live objects remain.
        let (guard, timeout) = pool
            .update
            .wait_timeout(inner, Duration::from_millis(WORKER_TIMEOUT_MS))
            .unwrap();
        inner = guard;
        if timeout.timed_out()
            && !inner.has_items()
            && (inner.num_workers > inner.min_workers.max(1)
                || (inner.min_workers == 0 && inner.objcount == 0))
        {
            break;
        }
    }
    inner.num_workers -= 1;
    drop(inner);
    tp_debug!("terminating worker thread");
}

/// An execution domain with bounded worker count and priority queues.
///
/// Dropping the handle shuts the pool down: queued callbacks still drain,
/// then the workers exit. Objects allocated against the pool keep the
/// underlying state alive until they are released themselves.
pub struct Pool {
    pub(crate) inner: Arc<ThreadPool>,
}

impl Pool {
    pub fn new() -> Pool {
        tp_debug!("allocated threadpool");
        Pool {
            inner: Arc::new(ThreadPool::new()),
        }
    }

    /// Cap the number of worker threads. A maximum below 1 is clamped.
    pub fn set_max_threads(&self, maximum: usize) {
        let mut inner = self.inner.inner.lock().unwrap();
        inner.max_workers = maximum.max(1);
        inner.min_workers = inner.min_workers.min(inner.max_workers);
    }

    /// Raise the worker floor, spawning threads up-front to meet it.
    ///
    /// Returns false (and leaves the floor unchanged) when a thread could
    /// not be created.
    pub fn set_min_threads(&self, minimum: usize) -> bool {
        let mut inner = self.inner.inner.lock().unwrap();
        while inner.num_workers < minimum {
            if self.inner.spawn_worker(&mut inner).is_err() {
                return false;
            }
        }
        inner.min_workers = minimum;
        inner.max_workers = inner.max_workers.max(minimum);
        true
    }

    /// Niceness for workers created from now on.
    pub fn set_thread_base_priority(&self, priority: i32) {
        self.inner.inner.lock().unwrap().base_priority = priority;
    }

    pub fn set_stack_information(&self, info: StackInfo) -> PoolResult<()> {
        if info.reserve != 0 && info.commit > info.reserve {
            return Err(PoolError::InvalidParameter);
        }
        self.inner.inner.lock().unwrap().stack_info = info;
        Ok(())
    }

    pub fn query_stack_information(&self) -> StackInfo {
        self.inner.inner.lock().unwrap().stack_info
    }

    /// Current number of worker threads (racy snapshot).
    pub fn worker_count(&self) -> usize {
        self.inner.inner.lock().unwrap().num_workers
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let mut inner = self.inner.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.inner.update.notify_all();
        tp_debug!("released threadpool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::object::Work;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Instant;

    #[test]
    fn test_bounded_pool_runs_everything() {
        let pool = Pool::new();
        pool.set_max_threads(2);
        let env = Environment::new().with_pool(&pool);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let start = Instant::now();
        let work = Work::new(Some(&env), move |_| {
            std::thread::sleep(Duration::from_millis(50));
            ran2.fetch_add(1, AtomicOrdering::SeqCst);
        })
        .unwrap();

        for _ in 0..10 {
            work.post();
        }
        work.wait(false);

        assert_eq!(ran.load(AtomicOrdering::SeqCst), 10);
        // Ten 50 ms callbacks on at most two workers need at least five
        // rounds; a single worker would still finish well under a minute.
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(pool.worker_count() <= 2);
    }

    #[test]
    fn test_set_min_threads_spawns_up_front() {
        let pool = Pool::new();
        assert!(pool.set_min_threads(3));
        assert!(pool.worker_count() >= 3);
    }

    #[test]
    fn test_max_clamps_min() {
        let pool = Pool::new();
        assert!(pool.set_min_threads(4));
        pool.set_max_threads(2);
        let inner = pool.inner.inner.lock().unwrap();
        assert_eq!(inner.max_workers, 2);
        assert_eq!(inner.min_workers, 2);
    }

    #[test]
    fn test_stack_information_round_trip() {
        let pool = Pool::new();
        let info = StackInfo {
            reserve: 256 * 1024,
            commit: 64 * 1024,
        };
        pool.set_stack_information(info).unwrap();
        assert_eq!(pool.query_stack_information(), info);

        let bad = StackInfo {
            reserve: 4096,
            commit: 8192,
        };
        assert_eq!(
            pool.set_stack_information(bad),
            Err(PoolError::InvalidParameter)
        );
    }

    #[test]
    fn test_priority_order_strict() {
        let pool = Pool::new();
        pool.set_max_threads(1);
        let gate = Arc::new(crate::sync::Event::new().unwrap());
        let order = Arc::new(Mutex::new(Vec::new()));

        let env = Environment::new().with_pool(&pool);
        let gate2 = gate.clone();
        let blocker = Work::new(Some(&env), move |_| {
            gate2.wait();
        })
        .unwrap();
        blocker.post();
        // Give the single worker time to pick up the blocker.
        std::thread::sleep(Duration::from_millis(50));

        let low_env = Environment::new()
            .with_pool(&pool)
            .with_priority(Priority::Low);
        let o1 = order.clone();
        let low = Work::new(Some(&low_env), move |_| {
            o1.lock().unwrap().push("low");
        })
        .unwrap();

        let high_env = Environment::new()
            .with_pool(&pool)
            .with_priority(Priority::High);
        let o2 = order.clone();
        let high = Work::new(Some(&high_env), move |_| {
            o2.lock().unwrap().push("high");
        })
        .unwrap();

        // Queue low first, then high; dispatch must still prefer high.
        low.post();
        high.post();
        gate.set().unwrap();

        low.wait(false);
        high.wait(false);
        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }
}
