//! # taskpool - a threadpool runtime
//!
//! A general-purpose threadpool runtime that multiplexes four kinds of
//! asynchronous work onto dynamically sized pools of worker threads:
//!
//! - **Work** objects: one-shot callbacks posted manually, plus anonymous
//!   [`try_post_simple`] callbacks,
//! - **Timer** objects: one-shot or periodic expiries with window
//!   coalescing,
//! - **Wait** objects: callbacks fired when a handle is signaled or a
//!   deadline passes, multiplexed in buckets over dedicated wait threads,
//! - **Io** objects: completion-port packets bridged into callbacks by a
//!   single pump thread.
//!
//! Objects can be grouped under a [`CleanupGroup`] for bulk cancel and
//! synchronous drain. Releasing an object (dropping its handle) never
//! interrupts a running callback; waiting entry points block until the
//! object's pending and running callbacks are gone.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use taskpool::{Environment, Pool, Work};
//!
//! let pool = Pool::new();
//! pool.set_max_threads(2);
//! let env = Environment::new().with_pool(&pool);
//!
//! let counter = Arc::new(AtomicUsize::new(0));
//! let c = counter.clone();
//! let work = Work::new(Some(&env), move |_| {
//!     c.fetch_add(1, Ordering::SeqCst);
//! })
//! .unwrap();
//!
//! for _ in 0..10 {
//!     work.post();
//! }
//! work.wait(false);
//! assert_eq!(counter.load(Ordering::SeqCst), 10);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        User Code                         │
//! │      Work / Timer / Wait / Io handles, CleanupGroup      │
//! └──────────────────────────────────────────────────────────┘
//!                │                │               │
//!                ▼                ▼               ▼
//!        ┌────────────┐   ┌────────────┐   ┌────────────┐
//!        │   Timer    │   │    Wait    │   │  I/O pump  │
//!        │   thread   │   │  buckets   │   │   thread   │
//!        └────────────┘   └────────────┘   └────────────┘
//!                │                │               │
//!                └───────── submit ───────────────┘
//!                                 │
//!                                 ▼
//!        ┌──────────────────────────────────────────────┐
//!        │     Pool: priority queues + worker threads   │
//!        └──────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use taskpool_core::{LogLevel, PoolError, PoolResult, Priority, WaitResult};

// Re-export log macros and setup for embedders
pub use taskpool_core::log::{init as init_logging, set_log_level};
pub use taskpool_core::{tp_debug, tp_error, tp_info, tp_trace, tp_warn};

// Re-export runtime types
pub use taskpool_runtime::{
    try_post_simple, CallbackInstance, CleanupGroup, CompletionPacket, CompletionPort,
    CriticalSection, Environment, Event, Io, IoCompletion, Pool, Semaphore, StackInfo,
    Timer, Wait, WaitFlags, Work,
};

/// Relative-timeout helper: `rel_ms(50)` is "50 ms from now" in the 100-ns
/// timestamp convention used by [`Timer::set`] and [`Wait::set`].
pub use taskpool_runtime::time::rel_ms;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn scenario_bounded_pool_throughput() {
        let pool = Pool::new();
        pool.set_max_threads(2);
        let env = Environment::new().with_pool(&pool);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let work = Work::new(Some(&env), move |_| {
            std::thread::sleep(Duration::from_millis(50));
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        for _ in 0..10 {
            work.post();
        }
        work.wait(false);
        let elapsed = start.elapsed();

        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(pool.worker_count() <= 2);
    }

    #[test]
    fn scenario_periodic_timer_then_cancel() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let timer = Timer::new(None, move |_| {
            f2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        timer.set(Some(rel_ms(50)), 100, 0);
        std::thread::sleep(Duration::from_millis(360));
        timer.set(None, 0, 0);
        timer.wait(true);

        let count = fired.load(Ordering::SeqCst);
        assert!((2..=5).contains(&count), "fired {} times", count);
    }

    #[test]
    fn scenario_one_shot_wait_on_event() {
        let event = Arc::new(Event::new().unwrap());
        let results = Arc::new(Mutex::new(Vec::new()));

        let r2 = results.clone();
        let wait = Wait::new(None, move |_, result| {
            r2.lock().unwrap().push(result);
        })
        .unwrap();
        wait.set(Some(event.as_raw_fd()), Some(rel_ms(1000)));

        std::thread::sleep(Duration::from_millis(100));
        event.set().unwrap();

        assert!(wait_until(
            || results.lock().unwrap().len() == 1,
            Duration::from_secs(5)
        ));
        assert_eq!(*results.lock().unwrap(), vec![WaitResult::Signaled]);

        // A second signal after the one-shot fired does nothing, and the
        // original deadline does not produce a timeout callback.
        event.set().unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[test]
    fn scenario_group_cancel_protocol() {
        let group = CleanupGroup::new();
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicUsize::new(0));

        let mut works = Vec::new();
        for i in 0..3 {
            let c2 = cancelled.clone();
            let env = Environment::new()
                .with_cleanup_group(&group)
                .with_group_cancel(move |userdata| {
                    c2.lock().unwrap().push((i, userdata));
                });
            let ran2 = ran.clone();
            let work = Work::new(Some(&env), move |_| {
                std::thread::sleep(Duration::from_millis(50));
                ran2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            work.post();
            works.push(work);
        }

        let t2 = Timer::new(
            Some(&Environment::new().with_cleanup_group(&group)),
            |_| {},
        )
        .unwrap();
        t2.set(Some(rel_ms(60_000)), 0, 0);

        group.release_members(true, 42);

        // Every work callback that ran finished before release returned.
        let running_after = ran.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(ran.load(Ordering::SeqCst), running_after);

        let cancelled = cancelled.lock().unwrap();
        assert_eq!(cancelled.len(), 3);
        assert!(cancelled.iter().all(|&(_, u)| u == 42));
    }

    #[test]
    fn scenario_io_complete_and_cancel() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let d2 = dispatched.clone();
        let io = Io::new(None, move |_, _| {
            d2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for _ in 0..4 {
            io.start_async_io();
        }
        io.post_completion(1, 0, 512).unwrap();
        io.post_completion(2, 0, 1024).unwrap();
        io.cancel_async_io();
        io.cancel_async_io();

        assert!(wait_until(
            || dispatched.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        ));
        io.wait(true);
        assert_eq!(dispatched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn scenario_simple_callback_on_default_pool() {
        let done = Arc::new(Event::new().unwrap());
        let d2 = done.clone();
        try_post_simple(None, move |_| {
            d2.set().unwrap();
        })
        .unwrap();
        assert!(done.wait_ms(5000));
    }
}
