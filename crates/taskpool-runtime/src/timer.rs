//! The timer service: one lazily spawned thread over a globally sorted
//! expiry list.
//!
//! Timers are kept in ascending deadline order. The thread dispatches every
//! expired head entry, re-inserts periodic timers, and then sleeps until the
//! earliest deadline - stretched by each timer's window length as long as
//! that does not push past a neighbour's deadline, which coalesces close-by
//! wake-ups. When the last timer object is destroyed the thread lingers for
//! the standard idle timeout and then retires.

use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use taskpool_core::constants::{NO_TIMEOUT, TICKS_PER_MS, WORKER_TIMEOUT_MS};
use taskpool_core::{tp_debug, tp_error, PoolError, PoolResult};

use crate::environment::Environment;
use crate::instance::CallbackInstance;
use crate::object::{Object, Payload, TimerState};
use crate::time;

struct TimerQueueInner {
    /// Pending timers sorted by absolute expiry.
    pending: Vec<Arc<Object>>,
    objcount: usize,
    thread_running: bool,
}

struct TimerQueue {
    inner: Mutex<TimerQueueInner>,
    update: Condvar,
}

fn timerqueue() -> &'static TimerQueue {
    static QUEUE: OnceLock<TimerQueue> = OnceLock::new();
    QUEUE.get_or_init(|| TimerQueue {
        inner: Mutex::new(TimerQueueInner {
            pending: Vec::new(),
            objcount: 0,
            thread_running: false,
        }),
        update: Condvar::new(),
    })
}

/// Insert into the sorted list, stable for equal deadlines.
/// Returns whether the timer became the new head.
fn sorted_insert(inner: &mut TimerQueueInner, timer: &Arc<Object>, deadline: u64) -> bool {
    let mut pos = inner.pending.len();
    for (i, other) in inner.pending.iter().enumerate() {
        let other_deadline = other.timer_state().lock().unwrap().timeout;
        if deadline < other_deadline {
            pos = i;
            break;
        }
    }
    inner.pending.insert(pos, timer.clone());
    pos == 0
}

fn remove_pending(inner: &mut TimerQueueInner, timer: &Arc<Object>) {
    if let Some(pos) = inner
        .pending
        .iter()
        .position(|entry| Arc::ptr_eq(entry, timer))
    {
        inner.pending.remove(pos);
    }
}

/// Attach a timer object to the service, spawning the timer thread on first
/// use.
pub(crate) fn timerqueue_lock(timer: &Arc<Object>) -> PoolResult<()> {
    *timer.timer_state().lock().unwrap() = TimerState::default();

    let queue = timerqueue();
    let mut inner = queue.inner.lock().unwrap();

    if !inner.thread_running {
        std::thread::Builder::new()
            .name("tp-timerq".into())
            .spawn(timerqueue_thread_proc)
            .map_err(|err| {
                tp_error!("failed to spawn timer queue thread: {}", err);
                PoolError::SpawnFailed
            })?;
        inner.thread_running = true;
    }

    timer.timer_state().lock().unwrap().initialized = true;
    inner.objcount += 1;
    Ok(())
}

/// Detach a timer object. Idempotent.
pub(crate) fn timerqueue_unlock(timer: &Arc<Object>) {
    let queue = timerqueue();
    let mut inner = queue.inner.lock().unwrap();
    let mut ts = timer.timer_state().lock().unwrap();
    if !ts.initialized {
        return;
    }

    if ts.pending {
        remove_pending(&mut inner, timer);
        ts.pending = false;
    }

    inner.objcount -= 1;
    if inner.objcount == 0 {
        debug_assert!(inner.pending.is_empty());
        queue.update.notify_all();
    }
    ts.initialized = false;
}

fn timerqueue_thread_proc() {
    tp_debug!("starting timer queue thread");
    let queue = timerqueue();
    let mut inner = queue.inner.lock().unwrap();

    loop {
        let now = time::now_ticks();

        // Dispatch expired timers from the head of the sorted list.
        loop {
            let Some(timer) = inner.pending.first().cloned() else {
                break;
            };
            let (expired, period_ms) = {
                let ts = timer.timer_state().lock().unwrap();
                debug_assert!(ts.pending);
                (ts.timeout <= now, ts.period_ms)
            };
            if !expired {
                break;
            }

            inner.pending.remove(0);
            timer.timer_state().lock().unwrap().pending = false;
            timer.submit(false);

            // Periodic timers go back into the list unless shutting down.
            if period_ms != 0 && !timer.is_shutdown() {
                let deadline = {
                    let mut ts = timer.timer_state().lock().unwrap();
                    ts.timeout += period_ms as u64 * TICKS_PER_MS;
                    // Avoid a trigger cascade when the process was stalled
                    // past several periods.
                    if ts.timeout <= now {
                        ts.timeout = now + 1;
                    }
                    ts.pending = true;
                    ts.timeout
                };
                sorted_insert(&mut inner, &timer, deadline);
            }
        }

        // Next wake-up: earliest deadline, stretched by window lengths as
        // long as no other timer's deadline is crossed.
        let mut timeout_lower = NO_TIMEOUT;
        let mut timeout_upper = NO_TIMEOUT;
        for other in &inner.pending {
            let ts = other.timer_state().lock().unwrap();
            if ts.timeout >= timeout_upper {
                break;
            }
            timeout_lower = ts.timeout;
            let stretched = ts
                .timeout
                .saturating_add(ts.window_ms as u64 * TICKS_PER_MS);
            if stretched < timeout_upper {
                timeout_upper = stretched;
            }
        }

        if inner.objcount > 0 {
            inner = match time::until_deadline(timeout_lower) {
                Some(duration) => queue.update.wait_timeout(inner, duration).unwrap().0,
                None => queue.update.wait(inner).unwrap(),
            };
            continue;
        }

        // All timer objects destroyed: linger for new registrations before
        // retiring.
        let (guard, timeout) = queue
            .update
            .wait_timeout(inner, Duration::from_millis(WORKER_TIMEOUT_MS))
            .unwrap();
        inner = guard;
        if timeout.timed_out() && inner.objcount == 0 {
            break;
        }
    }

    inner.thread_running = false;
    drop(inner);
    tp_debug!("terminating timer queue thread");
}

/// A threadpool timer object.
///
/// The callback fires at the scheduled expiry, and every `period_ms`
/// thereafter for periodic timers. Dropping the handle releases the object.
pub struct Timer {
    pub(crate) object: Arc<Object>,
}

impl Timer {
    pub fn new<F>(env: Option<&Environment>, callback: F) -> PoolResult<Timer>
    where
        F: Fn(&CallbackInstance) + Send + Sync + 'static,
    {
        let object = Object::allocate(
            Payload::Timer {
                callback: Box::new(callback),
                timer: Mutex::new(TimerState::default()),
            },
            env,
        )?;
        tp_debug!("allocated timer object");
        Ok(Timer { object })
    }

    /// Schedule the timer.
    ///
    /// `timeout` is a 100-ns timestamp: non-negative values are absolute,
    /// negative values relative to now, `None` disables the timer. A zero
    /// timeout submits the callback immediately; with a non-zero
    /// `period_ms` the next expiry is one period out. `window_ms` is the
    /// coalescing slack the service may add to the deadline.
    ///
    /// Returns whether a previously scheduled expiry was cancelled.
    pub fn set(&self, timeout: Option<i64>, period_ms: u32, window_ms: u32) -> bool {
        let mut submit_now = false;
        let mut cancelled = false;
        {
            let queue = timerqueue();
            let mut inner = queue.inner.lock().unwrap();
            let mut ts = self.object.timer_state().lock().unwrap();
            debug_assert!(ts.initialized);
            ts.set = timeout.is_some();

            let mut deadline = None;
            match timeout {
                Some(t) if t < 0 => deadline = Some(time::absolute_deadline(t)),
                Some(0) => {
                    // Submit immediately; a periodic timer keeps running one
                    // period from now.
                    if period_ms != 0 {
                        deadline =
                            Some(time::now_ticks() + period_ms as u64 * TICKS_PER_MS);
                    }
                    submit_now = true;
                }
                Some(t) => deadline = Some(t as u64),
                None => {}
            }

            if ts.pending {
                cancelled = true;
                remove_pending(&mut inner, &self.object);
                ts.pending = false;
            }

            if let Some(deadline) = deadline {
                ts.timeout = deadline;
                ts.period_ms = period_ms;
                ts.window_ms = window_ms;
                ts.pending = true;
                drop(ts);
                // Wake the timer thread when the head deadline moved up.
                if sorted_insert(&mut inner, &self.object, deadline) {
                    queue.update.notify_all();
                }
            }
        }

        if submit_now {
            self.object.submit(false);
        }
        cancelled
    }

    /// Whether the timer currently has a schedule.
    pub fn is_set(&self) -> bool {
        self.object.timer_state().lock().unwrap().set
    }

    /// Wait for outstanding callbacks, optionally cancelling queued ones.
    pub fn wait(&self, cancel_pending: bool) {
        if cancel_pending {
            self.object.cancel();
        }
        self.object.wait_finished(false);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.object.prepare_shutdown();
        self.object
            .shutdown
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
