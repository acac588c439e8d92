//! Callback objects and their lifecycle.
//!
//! A callback object is the ref-counted envelope shared by the five kinds of
//! schedulable work (simple, work, timer, wait, I/O). The envelope tracks
//! three in-flight counters - pending submissions, running callbacks, and
//! associated callbacks - plus the two condition variables that realize the
//! finished/group-finished wait semantics. Reference counting is `Arc`:
//! pool queues and service registrations hold strong clones, cleanup groups
//! hold weak ones, and destruction side effects run in `Drop`.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use taskpool_core::state::{Priority, WaitResult};
use taskpool_core::{tp_debug, tp_trace, tp_warn, PoolResult};

use crate::environment::Environment;
use crate::group::GroupShared;
use crate::instance::CallbackInstance;
use crate::io::IoCompletion;
use crate::pool::{default_pool, threadpool_lock, ThreadPool};
use crate::sync::Event;
use crate::wait::WaitState;

pub(crate) type SimpleCallback = Box<dyn FnOnce(&CallbackInstance) + Send>;
pub(crate) type WorkCallback = Box<dyn Fn(&CallbackInstance) + Send + Sync>;
pub(crate) type TimerCallback = Box<dyn Fn(&CallbackInstance) + Send + Sync>;
pub(crate) type WaitCallback = Box<dyn Fn(&CallbackInstance, WaitResult) + Send + Sync>;
pub(crate) type IoCallback = Box<dyn Fn(&CallbackInstance, &IoCompletion) + Send + Sync>;

/// Finalization callback, run after the main callback of every invocation.
pub type FinalizationCallback = Arc<dyn Fn(&CallbackInstance) + Send + Sync>;

/// Group-cancel callback; receives the datum passed to `release_members`.
pub type GroupCancelCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Timer scheduling state, owned by the timer service.
#[derive(Default)]
pub(crate) struct TimerState {
    pub initialized: bool,
    pub pending: bool,
    pub set: bool,
    /// Absolute expiry in 100-ns ticks.
    pub timeout: u64,
    /// Repeat period in ms; 0 means one-shot.
    pub period_ms: u32,
    /// Coalescing slack in ms.
    pub window_ms: u32,
}

/// I/O operation accounting, updated by the pump and the `Io` handle.
#[derive(Default)]
pub(crate) struct IoState {
    pub pending_count: u32,
    pub skipped_count: u32,
    pub shutting_down: bool,
    /// Completion stack; the dispatcher consumes from the tail.
    pub completions: Vec<IoCompletion>,
}

/// Kind-specific payload of a callback object.
pub(crate) enum Payload {
    Simple {
        callback: Mutex<Option<SimpleCallback>>,
    },
    Work {
        callback: WorkCallback,
    },
    Timer {
        callback: TimerCallback,
        timer: Mutex<TimerState>,
    },
    Wait {
        callback: WaitCallback,
        wait: Mutex<WaitState>,
    },
    Io {
        callback: IoCallback,
        key: AtomicU64,
    },
}

/// Counters shared by every object kind, guarded by `Object::state`.
#[derive(Default)]
pub(crate) struct ObjectState {
    pub num_pending: u32,
    pub num_running: u32,
    pub num_associated: u32,
    /// Unconsumed kernel signals for a wait object.
    pub signaled: u32,
    pub io: IoState,
}

impl ObjectState {
    /// Whether the object counts as finished.
    ///
    /// `group` selects the running-callbacks axis (used by group release);
    /// otherwise the associated-callbacks axis applies, so a disassociated
    /// callback no longer blocks the caller.
    pub(crate) fn is_finished(&self, group: bool) -> bool {
        if self.num_pending > 0 {
            return false;
        }
        if self.io.pending_count > 0 {
            return false;
        }
        if group {
            self.num_running == 0
        } else {
            self.num_associated == 0
        }
    }
}

/// Token for one committed callback invocation: the dispatch data captured
/// when the pending submission was consumed.
pub(crate) struct Invocation {
    wait_result: WaitResult,
    completion: Option<IoCompletion>,
}

pub(crate) struct Object {
    pub(crate) pool: Arc<ThreadPool>,
    pub(crate) group: Option<Arc<GroupShared>>,
    pub(crate) finalization: Option<FinalizationCallback>,
    pub(crate) group_cancel: Option<GroupCancelCallback>,
    pub(crate) may_run_long: bool,
    pub(crate) priority: Priority,
    /// Opaque value kept alive for the object's lifetime.
    pub(crate) keepalive: Option<Arc<dyn Any + Send + Sync>>,
    /// Signaled once when the object is destroyed.
    pub(crate) completion_event: Mutex<Option<Arc<Event>>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) is_group_member: AtomicBool,
    /// Bumped on wait reconfiguration; detects stale bucket wake-ups.
    pub(crate) update_serial: AtomicU32,
    pub(crate) state: Mutex<ObjectState>,
    pub(crate) finished: Condvar,
    pub(crate) group_finished: Condvar,
    pub(crate) payload: Payload,
}

impl Object {
    /// Allocate an object against the environment's pool (or the process
    /// default), attach it to its service, and register group membership.
    pub(crate) fn allocate(
        payload: Payload,
        env: Option<&Environment>,
    ) -> PoolResult<Arc<Object>> {
        let env = env.cloned().unwrap_or_default();
        let pool = match &env.pool {
            Some(pool) => pool.clone(),
            None => default_pool(),
        };

        if env.persistent {
            tp_warn!("persistent worker threads are not supported, ignoring");
        }

        threadpool_lock(&pool)?;

        let is_simple = matches!(payload, Payload::Simple { .. });
        let object = Arc::new(Object {
            pool,
            group: env.cleanup_group.clone(),
            finalization: env.finalization.clone(),
            group_cancel: env.group_cancel.clone(),
            may_run_long: env.long_function,
            priority: env.priority,
            keepalive: env.keepalive.clone(),
            completion_event: Mutex::new(env.completion_event.clone()),
            shutdown: AtomicBool::new(false),
            is_group_member: AtomicBool::new(false),
            update_serial: AtomicU32::new(0),
            state: Mutex::new(ObjectState::default()),
            finished: Condvar::new(),
            group_finished: Condvar::new(),
            payload,
        });

        let attach = match &object.payload {
            Payload::Timer { .. } => crate::timer::timerqueue_lock(&object),
            Payload::Wait { .. } => crate::wait::waitqueue_lock(&object),
            Payload::Io { .. } => crate::io::ioqueue_lock(&object),
            _ => Ok(()),
        };
        if let Err(err) = attach {
            // Unwind: the failed object never existed as far as the caller
            // is concerned, so suppress the completion event.
            *object.completion_event.lock().unwrap() = None;
            object.shutdown.store(true, Ordering::SeqCst);
            return Err(err);
        }

        // A simple callback is submitted before group insertion: once the
        // group's members have been released, submission is forbidden.
        if is_simple {
            object.submit(false);
        }

        if let Some(group) = &object.group {
            group
                .members
                .lock()
                .unwrap()
                .push(Arc::downgrade(&object));
            object.is_group_member.store(true, Ordering::SeqCst);
        }

        tp_trace!("allocated callback object");
        Ok(object)
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn timer_state(&self) -> &Mutex<TimerState> {
        match &self.payload {
            Payload::Timer { timer, .. } => timer,
            _ => unreachable!("not a timer object"),
        }
    }

    pub(crate) fn wait_state(&self) -> &Mutex<WaitState> {
        match &self.payload {
            Payload::Wait { wait, .. } => wait,
            _ => unreachable!("not a wait object"),
        }
    }

    pub(crate) fn io_key(&self) -> &AtomicU64 {
        match &self.payload {
            Payload::Io { key, .. } => key,
            _ => unreachable!("not an I/O object"),
        }
    }

    /// Queue one callback invocation on the owning pool.
    ///
    /// The first pending submission enqueues the object at its priority;
    /// further submissions only raise the pending count. Spawns a worker
    /// when all current workers are busy and the ceiling allows it.
    pub(crate) fn submit(self: &Arc<Self>, signaled: bool) {
        let pool = self.pool.clone();
        debug_assert!(!self.is_shutdown());

        let mut inner = pool.inner.lock().unwrap();
        debug_assert!(!inner.shutdown);

        let mut spawned = false;
        if inner.num_busy_workers >= inner.num_workers && inner.num_workers < inner.max_workers
        {
            spawned = pool.spawn_worker(&mut inner).is_ok();
        }

        {
            let mut st = self.state.lock().unwrap();
            st.num_pending += 1;
            if st.num_pending == 1 {
                inner.enqueue(self.clone(), self.priority);
            }
            if signaled && matches!(self.payload, Payload::Wait { .. }) {
                st.signaled += 1;
            }
        }
        drop(inner);

        // No new thread started - wake an existing one.
        if !spawned {
            pool.update.notify_one();
        }
    }

    /// Drop all queued submissions. Running callbacks are unaffected.
    pub(crate) fn cancel(self: &Arc<Self>) {
        let pool = self.pool.clone();
        let mut dropped = None;
        {
            let mut inner = pool.inner.lock().unwrap();
            let mut st = self.state.lock().unwrap();
            if st.num_pending > 0 {
                st.num_pending = 0;
                dropped = inner.remove_queued(self);
                if matches!(self.payload, Payload::Wait { .. }) {
                    st.signaled = 0;
                }
            }
            if matches!(self.payload, Payload::Io { .. }) {
                // Pending kernel operations become skipped: their eventual
                // completions are swallowed by the pump.
                st.io.skipped_count += st.io.pending_count;
                st.io.pending_count = 0;
            }
        }
        drop(dropped);
    }

    /// Block until the object counts as finished on the chosen axis.
    pub(crate) fn wait_finished(&self, group_wait: bool) {
        let mut st = self.state.lock().unwrap();
        while !st.is_finished(group_wait) {
            st = if group_wait {
                self.group_finished.wait(st).unwrap()
            } else {
                self.finished.wait(st).unwrap()
            };
        }
    }

    fn begin_locked(st: &mut ObjectState, payload: &Payload) -> Invocation {
        debug_assert!(st.num_pending > 0);
        st.num_pending -= 1;

        let mut wait_result = WaitResult::TimedOut;
        let mut completion = None;
        match payload {
            Payload::Wait { .. } => {
                if st.signaled > 0 {
                    st.signaled -= 1;
                    wait_result = WaitResult::Signaled;
                }
            }
            Payload::Io { .. } => {
                debug_assert!(!st.io.completions.is_empty());
                completion = st.io.completions.pop();
            }
            _ => {}
        }

        st.num_running += 1;
        st.num_associated += 1;
        Invocation {
            wait_result,
            completion,
        }
    }

    /// Consume one pending submission and move it to running/associated.
    ///
    /// Callers dispatching from a pool queue invoke this while still
    /// holding the pool lock, so a concurrent `cancel` cannot zero the
    /// pending count between dequeue and this transition. Returns the
    /// invocation token plus the number of submissions still pending (the
    /// requeue signal).
    pub(crate) fn begin_invocation(&self) -> (Invocation, u32) {
        let mut st = self.state.lock().unwrap();
        let run = Self::begin_locked(&mut st, &self.payload);
        (run, st.num_pending)
    }

    /// Commit one un-queued invocation and run it on the current thread,
    /// as the wait-bucket threads do for execute-inline waits.
    pub(crate) fn execute_direct(self: &Arc<Self>, signaled: bool) {
        let run = {
            let mut st = self.state.lock().unwrap();
            st.num_pending += 1;
            if signaled {
                st.signaled += 1;
            }
            Self::begin_locked(&mut st, &self.payload)
        };
        self.invoke(run);
    }

    /// Run one callback invocation on the current thread.
    ///
    /// Takes and releases the object's own locks; the caller must hold
    /// none of the runtime's locks.
    pub(crate) fn invoke(self: &Arc<Self>, run: Invocation) {
        let Invocation {
            wait_result,
            completion,
        } = run;

        let instance = CallbackInstance::new(self.clone(), self.may_run_long);

        match &self.payload {
            Payload::Simple { callback } => {
                let callback = callback.lock().unwrap().take();
                if let Some(callback) = callback {
                    tp_trace!("executing simple callback");
                    callback(&instance);
                }
            }
            Payload::Work { callback } => {
                tp_trace!("executing work callback");
                callback(&instance);
            }
            Payload::Timer { callback, .. } => {
                tp_trace!("executing timer callback");
                callback(&instance);
            }
            Payload::Wait { callback, .. } => {
                tp_trace!("executing wait callback ({:?})", wait_result);
                callback(&instance, wait_result);
            }
            Payload::Io { callback, .. } => {
                if let Some(completion) = &completion {
                    tp_trace!("executing I/O callback");
                    callback(&instance, completion);
                }
            }
        }

        if let Some(finalization) = &self.finalization {
            tp_trace!("executing finalization callback");
            finalization(&instance);
        }

        instance.run_cleanups();
        let associated = instance.is_associated();
        drop(instance);

        let mut st = self.state.lock().unwrap();

        // Simple callbacks shut down automatically after execution.
        if matches!(self.payload, Payload::Simple { .. }) {
            self.shutdown.store(true, Ordering::SeqCst);
        }

        st.num_running -= 1;
        if st.is_finished(true) {
            self.group_finished.notify_all();
        }
        if associated {
            st.num_associated -= 1;
            if st.is_finished(false) {
                self.finished.notify_all();
            }
        }
    }

    /// Detach the object from its service ahead of destruction.
    pub(crate) fn prepare_shutdown(self: &Arc<Self>) {
        match &self.payload {
            Payload::Timer { .. } => crate::timer::timerqueue_unlock(self),
            Payload::Wait { .. } => crate::wait::waitqueue_unlock(self),
            Payload::Io { .. } => crate::io::ioqueue_unlock(self),
            _ => {}
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        debug_assert!(self.shutdown.load(Ordering::SeqCst));
        {
            let st = self.state.get_mut().unwrap();
            debug_assert_eq!(st.num_pending, 0);
            debug_assert_eq!(st.num_running, 0);
            debug_assert_eq!(st.num_associated, 0);
        }

        // Leave the group's member list. The members lock is a leaf lock,
        // so this is safe even when the final reference is dropped by a
        // service thread.
        if let Some(group) = &self.group {
            if self.is_group_member.swap(false, Ordering::SeqCst) {
                let mut members = group.members.lock().unwrap();
                members.retain(|weak| weak.strong_count() > 0);
            }
        }

        // Return the object count taken at allocation time.
        let mut inner = self.pool.inner.lock().unwrap();
        inner.objcount -= 1;
        drop(inner);

        if let Some(event) = self.completion_event.get_mut().unwrap().take() {
            let _ = event.set();
        }

        // The keep-alive value goes last, after the object has otherwise
        // wound down.
        drop(self.keepalive.take());
        tp_trace!("destroyed callback object");
    }
}

/// A manually posted work object.
///
/// Dropping the handle releases the object; callbacks already queued or
/// running still complete first.
pub struct Work {
    pub(crate) object: Arc<Object>,
}

impl Work {
    pub fn new<F>(env: Option<&Environment>, callback: F) -> PoolResult<Work>
    where
        F: Fn(&CallbackInstance) + Send + Sync + 'static,
    {
        let object = Object::allocate(
            Payload::Work {
                callback: Box::new(callback),
            },
            env,
        )?;
        tp_debug!("allocated work object");
        Ok(Work { object })
    }

    /// Queue one invocation of the callback.
    pub fn post(&self) {
        self.object.submit(false);
    }

    /// Wait for outstanding callbacks, optionally cancelling queued ones.
    pub fn wait(&self, cancel_pending: bool) {
        if cancel_pending {
            self.object.cancel();
        }
        self.object.wait_finished(false);
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        self.object.prepare_shutdown();
        self.object.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Post a one-shot anonymous callback.
///
/// The callback object is created, submitted once, and destroyed after the
/// callback has run.
pub fn try_post_simple<F>(env: Option<&Environment>, callback: F) -> PoolResult<()>
where
    F: FnOnce(&CallbackInstance) + Send + 'static,
{
    let object = Object::allocate(
        Payload::Simple {
            callback: Mutex::new(Some(Box::new(callback))),
        },
        env,
    )?;
    // The queued submission (and group, if any) hold the remaining
    // references.
    drop(object);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_work_post_and_wait() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let work = Work::new(None, move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        work.post();
        work.post();
        work.wait(false);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_work_cancel_pending() {
        let pool = Pool::new();
        pool.set_max_threads(1);

        let gate = Arc::new(crate::sync::Event::new().unwrap());
        let ran = Arc::new(AtomicUsize::new(0));

        let env = Environment::new().with_pool(&pool);
        let gate2 = gate.clone();
        let blocker = Work::new(Some(&env), move |_| {
            gate2.wait();
        })
        .unwrap();
        blocker.post();

        // While the only worker is blocked, queued submissions of a second
        // work object can be cancelled before they run.
        let ran2 = ran.clone();
        let work = Work::new(Some(&env), move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        work.post();
        work.post();
        std::thread::sleep(Duration::from_millis(50));
        work.wait(true);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        gate.set().unwrap();
        blocker.wait(false);
    }

    #[test]
    fn test_simple_callback_runs_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(crate::sync::Event::new().unwrap());

        let ran2 = ran.clone();
        let done2 = done.clone();
        try_post_simple(None, move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
            done2.set().unwrap();
        })
        .unwrap();

        assert!(done.wait_ms(5000));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_event_signaled_on_release() {
        let completed = Arc::new(crate::sync::Event::new().unwrap());
        let env = Environment::new().with_completion_event(completed.clone());

        let work = Work::new(Some(&env), |_| {}).unwrap();
        work.post();
        work.wait(false);
        assert!(!completed.try_consume());

        drop(work);
        assert!(completed.wait_ms(5000));
    }

    #[test]
    fn test_finalization_callback() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let f2 = finalized.clone();
        let env = Environment::new().with_finalization(move |_| {
            f2.fetch_add(1, Ordering::SeqCst);
        });

        let work = Work::new(Some(&env), |_| {}).unwrap();
        work.post();
        work.wait(false);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }
}
