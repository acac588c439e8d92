//! Per-invocation callback instances.
//!
//! An instance exists for the duration of one callback invocation and is
//! only valid on the thread running it. Through it a callback can promote
//! itself to long-running, disassociate from its object's finished state,
//! and register cleanup actions that run after the callback returns.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::ThreadId;

use taskpool_core::{tp_warn, PoolError, PoolResult};

use crate::object::Object;
use crate::sync::{CriticalSection, Event, Semaphore};

#[derive(Default)]
struct CleanupSlots {
    critical_section: Option<Arc<CriticalSection>>,
    semaphore: Option<(Arc<Semaphore>, u32)>,
    event: Option<Arc<Event>>,
    drop_value: Option<Box<dyn Any + Send>>,
}

/// Handle passed to every callback for the duration of its invocation.
pub struct CallbackInstance {
    object: Arc<Object>,
    thread: ThreadId,
    associated: Cell<bool>,
    may_run_long: Cell<bool>,
    cleanup: RefCell<CleanupSlots>,
}

impl CallbackInstance {
    pub(crate) fn new(object: Arc<Object>, may_run_long: bool) -> Self {
        Self {
            object,
            thread: std::thread::current().id(),
            associated: Cell::new(true),
            may_run_long: Cell::new(may_run_long),
            cleanup: RefCell::new(CleanupSlots::default()),
        }
    }

    #[inline]
    fn on_callback_thread(&self) -> bool {
        std::thread::current().id() == self.thread
    }

    /// Tell the pool this callback may block for a long time.
    ///
    /// If all workers are busy, one more thread is spawned; at the ceiling
    /// this reports `TooManyThreads`. Idempotent once promoted.
    pub fn may_run_long(&self) -> PoolResult<()> {
        if !self.on_callback_thread() {
            tp_warn!("may_run_long called from wrong thread, ignoring");
            return Err(PoolError::WrongThread);
        }
        if self.may_run_long.get() {
            return Ok(());
        }

        let pool = &self.object.pool;
        let mut inner = pool.inner.lock().unwrap();
        let mut status = Ok(());
        if inner.num_busy_workers >= inner.num_workers {
            if inner.num_workers < inner.max_workers {
                status = pool.spawn_worker(&mut inner);
            } else {
                status = Err(PoolError::TooManyThreads);
            }
        }
        drop(inner);

        self.may_run_long.set(true);
        status
    }

    /// Drop the association between this invocation and its object.
    ///
    /// Afterwards `finished` waiters may be released even while the callback
    /// is still running.
    pub fn disassociate(&self) {
        if !self.on_callback_thread() {
            tp_warn!("disassociate called from wrong thread, ignoring");
            return;
        }
        if !self.associated.get() {
            return;
        }

        let object = &self.object;
        let mut st = object.state.lock().unwrap();
        st.num_associated -= 1;
        if st.is_finished(false) {
            object.finished.notify_all();
        }
        drop(st);

        self.associated.set(false);
    }

    /// Leave `cs` after the callback completes. First registration wins.
    pub fn leave_critical_section_on_completion(&self, cs: Arc<CriticalSection>) {
        let mut slots = self.cleanup.borrow_mut();
        if slots.critical_section.is_none() {
            slots.critical_section = Some(cs);
        }
    }

    /// Release `semaphore` by `count` after the callback completes.
    pub fn release_semaphore_on_completion(&self, semaphore: Arc<Semaphore>, count: u32) {
        let mut slots = self.cleanup.borrow_mut();
        if slots.semaphore.is_none() {
            slots.semaphore = Some((semaphore, count));
        }
    }

    /// Signal `event` after the callback completes.
    pub fn set_event_on_completion(&self, event: Arc<Event>) {
        let mut slots = self.cleanup.borrow_mut();
        if slots.event.is_none() {
            slots.event = Some(event);
        }
    }

    /// Drop `value` after the callback completes (releasing whatever it
    /// keeps alive).
    pub fn drop_on_completion(&self, value: Box<dyn Any + Send>) {
        let mut slots = self.cleanup.borrow_mut();
        if slots.drop_value.is_none() {
            slots.drop_value = Some(value);
        }
    }

    pub(crate) fn is_associated(&self) -> bool {
        self.associated.get()
    }

    /// Run registered cleanups in order. A failing release or signal skips
    /// the remaining slots; the worker itself carries on.
    pub(crate) fn run_cleanups(&self) {
        let slots = std::mem::take(&mut *self.cleanup.borrow_mut());

        if let Some(cs) = slots.critical_section {
            cs.leave();
        }
        if let Some((semaphore, count)) = slots.semaphore {
            if let Err(err) = semaphore.release(count) {
                tp_warn!("cleanup semaphore release failed: {}", err);
                return;
            }
        }
        if let Some(event) = slots.event {
            if let Err(err) = event.set() {
                tp_warn!("cleanup event signal failed: {}", err);
                return;
            }
        }
        drop(slots.drop_value);
    }
}
