//! The wait service: buckets of handle waits multiplexed onto dedicated
//! threads.
//!
//! Every wait object belongs to a bucket of at most
//! `MAX_WAITQUEUE_OBJECTS` registrations sharing the same alertability.
//! A bucket thread multi-waits with `poll(2)` over the armed handles plus
//! the bucket's update event; producers signal the update event whenever
//! they change a registration. A satisfied wait consumes one signal token
//! from its fd (auto-reset semantics) and is dispatched either through the
//! pool or inline on the bucket thread. Stale wake-ups are detected by
//! comparing the object's update serial against a snapshot taken when the
//! handle was armed. Buckets that drain to a third of capacity merge into a
//! compatible peer and retire.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use taskpool_core::constants::{MAX_WAITQUEUE_OBJECTS, NO_TIMEOUT, WORKER_TIMEOUT_MS};
use taskpool_core::state::WaitResult;
use taskpool_core::{tp_debug, tp_error, tp_warn, PoolError, PoolResult};

use crate::environment::Environment;
use crate::instance::CallbackInstance;
use crate::object::{Object, Payload};
use crate::sync;
use crate::time;

/// Behavior flags for a wait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFlags {
    /// Disarm after the first satisfied wait (signal or timeout).
    pub oneshot: bool,
    /// Run the callback inline on the bucket thread instead of the pool.
    pub in_wait_thread: bool,
    /// Bucket alertability class; alertable waits also run inline.
    pub alertable: bool,
}

impl Default for WaitFlags {
    fn default() -> Self {
        Self {
            oneshot: true,
            in_wait_thread: false,
            alertable: false,
        }
    }
}

impl WaitFlags {
    #[inline]
    pub(crate) fn runs_in_wait_thread(&self) -> bool {
        self.in_wait_thread || self.alertable
    }
}

/// Wait registration state, owned by the wait service.
pub(crate) struct WaitState {
    pub bucket: Option<Arc<Bucket>>,
    /// Armed: the object sits in the bucket's waiting list.
    pub pending: bool,
    /// Absolute deadline in 100-ns ticks.
    pub timeout: u64,
    pub handle: Option<RawFd>,
    pub flags: WaitFlags,
}

impl WaitState {
    pub(crate) fn new(flags: WaitFlags) -> Self {
        Self {
            bucket: None,
            pending: false,
            timeout: 0,
            handle: None,
            flags,
        }
    }
}

#[derive(Default)]
struct BucketLists {
    /// Registered but no handle armed.
    reserved: Vec<Arc<Object>>,
    /// Handle armed, participating in the multi-wait.
    waiting: Vec<Arc<Object>>,
}

impl BucketLists {
    fn count(&self) -> usize {
        self.reserved.len() + self.waiting.len()
    }

    fn remove(&mut self, object: &Arc<Object>) {
        self.reserved.retain(|entry| !Arc::ptr_eq(entry, object));
        self.waiting.retain(|entry| !Arc::ptr_eq(entry, object));
    }

    fn move_to_reserved(&mut self, object: &Arc<Object>) {
        if let Some(pos) = self
            .waiting
            .iter()
            .position(|entry| Arc::ptr_eq(entry, object))
        {
            let entry = self.waiting.remove(pos);
            self.reserved.push(entry);
        }
    }
}

pub(crate) struct Bucket {
    alertable: bool,
    update_fd: RawFd,
    lists: Mutex<BucketLists>,
}

impl Bucket {
    fn new(alertable: bool) -> std::io::Result<Bucket> {
        Ok(Bucket {
            alertable,
            update_fd: sync::eventfd_plain()?,
            lists: Mutex::new(BucketLists::default()),
        })
    }

    fn signal_update(&self) {
        let _ = sync::eventfd_add(self.update_fd, 1);
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if self.update_fd >= 0 {
            unsafe {
                libc::close(self.update_fd);
            }
            self.update_fd = -1;
        }
    }
}

unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}

struct WaitQueue {
    /// Bucket order matters: registration is first-fit, merged-out buckets
    /// rotate to the tail.
    inner: Mutex<Vec<Arc<Bucket>>>,
}

fn waitqueue() -> &'static WaitQueue {
    static QUEUE: OnceLock<WaitQueue> = OnceLock::new();
    QUEUE.get_or_init(|| WaitQueue {
        inner: Mutex::new(Vec::new()),
    })
}

/// Number of live buckets of one alertability class (test introspection).
#[cfg(test)]
pub(crate) fn num_buckets_for(alertable: bool) -> usize {
    waitqueue()
        .inner
        .lock()
        .unwrap()
        .iter()
        .filter(|bucket| bucket.alertable == alertable)
        .count()
}

/// Register a wait object: place it in a compatible bucket with capacity or
/// create a new bucket and its thread.
pub(crate) fn waitqueue_lock(wait: &Arc<Object>) -> PoolResult<()> {
    let alertable = {
        let mut ws = wait.wait_state().lock().unwrap();
        ws.bucket = None;
        ws.pending = false;
        ws.timeout = 0;
        ws.handle = None;
        ws.flags.alertable
    };

    let queue = waitqueue();
    let mut buckets = queue.inner.lock().unwrap();

    for bucket in buckets.iter() {
        if bucket.alertable != alertable {
            continue;
        }
        let mut lists = bucket.lists.lock().unwrap();
        if lists.count() < MAX_WAITQUEUE_OBJECTS {
            lists.reserved.push(wait.clone());
            drop(lists);
            wait.wait_state().lock().unwrap().bucket = Some(bucket.clone());
            return Ok(());
        }
    }

    // No room anywhere: new bucket plus its thread.
    let bucket = Arc::new(Bucket::new(alertable)?);
    let thread_bucket = bucket.clone();
    std::thread::Builder::new()
        .name("tp-waitq".into())
        .spawn(move || waitqueue_bucket_proc(thread_bucket))
        .map_err(|err| {
            tp_error!("failed to spawn wait queue thread: {}", err);
            PoolError::SpawnFailed
        })?;

    bucket.lists.lock().unwrap().reserved.push(wait.clone());
    wait.wait_state().lock().unwrap().bucket = Some(bucket.clone());
    buckets.push(bucket);
    Ok(())
}

/// Deregister a wait object. Idempotent.
pub(crate) fn waitqueue_unlock(wait: &Arc<Object>) {
    let queue = waitqueue();
    let buckets = queue.inner.lock().unwrap();

    let bucket = { wait.wait_state().lock().unwrap().bucket.clone() };
    if let Some(bucket) = bucket {
        {
            let mut lists = bucket.lists.lock().unwrap();
            lists.remove(wait);
            let mut ws = wait.wait_state().lock().unwrap();
            ws.bucket = None;
            ws.pending = false;
        }
        bucket.signal_update();
    }
    drop(buckets);
}

fn waitqueue_bucket_proc(bucket: Arc<Bucket>) {
    tp_debug!("starting wait queue thread");
    let queue = waitqueue();
    let mut buckets = queue.inner.lock().unwrap();

    loop {
        let now = time::now_ticks();
        let mut deadline = NO_TIMEOUT;
        // (object, armed fd, update-serial snapshot)
        let mut armed: Vec<(Arc<Object>, RawFd, u32)> = Vec::new();
        let mut inline_runs: Vec<Arc<Object>> = Vec::new();
        let empty;

        {
            let mut lists = bucket.lists.lock().unwrap();
            empty = lists.count() == 0;
            let waiting: Vec<Arc<Object>> = lists.waiting.clone();
            for wait in waiting {
                let (expired, flags, handle, timeout) = {
                    let ws = wait.wait_state().lock().unwrap();
                    debug_assert!(ws.pending);
                    (ws.timeout <= now, ws.flags, ws.handle, ws.timeout)
                };

                if expired {
                    // Deadline passed: dispatch as a timeout.
                    if flags.oneshot {
                        lists.move_to_reserved(&wait);
                        wait.wait_state().lock().unwrap().pending = false;
                    }
                    if flags.runs_in_wait_thread() {
                        inline_runs.push(wait.clone());
                    } else {
                        wait.submit(false);
                    }
                } else {
                    deadline = deadline.min(timeout);
                    if let Some(fd) = handle {
                        armed.push((
                            wait.clone(),
                            fd,
                            wait.update_serial.load(Ordering::SeqCst),
                        ));
                    }
                }
            }
        }

        if empty {
            // Every wait object is gone; give new registrations a grace
            // period before retiring this thread.
            drop(buckets);
            let woke =
                sync::poll_readable(bucket.update_fd, WORKER_TIMEOUT_MS as libc::c_int);
            if woke {
                sync::eventfd_take(bucket.update_fd);
            }
            buckets = queue.inner.lock().unwrap();
            if !woke && bucket.lists.lock().unwrap().count() == 0 {
                break;
            }
            continue;
        }

        drop(buckets);

        // Timed-out inline waits run here, with no service locks held.
        for wait in inline_runs.drain(..) {
            wait.execute_direct(false);
        }

        // Multi-wait over the armed handles plus the update event.
        let mut fds: Vec<libc::pollfd> = armed
            .iter()
            .map(|(_, fd, _)| libc::pollfd {
                fd: *fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        fds.push(libc::pollfd {
            fd: bucket.update_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        let timeout_ms = time::poll_timeout_ms(deadline);
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        buckets = queue.inner.lock().unwrap();

        if ready > 0 {
            // Lowest-index satisfied wait wins; others stay readable and are
            // picked up on the next pass.
            let hit = (0..armed.len()).find(|&i| {
                fds[i].revents
                    & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)
                    != 0
            });
            if let Some(idx) = hit {
                if fds[idx].revents & libc::POLLIN == 0 {
                    tp_warn!("wait handle in error state, dispatching anyway");
                }
                let (wait, fd, serial) = (
                    armed[idx].0.clone(),
                    armed[idx].1,
                    armed[idx].2,
                );

                // Consume one signal token (auto-reset). A stale or broken
                // handle may fail the read; that is fine.
                let _ = sync::eventfd_take(fd);

                let mut lists = bucket.lists.lock().unwrap();
                let (still_here, flags) = {
                    let ws = wait.wait_state().lock().unwrap();
                    let here = ws
                        .bucket
                        .as_ref()
                        .map_or(false, |b| Arc::ptr_eq(b, &bucket))
                        && ws.pending;
                    (here, ws.flags)
                };

                if still_here && wait.update_serial.load(Ordering::SeqCst) == serial {
                    if flags.oneshot {
                        lists.move_to_reserved(&wait);
                        wait.wait_state().lock().unwrap().pending = false;
                    }
                    if flags.runs_in_wait_thread() {
                        drop(lists);
                        drop(buckets);
                        wait.execute_direct(true);
                        buckets = queue.inner.lock().unwrap();
                    } else {
                        drop(lists);
                        wait.submit(true);
                    }
                } else {
                    tp_debug!(
                        "wait event discarded, object was {}",
                        if still_here { "updated" } else { "rearmed or destroyed" }
                    );
                }
            }

            // Drain the update event if it fired (reads clear the counter).
            if fds[armed.len()].revents & libc::POLLIN != 0 {
                sync::eventfd_take(bucket.update_fd);
            }
        }

        // Drop the temporary references taken for the poll set.
        armed.clear();

        maybe_merge(&bucket, &mut buckets);
    }

    // Retire: unlink the bucket.
    if let Some(pos) = buckets.iter().position(|b| Arc::ptr_eq(b, &bucket)) {
        buckets.remove(pos);
    }
    debug_assert_eq!(bucket.lists.lock().unwrap().count(), 0);
    drop(buckets);
    tp_debug!("terminating wait queue thread");
}

/// Merge a mostly drained bucket into a compatible peer, rotating the empty
/// bucket to the tail so new registrations prefer the others.
fn maybe_merge(bucket: &Arc<Bucket>, buckets: &mut Vec<Arc<Bucket>>) {
    if buckets.len() <= 1 {
        return;
    }
    let my_count = bucket.lists.lock().unwrap().count();
    if my_count == 0 || my_count > MAX_WAITQUEUE_OBJECTS / 3 {
        return;
    }

    let target = buckets
        .iter()
        .find(|other| {
            !Arc::ptr_eq(*other, bucket) && other.alertable == bucket.alertable && {
                let count = other.lists.lock().unwrap().count();
                count > 0 && count + my_count <= MAX_WAITQUEUE_OBJECTS * 2 / 3
            }
        })
        .cloned();
    let Some(target) = target else { return };

    {
        let mut src = bucket.lists.lock().unwrap();
        let mut dst = target.lists.lock().unwrap();
        for wait in src.reserved.drain(..) {
            wait.wait_state().lock().unwrap().bucket = Some(target.clone());
            dst.reserved.push(wait);
        }
        for wait in src.waiting.drain(..) {
            wait.wait_state().lock().unwrap().bucket = Some(target.clone());
            dst.waiting.push(wait);
        }
    }

    if let Some(pos) = buckets.iter().position(|b| Arc::ptr_eq(b, bucket)) {
        let drained = buckets.remove(pos);
        buckets.push(drained);
    }
    target.signal_update();
    tp_debug!("merged wait bucket into peer");
}

/// A threadpool wait object.
///
/// The callback fires when the armed handle is signaled or the deadline
/// passes. Dropping the handle releases the object.
pub struct Wait {
    pub(crate) object: Arc<Object>,
}

impl Wait {
    /// One-shot wait dispatched through the pool (the common case).
    pub fn new<F>(env: Option<&Environment>, callback: F) -> PoolResult<Wait>
    where
        F: Fn(&CallbackInstance, WaitResult) + Send + Sync + 'static,
    {
        Self::with_flags(env, WaitFlags::default(), callback)
    }

    pub fn with_flags<F>(
        env: Option<&Environment>,
        flags: WaitFlags,
        callback: F,
    ) -> PoolResult<Wait>
    where
        F: Fn(&CallbackInstance, WaitResult) + Send + Sync + 'static,
    {
        let object = Object::allocate(
            Payload::Wait {
                callback: Box::new(callback),
                wait: Mutex::new(WaitState::new(flags)),
            },
            env,
        )?;
        tp_debug!("allocated wait object");
        Ok(Wait { object })
    }

    /// Arm the wait on `handle` with an optional deadline, or disarm with
    /// `None`.
    ///
    /// `timeout` is a 100-ns timestamp (negative = relative, `None` = wait
    /// forever). Changing the handle bumps the object's update serial so
    /// in-flight wake-ups for the old registration are discarded. Returns
    /// whether a previously armed wait was replaced.
    pub fn set(&self, handle: Option<RawFd>, timeout: Option<i64>) -> bool {
        let object = &self.object;
        let queue = waitqueue();
        let _buckets = queue.inner.lock().unwrap();

        let bucket = object
            .wait_state()
            .lock()
            .unwrap()
            .bucket
            .clone()
            .expect("wait object is registered");

        let mut lists = bucket.lists.lock().unwrap();
        let mut ws = object.wait_state().lock().unwrap();
        let same_handle = ws.handle == handle;
        ws.handle = handle;

        let mut replaced = false;
        if handle.is_some() || ws.pending {
            lists.remove(object);
            replaced = ws.pending;

            if handle.is_some() {
                let deadline = match timeout {
                    Some(t) => time::absolute_deadline(t),
                    None => NO_TIMEOUT,
                };
                ws.pending = true;
                ws.timeout = deadline;
                drop(ws);
                lists.waiting.push(object.clone());
            } else {
                ws.pending = false;
                drop(ws);
                lists.reserved.push(object.clone());
            }

            if !same_handle {
                object.update_serial.fetch_add(1, Ordering::SeqCst);
            }
            bucket.signal_update();
        }

        replaced
    }

    /// Wait for outstanding callbacks, optionally cancelling queued ones.
    pub fn wait(&self, cancel_pending: bool) {
        if cancel_pending {
            self.object.cancel();
        }
        self.object.wait_finished(false);
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        self.object.prepare_shutdown();
        self.object.shutdown.store(true, Ordering::SeqCst);
    }
}
