//! Completion-port I/O: a single pump thread bridging kernel-style
//! completion packets into threadpool callbacks.
//!
//! The port itself is an unbounded packet queue paired with a counting
//! eventfd, so producers post from any thread and the pump blocks without
//! spinning. Every I/O object is registered under a non-zero key; packet
//! key 0 is reserved for the wake-up the service posts when the last object
//! detaches, letting the pump notice it can retire.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use taskpool_core::constants::WORKER_TIMEOUT_MS;
use taskpool_core::{tp_debug, tp_error, tp_trace, PoolError, PoolResult};

use crate::environment::Environment;
use crate::instance::CallbackInstance;
use crate::object::{Object, Payload};
use crate::sync;

/// One completed I/O operation, delivered to the object's callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// Operation status (0 = success, otherwise a negated errno or
    /// caller-defined code).
    pub status: i32,
    /// Bytes transferred or equivalent result quantity.
    pub information: usize,
    /// Caller-supplied per-operation value.
    pub value: u64,
}

/// A packet as it travels through the completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPacket {
    pub key: u64,
    pub value: u64,
    pub status: i32,
    pub information: usize,
}

/// The host completion-port collaborator.
///
/// `post` enqueues a packet and adds one token to the ready counter;
/// `remove` blocks consuming one token per packet, so packets are never
/// lost and the pump never spins.
pub struct CompletionPort {
    packets: SegQueue<CompletionPacket>,
    ready_fd: RawFd,
}

impl CompletionPort {
    fn new() -> io::Result<CompletionPort> {
        let fd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionPort {
            packets: SegQueue::new(),
            ready_fd: fd,
        })
    }

    /// Post a completion packet. Safe from any thread.
    pub fn post(&self, key: u64, value: u64, status: i32, information: usize) -> io::Result<()> {
        self.packets.push(CompletionPacket {
            key,
            value,
            status,
            information,
        });
        sync::eventfd_add(self.ready_fd, 1)
    }

    /// Blocking removal of the next packet (pump thread only).
    pub(crate) fn remove(&self) -> CompletionPacket {
        loop {
            if sync::eventfd_take(self.ready_fd) {
                // A consumed token guarantees a matching push has completed.
                if let Some(packet) = self.packets.pop() {
                    return packet;
                }
                continue;
            }
            sync::poll_readable(self.ready_fd, -1);
        }
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        if self.ready_fd >= 0 {
            unsafe {
                libc::close(self.ready_fd);
            }
            self.ready_fd = -1;
        }
    }
}

unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

struct IoQueueInner {
    objcount: usize,
    thread_running: bool,
    port: Option<Arc<CompletionPort>>,
    /// key -> live object; holds the reference the pump resolves packets
    /// against.
    registry: HashMap<u64, Arc<Object>>,
    next_key: u64,
}

struct IoQueue {
    inner: Mutex<IoQueueInner>,
    update: Condvar,
}

fn ioqueue() -> &'static IoQueue {
    static QUEUE: OnceLock<IoQueue> = OnceLock::new();
    QUEUE.get_or_init(|| IoQueue {
        inner: Mutex::new(IoQueueInner {
            objcount: 0,
            thread_running: false,
            port: None,
            registry: HashMap::new(),
            next_key: 1,
        }),
        update: Condvar::new(),
    })
}

/// Attach an I/O object: create the port lazily, start the pump lazily,
/// and register the object under a fresh key.
pub(crate) fn ioqueue_lock(io: &Arc<Object>) -> PoolResult<()> {
    let queue = ioqueue();
    let mut inner = queue.inner.lock().unwrap();

    if inner.port.is_none() {
        inner.port = Some(Arc::new(CompletionPort::new()?));
    }

    if !inner.thread_running {
        std::thread::Builder::new()
            .name("tp-ioq".into())
            .spawn(ioqueue_thread_proc)
            .map_err(|err| {
                tp_error!("failed to spawn I/O completion thread: {}", err);
                PoolError::SpawnFailed
            })?;
        inner.thread_running = true;
    }

    let key = inner.next_key;
    inner.next_key += 1;
    io.io_key().store(key, Ordering::SeqCst);
    inner.registry.insert(key, io.clone());

    inner.objcount += 1;
    if inner.objcount == 1 {
        // The pump may be sitting in its idle wait.
        queue.update.notify_one();
    }
    Ok(())
}

/// Detach an I/O object. Idempotent; posts the zero-key wake-up when the
/// last object goes away so the pump can begin its idle countdown.
pub(crate) fn ioqueue_unlock(io: &Arc<Object>) {
    let queue = ioqueue();
    let mut inner = queue.inner.lock().unwrap();

    let key = io.io_key().swap(0, Ordering::SeqCst);
    if key == 0 {
        return;
    }
    let removed = inner.registry.remove(&key);
    debug_assert!(inner.objcount > 0);
    inner.objcount -= 1;

    if !io.is_shutdown() && inner.objcount == 0 {
        if let Some(port) = &inner.port {
            let _ = port.post(0, 0, 0, 0);
        }
    }
    drop(inner);
    drop(removed);
}

fn ioqueue_thread_proc() {
    tp_debug!("starting I/O completion thread");
    let queue = ioqueue();
    let mut inner = queue.inner.lock().unwrap();

    loop {
        let port = inner.port.clone().expect("port exists while pump runs");
        drop(inner);
        let packet = port.remove();
        inner = queue.inner.lock().unwrap();

        let io = if packet.key != 0 {
            inner.registry.get(&packet.key).cloned()
        } else {
            None
        };

        let mut destroy = false;
        let mut skip = false;
        if let Some(io) = &io {
            let mut st = io.state.lock().unwrap();
            if io.is_shutdown() || st.io.shutting_down {
                // The object is going away: swallow skipped completions and
                // destroy it once the last one has been consumed.
                if st.io.pending_count == 0 {
                    if st.io.skipped_count > 0 {
                        st.io.skipped_count -= 1;
                    }
                    if st.io.skipped_count > 0 {
                        skip = true;
                    } else {
                        destroy = true;
                    }
                }
            }
        }

        if skip {
            continue;
        }

        if destroy {
            let io = io.unwrap();
            debug_assert!(inner.objcount > 0);
            inner.objcount -= 1;
            tp_debug!("releasing drained I/O object");
            io.shutdown.store(true, Ordering::SeqCst);
            io.io_key().store(0, Ordering::SeqCst);
            let dropped = inner.registry.remove(&packet.key);
            drop(dropped);
        } else if let Some(io) = io {
            let mut st = io.state.lock().unwrap();
            tp_trace!("io completion, {} operations pending", st.io.pending_count);
            if st.io.pending_count > 0 {
                st.io.pending_count -= 1;
                st.io.completions.push(IoCompletion {
                    status: packet.status,
                    information: packet.information,
                    value: packet.value,
                });
                drop(st);
                io.submit(false);
            }
        }

        if inner.objcount == 0 {
            // All I/O objects destroyed: linger before retiring.
            let (guard, timeout) = queue
                .update
                .wait_timeout(inner, Duration::from_millis(WORKER_TIMEOUT_MS))
                .unwrap();
            inner = guard;
            if timeout.timed_out() && inner.objcount == 0 {
                break;
            }
        }
    }

    inner.thread_running = false;
    drop(inner);
    tp_debug!("terminating I/O completion thread");
}

/// A threadpool I/O object.
///
/// Each started operation is matched by exactly one completion packet
/// posted to the port under the object's key (or by a cancellation).
/// Dropping the handle releases the object; destruction is deferred until
/// the pump has swallowed any completions for cancelled operations.
pub struct Io {
    pub(crate) object: Arc<Object>,
}

impl Io {
    pub fn new<F>(env: Option<&Environment>, callback: F) -> PoolResult<Io>
    where
        F: Fn(&CallbackInstance, &IoCompletion) + Send + Sync + 'static,
    {
        let object = Object::allocate(
            Payload::Io {
                callback: Box::new(callback),
                key: Default::default(),
            },
            env,
        )?;
        tp_debug!("allocated I/O object");
        Ok(Io { object })
    }

    /// The key completion packets for this object must carry.
    pub fn key(&self) -> u64 {
        self.object.io_key().load(Ordering::SeqCst)
    }

    /// The port completions are posted to.
    pub fn port(&self) -> Arc<CompletionPort> {
        ioqueue()
            .inner
            .lock()
            .unwrap()
            .port
            .clone()
            .expect("port exists while I/O objects are attached")
    }

    /// Account one started asynchronous operation. Pair each call with a
    /// posted completion or with `cancel_async_io`.
    pub fn start_async_io(&self) {
        let mut st = self.object.state.lock().unwrap();
        st.io.pending_count += 1;
    }

    /// Balance a started operation whose kernel request was cancelled
    /// before producing a completion.
    pub fn cancel_async_io(&self) {
        let object = &self.object;
        let mut st = object.state.lock().unwrap();
        debug_assert!(st.io.pending_count > 0);
        st.io.pending_count -= 1;
        if st.is_finished(true) {
            object.group_finished.notify_all();
        }
        if st.is_finished(false) {
            object.finished.notify_all();
        }
    }

    /// Post a completion for one started operation (the kernel's side of
    /// the contract, useful for tests and user-space bridges).
    pub fn post_completion(&self, value: u64, status: i32, information: usize) -> io::Result<()> {
        self.port().post(self.key(), value, status, information)
    }

    /// Wait for outstanding callbacks and operations, optionally cancelling
    /// queued submissions and marking unfinished operations skipped.
    pub fn wait(&self, cancel_pending: bool) {
        if cancel_pending {
            self.object.cancel();
        }
        self.object.wait_finished(false);
    }
}

impl Drop for Io {
    fn drop(&mut self) {
        let can_destroy = {
            let mut st = self.object.state.lock().unwrap();
            st.io.shutting_down = true;
            st.io.pending_count == 0 && st.io.skipped_count == 0
        };
        if can_destroy {
            self.object.prepare_shutdown();
            self.object.shutdown.store(true, Ordering::SeqCst);
        }
        // Otherwise the pump destroys the object once the outstanding
        // completions have been swallowed.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
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
    fn test_completion_port_round_trip() {
        let port = CompletionPort::new().unwrap();
        port.post(7, 1, 0, 100).unwrap();
        port.post(7, 2, 0, 200).unwrap();

        let first = port.remove();
        let second = port.remove();
        assert_eq!(first.value, 1);
        assert_eq!(first.information, 100);
        assert_eq!(second.value, 2);
    }

    #[test]
    fn test_completions_dispatch_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s2 = seen.clone();
        let io = Io::new(None, move |_, completion| {
            s2.lock().unwrap().push(*completion);
        })
        .unwrap();

        io.start_async_io();
        io.start_async_io();
        io.post_completion(10, 0, 64).unwrap();
        io.post_completion(11, 0, 128).unwrap();

        io.wait(false);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|c| c.value == 10 && c.information == 64));
        assert!(seen.iter().any(|c| c.value == 11 && c.information == 128));
    }

    #[test]
    fn test_cancel_async_io_balances() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        let io = Io::new(None, move |_, _| {
            c2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // Four operations: two complete kernel-side, two are cancelled.
        for _ in 0..4 {
            io.start_async_io();
        }
        io.post_completion(1, 0, 0).unwrap();
        io.post_completion(2, 0, 0).unwrap();
        io.cancel_async_io();
        io.cancel_async_io();

        // Let the pump consume both kernel completions, then drain.
        assert!(wait_until(
            || calls.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        ));
        io.wait(true);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_skipped_completions_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c2 = calls.clone();
        let io = Io::new(None, move |_, _| {
            c2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        io.start_async_io();
        io.start_async_io();
        // Cancel queued work before the completions arrive: both pending
        // operations become skipped.
        io.wait(true);

        let key = io.key();
        let port = io.port();
        drop(io);

        // The object stays registered until both skipped completions have
        // been consumed by the pump, then it is destroyed silently.
        port.post(key, 1, 0, 0).unwrap();
        port.post(key, 2, 0, 0).unwrap();

        assert!(wait_until(
            || ioqueue().inner.lock().unwrap().registry.get(&key).is_none(),
            Duration::from_secs(5)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_completion_event_after_deferred_destroy() {
        let completed = Arc::new(crate::sync::Event::new().unwrap());
        let env = Environment::new().with_completion_event(completed.clone());
        let io = Io::new(Some(&env), |_, _| {}).unwrap();

        io.start_async_io();
        io.wait(true);
        let key = io.key();
        let port = io.port();
        drop(io);

        assert!(!completed.try_consume());
        port.post(key, 0, 0, 0).unwrap();
        assert!(completed.wait_ms(5000));
    }
}
