//! Host synchronization primitives.
//!
//! The wait service multi-waits with `poll(2)`, so everything waitable is a
//! file descriptor. `Event` and `Semaphore` wrap counting-mode eventfds:
//! each signal adds one token, each satisfied wait consumes exactly one, so
//! N signals produce N wait satisfactions even across racing consumers.
//!
//! `CriticalSection` is an in-process lock with explicit `enter`/`leave`,
//! usable from callback-completion cleanups where a scoped guard cannot be
//! carried across the callback boundary.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Condvar, Mutex};
use std::thread::ThreadId;

fn eventfd_counting() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::eventfd(
            0,
            libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// A plain (non-counting) eventfd: reads observe and clear the whole
/// counter, so multiple signals before a read coalesce into one wake-up.
pub(crate) fn eventfd_plain() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn eventfd_add(fd: RawFd, count: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd,
            &count as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // EAGAIN means the counter would overflow; a wake-up is already
        // pending, so the signal is not lost.
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// Consume one token from a counting eventfd. Returns false when no token
/// was available.
pub(crate) fn eventfd_take(fd: RawFd) -> bool {
    let mut value: u64 = 0;
    let ret = unsafe {
        libc::read(
            fd,
            &mut value as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    ret == std::mem::size_of::<u64>() as isize
}

/// Block until `fd` is readable or `timeout_ms` elapses (-1 = infinite).
/// Returns true when readable.
pub(crate) fn poll_readable(fd: RawFd, timeout_ms: libc::c_int) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret > 0 {
            return pfd.revents & libc::POLLIN != 0;
        }
        if ret == 0 {
            return false;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return false;
        }
    }
}

/// A waitable signal-counting event.
///
/// Each `set` adds one signal token; a satisfied wait (or `try_consume`)
/// removes one. The raw fd is the handle registered with the wait service.
#[derive(Debug)]
pub struct Event {
    fd: RawFd,
}

impl Event {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: eventfd_counting()?,
        })
    }

    /// Signal the event once.
    pub fn set(&self) -> io::Result<()> {
        eventfd_add(self.fd, 1)
    }

    /// Consume one pending signal without waiting. Returns whether a signal
    /// was pending.
    pub fn try_consume(&self) -> bool {
        eventfd_take(self.fd)
    }

    /// Drain all pending signals.
    pub fn reset(&self) {
        while eventfd_take(self.fd) {}
    }

    /// Block until the event is signaled, consuming one signal.
    pub fn wait(&self) {
        loop {
            if eventfd_take(self.fd) {
                return;
            }
            poll_readable(self.fd, -1);
        }
    }

    /// Block until the event is signaled or the timeout elapses. Returns
    /// whether a signal was consumed.
    pub fn wait_ms(&self, timeout_ms: u32) -> bool {
        if eventfd_take(self.fd) {
            return true;
        }
        if !poll_readable(self.fd, timeout_ms.min(libc::c_int::MAX as u32) as libc::c_int) {
            return false;
        }
        eventfd_take(self.fd)
    }

    /// The pollable handle for this event.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

// Safety: the wrapped fd is used only through atomic read/write syscalls.
unsafe impl Send for Event {}
unsafe impl Sync for Event {}

/// A counting semaphore backed by the same eventfd mechanism as [`Event`].
#[derive(Debug)]
pub struct Semaphore {
    fd: RawFd,
}

impl Semaphore {
    pub fn new(initial: u32) -> io::Result<Self> {
        let fd = eventfd_counting()?;
        if initial > 0 {
            eventfd_add(fd, initial as u64)?;
        }
        Ok(Self { fd })
    }

    /// Add `count` permits.
    pub fn release(&self, count: u32) -> io::Result<()> {
        if count == 0 {
            return Ok(());
        }
        eventfd_add(self.fd, count as u64)
    }

    /// Take one permit, blocking until available.
    pub fn acquire(&self) {
        loop {
            if eventfd_take(self.fd) {
                return;
            }
            poll_readable(self.fd, -1);
        }
    }

    /// Take one permit if immediately available.
    pub fn try_acquire(&self) -> bool {
        eventfd_take(self.fd)
    }

    /// The pollable handle for this semaphore.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

#[derive(Default)]
struct CsState {
    owner: Option<ThreadId>,
    recursion: u32,
}

/// A recursive lock with explicit enter/leave.
///
/// Unlike `std::sync::Mutex`, ownership is not tied to a guard value, so a
/// callback can enter the lock and schedule the matching `leave` as a
/// completion cleanup on its instance.
#[derive(Default)]
pub struct CriticalSection {
    state: Mutex<CsState>,
    available: Condvar,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, blocking until available. Re-entry from the owning
    /// thread increments a recursion count.
    pub fn enter(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner == Some(me) {
            state.recursion += 1;
            return;
        }
        while state.owner.is_some() {
            state = self.available.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.recursion = 1;
    }

    /// Try to acquire the lock without blocking.
    pub fn try_enter(&self) -> bool {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner == Some(me) {
            state.recursion += 1;
            return true;
        }
        if state.owner.is_some() {
            return false;
        }
        state.owner = Some(me);
        state.recursion = 1;
        true
    }

    /// Release one level of the lock. Must be called on the owning thread.
    pub fn leave(&self) {
        let me = std::thread::current().id();
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.owner, Some(me), "leave() from non-owner thread");
        if state.owner != Some(me) {
            return;
        }
        state.recursion -= 1;
        if state.recursion == 0 {
            state.owner = None;
            drop(state);
            self.available.notify_one();
        }
    }

    /// Whether the calling thread currently owns the lock.
    pub fn is_owned(&self) -> bool {
        let me = std::thread::current().id();
        self.state.lock().unwrap().owner == Some(me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_event_set_and_consume() {
        let event = Event::new().unwrap();
        assert!(!event.try_consume());

        event.set().unwrap();
        event.set().unwrap();
        assert!(event.try_consume());
        assert!(event.try_consume());
        assert!(!event.try_consume());
    }

    #[test]
    fn test_event_reset() {
        let event = Event::new().unwrap();
        for _ in 0..5 {
            event.set().unwrap();
        }
        event.reset();
        assert!(!event.try_consume());
    }

    #[test]
    fn test_event_wait_ms() {
        let event = Arc::new(Event::new().unwrap());
        assert!(!event.wait_ms(20));

        let e2 = event.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            e2.set().unwrap();
        });
        assert!(event.wait_ms(2000));
        t.join().unwrap();
    }

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new(2).unwrap();
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());

        sem.release(3).unwrap();
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_semaphore_blocking_acquire() {
        let sem = Arc::new(Semaphore::new(0).unwrap());
        let s2 = sem.clone();
        let t = std::thread::spawn(move || {
            s2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        sem.release(1).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_critical_section_recursion() {
        let cs = CriticalSection::new();
        cs.enter();
        cs.enter();
        assert!(cs.is_owned());
        cs.leave();
        assert!(cs.is_owned());
        cs.leave();
        assert!(!cs.is_owned());
    }

    #[test]
    fn test_critical_section_exclusion() {
        let cs = Arc::new(CriticalSection::new());
        cs.enter();

        let (tx, rx) = std::sync::mpsc::channel();
        let cs2 = cs.clone();
        let t = std::thread::spawn(move || {
            tx.send(cs2.try_enter()).unwrap();
            cs2.enter();
            cs2.leave();
        });

        assert!(!rx.recv().unwrap());
        cs.leave();
        t.join().unwrap();
    }
}
