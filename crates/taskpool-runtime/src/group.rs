//! Cleanup groups: bulk release of callback objects.
//!
//! A group tracks its members weakly; each member holds a strong reference
//! to the group. `release_members` is the one place in the runtime where a
//! synchronous drain across pools and object kinds is guaranteed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use taskpool_core::{tp_debug, tp_trace};

use crate::object::Object;

pub(crate) struct GroupShared {
    pub(crate) shutdown: AtomicBool,
    pub(crate) members: Mutex<Vec<Weak<Object>>>,
}

/// A set of callback objects released together.
pub struct CleanupGroup {
    pub(crate) shared: Arc<GroupShared>,
}

impl CleanupGroup {
    pub fn new() -> CleanupGroup {
        tp_debug!("allocated cleanup group");
        CleanupGroup {
            shared: Arc::new(GroupShared {
                shutdown: AtomicBool::new(false),
                members: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Release every member of the group.
    ///
    /// Queued submissions are cancelled when `cancel_pending` is set, then
    /// each member is drained synchronously: this returns only after no
    /// member has pending or running callbacks left. For members that were
    /// not already shut down, a cancel run also invokes their group-cancel
    /// callback with `userdata`. Afterwards every member is marked shut
    /// down; the objects are destroyed as their owning handles go away.
    pub fn release_members(&self, cancel_pending: bool, userdata: usize) {
        tp_debug!("releasing cleanup group members (cancel={})", cancel_pending);

        // Detach members under the group lock. A failed upgrade means the
        // object is already being destroyed and can be skipped.
        let members: Vec<Arc<Object>> = {
            let mut list = self.shared.members.lock().unwrap();
            list.drain(..)
                .filter_map(|weak| weak.upgrade())
                .inspect(|object| {
                    object.is_group_member.store(false, Ordering::SeqCst);
                })
                .collect()
        };

        for object in &members {
            object.prepare_shutdown();
        }

        if cancel_pending {
            for object in &members {
                object.cancel();
            }
        }

        for object in members {
            object.wait_finished(true);

            if !object.is_shutdown() {
                if cancel_pending {
                    if let Some(callback) = &object.group_cancel {
                        tp_trace!("executing group cancel callback");
                        callback(userdata);
                    }
                }
            }

            object.shutdown.store(true, Ordering::SeqCst);
        }
    }
}

impl Default for CleanupGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupGroup {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        tp_debug!("released cleanup group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::object::{try_post_simple, Work};
    use crate::sync::Event;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_release_members_waits_for_running() {
        let group = CleanupGroup::new();
        let env = Environment::new().with_cleanup_group(&group);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let work = Work::new(Some(&env), move |_| {
            std::thread::sleep(Duration::from_millis(50));
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        work.post();
        work.post();

        group.release_members(false, 0);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(work.object.is_shutdown());
    }

    #[test]
    fn test_release_members_cancel_invokes_group_callback() {
        let group = CleanupGroup::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut works = Vec::new();
        for _ in 0..3 {
            let s2 = seen.clone();
            let env = Environment::new()
                .with_cleanup_group(&group)
                .with_group_cancel(move |userdata| {
                    s2.lock().unwrap().push(userdata);
                });
            let work = Work::new(Some(&env), move |_| {
                std::thread::sleep(Duration::from_millis(30));
            })
            .unwrap();
            work.post();
            works.push(work);
        }

        group.release_members(true, 42);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|&u| u == 42));
    }

    #[test]
    fn test_simple_member_already_shut_down_is_skipped() {
        let group = CleanupGroup::new();
        let done = Arc::new(Event::new().unwrap());
        let cancelled = Arc::new(AtomicUsize::new(0));

        let c2 = cancelled.clone();
        let env = Environment::new()
            .with_cleanup_group(&group)
            .with_group_cancel(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        let done2 = done.clone();
        try_post_simple(Some(&env), move |_| {
            done2.set().unwrap();
        })
        .unwrap();

        assert!(done.wait_ms(5000));
        // The simple callback shut itself down after running, so a cancel
        // release must not invoke its group-cancel callback.
        group.release_members(true, 7);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
