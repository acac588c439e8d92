//! Callback environment: per-object configuration applied at allocation.

use std::any::Any;
use std::sync::Arc;

use taskpool_core::state::Priority;

use crate::group::{CleanupGroup, GroupShared};
use crate::instance::CallbackInstance;
use crate::object::{FinalizationCallback, GroupCancelCallback};
use crate::pool::{Pool, ThreadPool};
use crate::sync::Event;

/// Configuration block consumed by the object allocators.
///
/// An environment selects the owning pool (process default when absent),
/// optional cleanup-group membership with a group-cancel callback, a
/// finalization callback run after every invocation, the callback priority,
/// the long-function hint, a completion event signaled at destruction, and
/// an opaque keep-alive value held for the object's lifetime.
///
/// ```ignore
/// let env = Environment::new()
///     .with_pool(&pool)
///     .with_priority(Priority::High)
///     .long_function();
/// let work = Work::new(Some(&env), |_| heavy_lifting())?;
/// ```
#[derive(Clone, Default)]
pub struct Environment {
    pub(crate) pool: Option<Arc<ThreadPool>>,
    pub(crate) cleanup_group: Option<Arc<GroupShared>>,
    pub(crate) group_cancel: Option<GroupCancelCallback>,
    pub(crate) finalization: Option<FinalizationCallback>,
    pub(crate) long_function: bool,
    pub(crate) persistent: bool,
    pub(crate) priority: Priority,
    pub(crate) completion_event: Option<Arc<Event>>,
    pub(crate) keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    /// Allocate objects against `pool` instead of the process default.
    pub fn with_pool(mut self, pool: &Pool) -> Environment {
        self.pool = Some(pool.inner.clone());
        self
    }

    /// Insert allocated objects into `group`.
    pub fn with_cleanup_group(mut self, group: &CleanupGroup) -> Environment {
        self.cleanup_group = Some(group.shared.clone());
        self
    }

    /// Callback invoked by a cancelling `release_members` run; receives the
    /// datum passed to `release_members`.
    pub fn with_group_cancel<F>(mut self, callback: F) -> Environment
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.group_cancel = Some(Arc::new(callback));
        self
    }

    /// Callback run after the main callback of every invocation.
    pub fn with_finalization<F>(mut self, callback: F) -> Environment
    where
        F: Fn(&CallbackInstance) + Send + Sync + 'static,
    {
        self.finalization = Some(Arc::new(callback));
        self
    }

    /// Hint that callbacks may block for a long time.
    pub fn long_function(mut self) -> Environment {
        self.long_function = true;
        self
    }

    /// Request a persistent worker thread. Accepted but unsupported.
    pub fn persistent(mut self) -> Environment {
        self.persistent = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Environment {
        self.priority = priority;
        self
    }

    /// Event signaled once when an allocated object is destroyed.
    pub fn with_completion_event(mut self, event: Arc<Event>) -> Environment {
        self.completion_event = Some(event);
        self
    }

    /// Opaque value kept alive until the allocated object is destroyed.
    pub fn with_keepalive(mut self, value: Arc<dyn Any + Send + Sync>) -> Environment {
        self.keepalive = Some(value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let env = Environment::new();
        assert!(env.pool.is_none());
        assert!(env.cleanup_group.is_none());
        assert!(!env.long_function);
        assert_eq!(env.priority, Priority::Normal);
    }

    #[test]
    fn test_builder_chains() {
        let pool = Pool::new();
        let env = Environment::new()
            .with_pool(&pool)
            .with_priority(Priority::Low)
            .long_function();
        assert!(env.pool.is_some());
        assert!(env.long_function);
        assert_eq!(env.priority, Priority::Low);
    }

    #[test]
    fn test_keepalive_dropped_with_object() {
        use crate::object::Work;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let env =
            Environment::new().with_keepalive(Arc::new(Probe(drops.clone())));
        let work = Work::new(Some(&env), |_| {}).unwrap();
        work.post();
        work.wait(false);

        drop(env);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(work);
        // The worker may hold its queue reference a moment longer.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while drops.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
