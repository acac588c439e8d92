//! Tuning constants shared across the runtime.

/// How long an idle worker, timer, wait, or I/O pump thread lingers before
/// retiring, in milliseconds.
pub const WORKER_TIMEOUT_MS: u64 = 5000;

/// Maximum number of wait registrations multiplexed onto one bucket thread.
/// One slot of the host multi-wait is reserved for the bucket's update event.
pub const MAX_WAITQUEUE_OBJECTS: usize = 63;

/// Default ceiling on worker threads for a freshly allocated pool.
pub const DEFAULT_MAX_WORKERS: usize = 500;

/// 100-nanosecond ticks per millisecond (the timestamp unit of the runtime).
pub const TICKS_PER_MS: u64 = 10_000;

/// Deadline sentinel for "never expires".
pub const NO_TIMEOUT: u64 = u64::MAX;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_unit() {
        // One second in ticks.
        assert_eq!(1000 * TICKS_PER_MS, 10_000_000);
    }

    #[test]
    fn test_bucket_capacity_reserves_update_slot() {
        // 64-way multi-wait minus the update event slot.
        assert_eq!(MAX_WAITQUEUE_OBJECTS, 64 - 1);
    }
}
