//! Wall-clock timestamps in 100-nanosecond ticks.
//!
//! Timer and wait deadlines are absolute tick counts since the Unix epoch.
//! Caller-facing APIs accept signed tick values where a negative value means
//! "relative to now".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use taskpool_core::constants::{NO_TIMEOUT, TICKS_PER_MS};

/// Current wall-clock time in 100-ns ticks since the Unix epoch.
#[inline]
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_nanos() / 100) as u64)
        .unwrap_or(0)
}

/// Convert a signed caller timestamp to an absolute deadline.
///
/// Negative values are relative 100-ns intervals, non-negative values are
/// absolute ticks.
#[inline]
pub fn absolute_deadline(timestamp: i64) -> u64 {
    if timestamp < 0 {
        now_ticks().saturating_add(timestamp.unsigned_abs())
    } else {
        timestamp as u64
    }
}

/// A relative timeout of `ms` milliseconds, in caller timestamp form.
#[inline]
pub fn rel_ms(ms: u64) -> i64 {
    -((ms * TICKS_PER_MS) as i64)
}

/// Time remaining until an absolute deadline, saturating at zero.
/// `NO_TIMEOUT` maps to `None` (wait forever).
#[inline]
pub fn until_deadline(deadline: u64) -> Option<Duration> {
    if deadline == NO_TIMEOUT {
        return None;
    }
    let now = now_ticks();
    let ticks = deadline.saturating_sub(now);
    Some(Duration::from_nanos(ticks.saturating_mul(100)))
}

/// Milliseconds until an absolute deadline for `poll(2)`, -1 for infinite.
#[inline]
pub fn poll_timeout_ms(deadline: u64) -> libc::c_int {
    if deadline == NO_TIMEOUT {
        return -1;
    }
    let now = now_ticks();
    let ms = deadline.saturating_sub(now) / TICKS_PER_MS;
    ms.min(libc::c_int::MAX as u64) as libc::c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_advances() {
        let t1 = now_ticks();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = now_ticks();
        assert!(t2 > t1);
    }

    #[test]
    fn test_relative_deadline() {
        let before = now_ticks();
        let deadline = absolute_deadline(rel_ms(100));
        assert!(deadline >= before + 100 * TICKS_PER_MS);
        assert!(deadline < before + 10_000 * TICKS_PER_MS);
    }

    #[test]
    fn test_absolute_passthrough() {
        assert_eq!(absolute_deadline(12345), 12345);
    }

    #[test]
    fn test_until_deadline() {
        assert_eq!(until_deadline(NO_TIMEOUT), None);
        assert_eq!(until_deadline(0), Some(Duration::ZERO));
        let d = until_deadline(now_ticks() + 1000 * TICKS_PER_MS).unwrap();
        assert!(d <= Duration::from_secs(1));
        assert!(d > Duration::from_millis(500));
    }

    #[test]
    fn test_poll_timeout() {
        assert_eq!(poll_timeout_ms(NO_TIMEOUT), -1);
        assert_eq!(poll_timeout_ms(0), 0);
        let t = poll_timeout_ms(now_ticks() + 200 * TICKS_PER_MS);
        assert!((100..=200).contains(&t));
    }
}
