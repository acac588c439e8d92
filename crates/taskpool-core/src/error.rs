//! Error types for the taskpool runtime

use core::fmt;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur in pool operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every worker is busy and the pool is already at its thread ceiling
    TooManyThreads,

    /// A caller-supplied argument was rejected
    InvalidParameter,

    /// An instance operation was invoked from a thread other than the one
    /// running the callback
    WrongThread,

    /// Failed to spawn a worker or service thread
    SpawnFailed,

    /// Operating system error (raw errno)
    Os(i32),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::TooManyThreads => write!(f, "too many threads"),
            PoolError::InvalidParameter => write!(f, "invalid parameter"),
            PoolError::WrongThread => write!(f, "called from wrong thread"),
            PoolError::SpawnFailed => write!(f, "failed to spawn thread"),
            PoolError::Os(code) => write!(f, "os error: {}", code),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Os(e.raw_os_error().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", PoolError::TooManyThreads), "too many threads");
        assert_eq!(format!("{}", PoolError::Os(12)), "os error: 12");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(2);
        let err: PoolError = io.into();
        assert_eq!(err, PoolError::Os(2));
    }
}
