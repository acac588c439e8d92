//! Core types and constants for the taskpool runtime.
//!
//! This crate is platform agnostic: callback priorities, wait results, the
//! shared error enum, tuning constants, and the leveled logging macros used
//! by every other crate in the workspace live here.

pub mod constants;
pub mod env;
pub mod error;
pub mod log;
pub mod state;

pub use env::{env_get_bool, env_get_u32};
pub use error::{PoolError, PoolResult};
pub use log::LogLevel;
pub use state::{Priority, WaitResult};
