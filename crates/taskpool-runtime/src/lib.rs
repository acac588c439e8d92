//! Schedulers and object lifecycle for the taskpool runtime.
//!
//! Five cooperating schedulers multiplex callback objects onto worker
//! threads:
//!
//! - worker pools with three priority queues and dynamic worker lifecycle
//!   ([`pool`]),
//! - the object lifecycle layer with reference counting, cancellation, and
//!   completion signalling ([`object`]),
//! - a timer service over a globally sorted expiry list ([`timer`]),
//! - a wait service multiplexing fd waits onto bucket threads ([`wait`]),
//! - a completion-port pump feeding I/O callbacks ([`io`]).
//!
//! All service threads are lazily created and retire after five idle
//! seconds once their object counts drain, so a process that releases every
//! object quiesces without an explicit teardown call.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        // eventfd + poll are the host wait primitives.
    } else {
        compile_error!("taskpool requires a Unix host");
    }
}

pub mod environment;
pub mod group;
pub mod instance;
pub mod io;
pub mod object;
pub mod pool;
pub mod sync;
pub mod time;
pub mod timer;
pub mod wait;

pub use environment::Environment;
pub use group::CleanupGroup;
pub use instance::CallbackInstance;
pub use io::{CompletionPacket, CompletionPort, Io, IoCompletion};
pub use object::{try_post_simple, Work};
pub use pool::{Pool, StackInfo};
pub use sync::{CriticalSection, Event, Semaphore};
pub use timer::Timer;
pub use wait::{Wait, WaitFlags};
