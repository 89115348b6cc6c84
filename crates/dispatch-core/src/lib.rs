//! # dispatch-core
//!
//! Core value types for the dispatch engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Threads, queues, timers and sources live in `dispatch-runtime`.
//!
//! ## Modules
//!
//! - `qos` - Quality-of-service classes and relative priority
//! - `time` - Monotonic/wall time values and saturating intervals
//! - `flags` - Work item execution flags
//! - `error` - Error types and the fatal usage-error helper
//! - `env` - Environment variable utilities

pub mod env;
pub mod error;
pub mod flags;
pub mod qos;
pub mod time;

// Re-exports for convenience
pub use env::{env_flag, env_millis, env_micros, env_opt, env_or};
pub use error::{usage_error, DispatchError, DispatchResult};
pub use flags::{QosOverride, WorkItemFlags};
pub use qos::{Qos, QosClass};
pub use time::{Deadline, DispatchTime, TimeInterval, WaitResult, WallTime};

/// Time unit constants
pub mod constants {
    /// Nanoseconds per second
    pub const NSEC_PER_SEC: u64 = 1_000_000_000;

    /// Nanoseconds per millisecond
    pub const NSEC_PER_MSEC: u64 = 1_000_000;

    /// Nanoseconds per microsecond
    pub const NSEC_PER_USEC: u64 = 1_000;
}
