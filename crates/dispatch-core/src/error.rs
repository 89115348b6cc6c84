//! Error types for the dispatch engine
//!
//! Three kinds of failure exist:
//!
//! - **Usage errors** (unbalanced suspend/resume or enter/leave, sync
//!   deadlock, target cycles) are programming defects. They are never
//!   returned; [`usage_error`] logs and panics.
//! - **Environmental errors** (bad descriptor, uncatchable signal, thread
//!   creation failure) are values of [`DispatchError`]. Sources hand them to
//!   their registration handler; the pool absorbs spawn failures.
//! - **Timeouts** are not errors at all: waits return
//!   [`WaitResult::TimedOut`](crate::time::WaitResult).

use thiserror::Error;

/// Result type for fallible runtime operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Environmental and setup errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The process-wide runtime was already constructed
    #[error("dispatch runtime already initialized")]
    AlreadyInitialized,

    /// A configuration value failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The OS refused to create a thread
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// A descriptor source was created for a closed or invalid descriptor
    #[error("invalid file descriptor {0}")]
    InvalidDescriptor(i32),

    /// A signal source names a signal that cannot be caught
    #[error("signal {0} cannot be observed")]
    InvalidSignal(i32),

    /// A system call failed
    #[error("{op} failed with errno {errno}")]
    Os {
        /// Name of the failing call
        op: &'static str,
        /// Raw errno value
        errno: i32,
    },
}

impl DispatchError {
    /// Raw OS error code, if this error carries one
    pub fn errno(&self) -> Option<i32> {
        match self {
            DispatchError::Os { errno, .. } => Some(*errno),
            DispatchError::InvalidDescriptor(_) => Some(9), // EBADF
            DispatchError::InvalidSignal(_) => Some(22),    // EINVAL
            _ => None,
        }
    }
}

/// Report a fatal API misuse
///
/// Logs at error level and panics. Misuse indicates a defect in the calling
/// code, so there is no recoverable path.
#[cold]
#[track_caller]
pub fn usage_error(msg: &str) -> ! {
    tracing::error!(target: "dispatch", "usage error: {}", msg);
    panic!("dispatch usage error: {}", msg);
}
