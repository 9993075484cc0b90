//! Error types for the fibra scheduler
//!
//! These cover the scheduler/runtime API surface only. The syscall
//! interception layer never returns these: it reports failures the way
//! the wrapped POSIX calls do, as a negative return with errno set.

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler has not been started yet
    NotStarted,

    /// Scheduler was already started
    AlreadyStarted,

    /// A task was targeted at a worker id that does not exist
    UnknownWorker(usize),

    /// The readiness multiplexer rejected a registration
    RegistrationFailed,

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Underlying OS call failed (raw errno)
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::UnknownWorker(id) => write!(f, "no such worker: {}", id),
            SchedError::RegistrationFailed => write!(f, "event registration failed"),
            SchedError::InvalidConfig(what) => write!(f, "invalid config: {}", what),
            SchedError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}
