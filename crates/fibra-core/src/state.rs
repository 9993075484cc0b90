//! Coroutine state type

use core::fmt;

/// State of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoState {
    /// Runnable, sitting in (or headed for) a ready queue
    Ready = 0,

    /// Currently executing on a worker thread
    Running = 1,

    /// Parked waiting for a readiness event or a timer
    Suspended = 2,

    /// Entry function returned; the stack will not run again
    Terminated = 3,
}

impl CoState {
    /// Check if this state allows the coroutine to be resumed by the
    /// worker loop
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, CoState::Ready)
    }

    /// Check if the coroutine has finished execution
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, CoState::Terminated)
    }
}

impl From<u8> for CoState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoState::Ready,
            1 => CoState::Running,
            2 => CoState::Suspended,
            _ => CoState::Terminated,
        }
    }
}

impl From<CoState> for u8 {
    fn from(state: CoState) -> u8 {
        state as u8
    }
}

impl fmt::Display for CoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoState::Ready => write!(f, "READY"),
            CoState::Running => write!(f, "RUNNING"),
            CoState::Suspended => write!(f, "SUSPENDED"),
            CoState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CoState::Ready.is_runnable());
        assert!(!CoState::Running.is_runnable());
        assert!(!CoState::Suspended.is_runnable());

        assert!(CoState::Terminated.is_terminated());
        assert!(!CoState::Running.is_terminated());
    }

    #[test]
    fn test_state_roundtrip() {
        for s in [
            CoState::Ready,
            CoState::Running,
            CoState::Suspended,
            CoState::Terminated,
        ] {
            assert_eq!(CoState::from(u8::from(s)), s);
        }
    }
}
