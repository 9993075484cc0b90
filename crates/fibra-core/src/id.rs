//! Coroutine identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a coroutine
///
/// Allocated monotonically for the lifetime of the process; never reused,
/// so a stale id can always be told apart from a live one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// Allocate the next unused id
    #[inline]
    pub fn next() -> Self {
        CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co-{}", self.0)
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoroutineId({})", self.0)
    }
}
