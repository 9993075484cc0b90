//! I/O cancellation token
//!
//! Shared between a blocking-style I/O call and the conditional timer it
//! arms. The call owns the token through an `Arc`; the timer observes it
//! through a `Weak`. Whichever side claims first is authoritative: the
//! timer claims with an errno (ETIMEDOUT) before force-firing the waited
//! event, and the resumed call reads the claim to decide between "timed
//! out" and "readiness arrived, retry".
//!
//! When the owning call returns, its `Arc` drops and any still-armed
//! timer fails the `Weak` upgrade, making a stale fire a no-op.

use core::sync::atomic::{AtomicI32, Ordering};

/// Claimable outcome cell for one blocking I/O operation
///
/// State 0 means unclaimed; any other value is the errno the claiming
/// side decided on. Timers fire on the same worker thread that owns the
/// suspended coroutine, so this is reentrancy protection more than
/// cross-thread synchronization - but the cell is shared via `Arc`, so
/// it is atomic regardless.
#[derive(Debug)]
pub struct IoToken {
    state: AtomicI32,
}

impl IoToken {
    /// Create an unclaimed token
    pub fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    /// Atomically claim the outcome with the given errno
    ///
    /// Returns true if this call performed the claim, false if some
    /// other side already did. `errno` must be nonzero.
    #[inline]
    pub fn try_claim(&self, errno: i32) -> bool {
        debug_assert!(errno != 0);
        self.state
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Read the claimed errno, if any side has claimed
    #[inline]
    pub fn claimed(&self) -> Option<i32> {
        match self.state.load(Ordering::Acquire) {
            0 => None,
            e => Some(e),
        }
    }
}

impl Default for IoToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claim_once() {
        let token = IoToken::new();
        assert_eq!(token.claimed(), None);

        assert!(token.try_claim(110)); // ETIMEDOUT
        assert_eq!(token.claimed(), Some(110));

        // Second claim loses, first outcome sticks
        assert!(!token.try_claim(9));
        assert_eq!(token.claimed(), Some(110));
    }

    #[test]
    fn test_weak_observer_sees_owner_gone() {
        let owner = Arc::new(IoToken::new());
        let observer = Arc::downgrade(&owner);

        assert!(observer.upgrade().is_some());
        drop(owner);
        assert!(observer.upgrade().is_none());
    }

    #[test]
    fn test_racing_claims_pick_one_winner() {
        let token = Arc::new(IoToken::new());
        let t1 = token.clone();
        let t2 = token.clone();

        let h1 = std::thread::spawn(move || t1.try_claim(110));
        let h2 = std::thread::spawn(move || t2.try_claim(9));
        let won1 = h1.join().unwrap();
        let won2 = h2.join().unwrap();

        assert!(won1 ^ won2);
        let outcome = token.claimed().unwrap();
        assert!(outcome == 110 || outcome == 9);
    }
}
