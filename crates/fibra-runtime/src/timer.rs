//! Per-worker timer heap
//!
//! Min-heap by deadline with lazy cancellation: cancelled handles go
//! into a HashSet and are skipped when expired entries are drained,
//! which keeps cancel O(1) instead of O(n) heap surgery. A second set
//! tracks the handles still pending in the heap, so cancelling a timer
//! that already fired (or was already cancelled) is a no-op instead of
//! a leaked tombstone.
//!
//! # Conditional timers
//!
//! A conditional timer holds a `Weak<IoToken>` shared with a suspended
//! I/O operation. When it expires, the callback runs only if the token
//! is still alive and this timer wins the claim race against the
//! readiness path. Either way the loser becomes a no-op, so an I/O wait
//! is resumed exactly once.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use fibra_core::token::IoToken;

/// Identifies one registered timer; unique across all heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type TimerFn = Box<dyn FnOnce()>;

enum TimerKind {
    /// Always fires unless cancelled
    Plain,
    /// Fires only if the token is alive and unclaimed at expiry
    Conditional(Weak<IoToken>),
}

struct TimerEntry {
    deadline: Instant,
    handle: TimerHandle,
    kind: TimerKind,
    callback: TimerFn,
}

/// Wrapper for heap ordering (min-heap by deadline)
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.handle == other.0.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap, tie-break by handle so equal
        // deadlines drain in registration order
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.handle.cmp(&self.0.handle),
            ord => ord,
        }
    }
}

/// Single-threaded timer heap; each worker owns one
pub struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    /// Handles still pending in the heap, neither fired nor cancelled
    live: HashSet<TimerHandle>,
    cancelled: HashSet<TimerHandle>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
        }
    }

    /// Register a callback to run after `delay`
    pub fn add_timer<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.push(delay, TimerKind::Plain, Box::new(callback))
    }

    /// Register a callback guarded by an I/O token
    ///
    /// At expiry the callback runs only after winning the token claim
    /// with ETIMEDOUT; if the readiness path claimed first, or the
    /// owning operation already finished and dropped its token, the
    /// entry is discarded.
    pub fn add_conditional<F>(
        &mut self,
        delay: Duration,
        token: Weak<IoToken>,
        callback: F,
    ) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.push(delay, TimerKind::Conditional(token), Box::new(callback))
    }

    fn push(&mut self, delay: Duration, kind: TimerKind, callback: TimerFn) -> TimerHandle {
        let handle = TimerHandle::next();
        self.live.insert(handle);
        self.heap.push(HeapEntry(TimerEntry {
            deadline: Instant::now() + delay,
            handle,
            kind,
            callback,
        }));
        handle
    }

    /// Lazily cancel a timer. Returns false (and records nothing) when
    /// the handle already fired or was already cancelled, so callers
    /// may cancel unconditionally on every resume path.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if !self.live.remove(&handle) {
            return false;
        }
        self.cancelled.insert(handle);
        true
    }

    /// Earliest pending deadline, including not-yet-skipped cancelled
    /// entries (a spurious early wakeup is harmless)
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.0.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Pop every entry due at `now` and return the callbacks to run
    ///
    /// Callbacks are returned rather than invoked so the caller can
    /// release any borrow of the heap first; callbacks may re-arm
    /// timers on the same heap.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerFn> {
        let mut ready = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.0.deadline > now {
                break;
            }
            let entry = match self.heap.pop() {
                Some(e) => e.0,
                None => break,
            };
            if self.cancelled.remove(&entry.handle) {
                continue;
            }
            self.live.remove(&entry.handle);
            match entry.kind {
                TimerKind::Plain => ready.push(entry.callback),
                TimerKind::Conditional(token) => {
                    // The claim decides the race against the readiness
                    // path; losing or finding the owner gone means the
                    // I/O already completed
                    if let Some(token) = token.upgrade() {
                        if token.try_claim(libc::ETIMEDOUT) {
                            ready.push(entry.callback);
                        }
                    }
                }
            }
        }
        ready
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn fired(heap: &mut TimerHeap, now: Instant) -> usize {
        let cbs = heap.take_expired(now);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (label, ms) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let o = Rc::clone(&order);
            heap.add_timer(Duration::from_millis(ms), move || {
                o.borrow_mut().push(label)
            });
        }
        fired(&mut heap, Instant::now() + Duration::from_millis(50));
        assert_eq!(*order.borrow(), ["a", "b", "c"]);
    }

    #[test]
    fn equal_deadlines_fire_in_registration_order() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in [1, 2, 3] {
            let o = Rc::clone(&order);
            heap.add_timer(Duration::ZERO, move || o.borrow_mut().push(label));
        }
        fired(&mut heap, now + Duration::from_millis(1));
        assert_eq!(*order.borrow(), [1, 2, 3]);
    }

    #[test]
    fn cancelled_timers_are_skipped() {
        let mut heap = TimerHeap::new();
        let hit = Rc::new(RefCell::new(false));
        let h = Rc::clone(&hit);
        let handle = heap.add_timer(Duration::ZERO, move || *h.borrow_mut() = true);
        assert!(heap.cancel(handle));
        assert!(!heap.cancel(handle));
        assert_eq!(fired(&mut heap, Instant::now() + Duration::from_secs(1)), 0);
        assert!(!*hit.borrow());
    }

    #[test]
    fn cancel_after_fire_retains_no_tombstones() {
        let mut heap = TimerHeap::new();
        // A pending timer keeps the heap occupied throughout
        heap.add_timer(Duration::from_secs(60), || {});
        for _ in 0..1000 {
            let handle = heap.add_timer(Duration::ZERO, || {});
            assert_eq!(
                fired(&mut heap, Instant::now() + Duration::from_millis(1)),
                1
            );
            assert!(!heap.cancel(handle));
        }
        assert!(heap.cancelled.is_empty());
        assert!(!heap.is_empty());
    }

    #[test]
    fn cancelling_the_last_timer_empties_the_heap_view() {
        let mut heap = TimerHeap::new();
        let handle = heap.add_timer(Duration::from_secs(60), || {});
        assert!(!heap.is_empty());
        assert!(heap.cancel(handle));
        assert!(heap.is_empty());
    }

    #[test]
    fn unexpired_timers_stay_queued() {
        let mut heap = TimerHeap::new();
        heap.add_timer(Duration::from_secs(60), || {});
        assert_eq!(fired(&mut heap, Instant::now()), 0);
        assert!(!heap.is_empty());
        assert!(heap.next_deadline().is_some());
    }

    #[test]
    fn conditional_timer_skipped_when_token_dropped() {
        let mut heap = TimerHeap::new();
        let token = Arc::new(IoToken::new());
        heap.add_conditional(Duration::ZERO, Arc::downgrade(&token), || {
            panic!("must not fire")
        });
        drop(token);
        assert_eq!(fired(&mut heap, Instant::now() + Duration::from_secs(1)), 0);
    }

    #[test]
    fn conditional_timer_skipped_when_already_claimed() {
        let mut heap = TimerHeap::new();
        let token = Arc::new(IoToken::new());
        assert!(token.try_claim(libc::ECANCELED));
        heap.add_conditional(Duration::ZERO, Arc::downgrade(&token), || {
            panic!("must not fire")
        });
        assert_eq!(fired(&mut heap, Instant::now() + Duration::from_secs(1)), 0);
        assert_eq!(token.claimed(), Some(libc::ECANCELED));
    }

    #[test]
    fn conditional_timer_claims_with_etimedout() {
        let mut heap = TimerHeap::new();
        let token = Arc::new(IoToken::new());
        let hit = Rc::new(RefCell::new(false));
        let h = Rc::clone(&hit);
        heap.add_conditional(Duration::ZERO, Arc::downgrade(&token), move || {
            *h.borrow_mut() = true
        });
        assert_eq!(fired(&mut heap, Instant::now() + Duration::from_secs(1)), 1);
        assert!(*hit.borrow());
        assert_eq!(token.claimed(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn cancelled_set_clears_when_heap_drains() {
        let mut heap = TimerHeap::new();
        for _ in 0..8 {
            let handle = heap.add_timer(Duration::ZERO, || {});
            heap.cancel(handle);
        }
        fired(&mut heap, Instant::now() + Duration::from_secs(1));
        assert!(heap.is_empty());
        assert!(heap.cancelled.is_empty());
    }
}
