//! Stackful coroutines
//!
//! A coroutine owns a guard-paged stack and a saved register set. Each
//! OS thread keeps one scheduling context; `resume` switches from it
//! into a coroutine and the yield functions switch back. Coroutines are
//! `Rc`-held and never move between threads once first resumed.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use fibra_core::error::SchedResult;
use fibra_core::id::CoroutineId;
use fibra_core::state::CoState;
use fibra_core::rt_error;

use crate::arch::{context_switch, init_context, SavedRegs};
use crate::stack::CoStack;

thread_local! {
    /// The scheduling context of this thread: where yields return to
    static SCHED_CTX: UnsafeCell<SavedRegs> = const { UnsafeCell::new(SavedRegs::zeroed()) };

    /// Coroutine currently running on this thread, if any
    static CURRENT: RefCell<Option<Rc<Coroutine>>> = const { RefCell::new(None) };
}

type CoFn = Box<dyn FnOnce()>;

/// A stackful coroutine pinned to the thread that first resumes it
pub struct Coroutine {
    id: CoroutineId,
    state: Cell<CoState>,
    regs: UnsafeCell<SavedRegs>,
    stack: CoStack,
    func: RefCell<Option<CoFn>>,
}

impl Coroutine {
    /// Create a coroutine in the `Ready` state with its own stack
    pub fn new<F>(func: F, stack_size: usize) -> SchedResult<Rc<Self>>
    where
        F: FnOnce() + 'static,
    {
        let stack = CoStack::new(stack_size)?;
        let co = Rc::new(Self {
            id: CoroutineId::next(),
            state: Cell::new(CoState::Ready),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack,
            func: RefCell::new(Some(Box::new(func))),
        });
        unsafe {
            init_context(co.regs.get(), co.stack.top(), co_entry as usize, 0);
        }
        Ok(co)
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn state(&self) -> CoState {
        self.state.get()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.get().is_terminated()
    }

    /// Switch from the scheduling context into this coroutine
    ///
    /// Returns when the coroutine yields or terminates. Must be called
    /// from the scheduling context, never from inside another coroutine.
    ///
    /// # Panics
    ///
    /// Resuming a Running or Terminated coroutine is a programmer
    /// error, as is resuming while another coroutine runs this thread.
    pub fn resume(self: &Rc<Self>) {
        assert!(
            self.state.get().is_runnable(),
            "resume of {} in state {}",
            self.id,
            self.state.get()
        );
        assert!(
            CURRENT.with(|c| c.borrow().is_none()),
            "resume from inside a coroutine"
        );

        self.state.set(CoState::Running);
        CURRENT.with(|c| *c.borrow_mut() = Some(Rc::clone(self)));

        let co_regs = self.regs.get();
        SCHED_CTX.with(|sched| unsafe {
            context_switch(sched.get(), co_regs);
        });

        CURRENT.with(|c| *c.borrow_mut() = None);
    }
}

/// The coroutine running on this thread, if any
pub fn current() -> Option<Rc<Coroutine>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Yield the running coroutine in the `Suspended` state
///
/// It will not run again until something (an I/O event or timer)
/// re-queues it. No-op when called outside a coroutine.
pub fn yield_to_suspend() {
    switch_out(CoState::Suspended);
}

/// Yield the running coroutine in the `Ready` state
///
/// The worker puts it back on the ready queue, so it runs again after
/// the other queued tasks.
pub fn yield_to_ready() {
    switch_out(CoState::Ready);
}

fn switch_out(state: CoState) {
    let co = match current() {
        Some(co) => co,
        None => return,
    };
    co.state.set(state);
    let co_regs = co.regs.get();
    // Drop the Rc before leaving this stack frame; the worker's clone
    // keeps the coroutine alive
    drop(co);
    SCHED_CTX.with(|sched| unsafe {
        context_switch(co_regs, sched.get());
    });
}

/// Entry point running on the coroutine's own stack
extern "C" fn co_entry(_arg: usize) {
    let co = CURRENT.with(|c| c.borrow().clone());
    if let Some(co) = co {
        let func = co.func.borrow_mut().take();
        drop(co);
        if let Some(func) = func {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(func)) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                    .unwrap_or("non-string panic payload");
                rt_error!("coroutine panicked: {}", msg);
            }
        }
    }
    // falls through to finish_current in the trampoline
}

/// Terminated epilogue: mark the coroutine done and switch back to the
/// scheduling context. Called from the trampoline; never returns.
pub(crate) extern "C" fn finish_current() {
    let co_regs = CURRENT.with(|c| match c.borrow().as_ref() {
        Some(co) => {
            co.state.set(CoState::Terminated);
            co.regs.get()
        }
        // Only reachable from the trampoline, which runs under CURRENT
        None => std::process::abort(),
    });
    SCHED_CTX.with(|sched| unsafe {
        context_switch(co_regs, sched.get());
    });
    unreachable!("resumed a terminated coroutine");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_to_completion() {
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let co = Coroutine::new(move || hit2.set(true), 64 * 1024).unwrap();
        assert_eq!(co.state(), CoState::Ready);
        co.resume();
        assert!(hit.get());
        assert_eq!(co.state(), CoState::Terminated);
    }

    #[test]
    fn yield_and_resume_round_trips() {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&steps);
        let co = Coroutine::new(
            move || {
                s.borrow_mut().push("a");
                yield_to_ready();
                s.borrow_mut().push("b");
                yield_to_suspend();
                s.borrow_mut().push("c");
            },
            64 * 1024,
        )
        .unwrap();

        co.resume();
        assert_eq!(co.state(), CoState::Ready);
        assert_eq!(*steps.borrow(), ["a"]);

        co.resume();
        assert_eq!(co.state(), CoState::Suspended);
        assert_eq!(*steps.borrow(), ["a", "b"]);

        co.resume();
        assert_eq!(co.state(), CoState::Terminated);
        assert_eq!(*steps.borrow(), ["a", "b", "c"]);
    }

    #[test]
    fn panic_terminates_without_unwinding_into_the_scheduler() {
        let co = Coroutine::new(|| panic!("boom"), 64 * 1024).unwrap();
        co.resume();
        assert_eq!(co.state(), CoState::Terminated);
    }

    #[test]
    fn current_is_visible_inside_and_cleared_outside() {
        let seen = Rc::new(Cell::new(None));
        let seen2 = Rc::clone(&seen);
        let co = Coroutine::new(
            move || {
                seen2.set(current().map(|c| c.id()));
            },
            64 * 1024,
        )
        .unwrap();
        let id = co.id();
        co.resume();
        assert_eq!(seen.get(), Some(id));
        assert!(current().is_none());
    }

    #[test]
    fn yields_outside_a_coroutine_are_noops() {
        yield_to_ready();
        yield_to_suspend();
    }

    #[test]
    fn nested_coroutines_on_one_thread_interleave() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2) = (Rc::clone(&order), Rc::clone(&order));
        let a = Coroutine::new(
            move || {
                o1.borrow_mut().push(1);
                yield_to_ready();
                o1.borrow_mut().push(3);
            },
            64 * 1024,
        )
        .unwrap();
        let b = Coroutine::new(
            move || {
                o2.borrow_mut().push(2);
                yield_to_ready();
                o2.borrow_mut().push(4);
            },
            64 * 1024,
        )
        .unwrap();

        a.resume();
        b.resume();
        a.resume();
        b.resume();
        assert_eq!(*order.borrow(), [1, 2, 3, 4]);
    }
}
