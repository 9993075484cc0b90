//! # Worker - the per-thread reactor
//!
//! Each worker owns a FIFO ready queue, an epoll instance, a timer
//! heap, and the coroutines pinned to it. One pass of the loop drains
//! the cross-thread inbox, runs every ready task, fires due timers,
//! then sleeps in `epoll_wait` until the next deadline, an I/O event,
//! or an inbox notification via the worker's eventfd.
//!
//! Coroutines and the queues they sit in are thread-local (`Rc`); the
//! only cross-thread surface is `WorkerHandle`, which carries boxed
//! `Send` closures that become coroutines on the owning thread.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use fibra_core::error::{SchedError, SchedResult};
use fibra_core::{rt_debug, rt_error, rt_trace, rt_warn};

use crate::config::SchedulerConfig;
use crate::coroutine::{self, Coroutine};
use crate::timer::{TimerHandle, TimerHeap};

/// epoll user-data value reserved for the inbox eventfd
const NOTIFY_DATA: u64 = u64::MAX;

/// How many events one `epoll_wait` call can return
const EVENT_BATCH: usize = 256;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Rc<Worker>>> = const { RefCell::new(None) };
}

/// Which readiness a suspended coroutine is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

enum Task {
    Co(Rc<Coroutine>),
    Func(Box<dyn FnOnce()>),
}

/// At most one waiter per direction per descriptor
#[derive(Default)]
struct FdWaiters {
    read: Option<Rc<Coroutine>>,
    write: Option<Rc<Coroutine>>,
}

impl FdWaiters {
    fn slot(&mut self, dir: IoDirection) -> &mut Option<Rc<Coroutine>> {
        match dir {
            IoDirection::Read => &mut self.read,
            IoDirection::Write => &mut self.write,
        }
    }

    fn interest(&self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.read.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.write.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Eventfd used to interrupt a worker's epoll wait.
///
/// Counter semantics coalesce: any number of `notify()` calls before
/// the worker drains result in a single wakeup.
struct Notifier {
    fd: RawFd,
}

impl Notifier {
    fn create() -> SchedResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(SchedError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(Self { fd })
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn notify(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, so a wakeup is
        // already pending
        if ret < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EAGAIN {
                rt_warn!("eventfd notify failed: errno {}", errno);
            }
        }
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

type InboxFn = Box<dyn FnOnce() + Send>;

/// The cross-thread face of a worker: submit closures, signal stop
pub struct WorkerHandle {
    worker_id: usize,
    inbox: ArrayQueue<InboxFn>,
    notifier: Notifier,
    stopped: AtomicBool,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Queue a closure to run as a coroutine on the owning worker.
    ///
    /// Spins (yielding the OS thread) while the inbox is full rather
    /// than dropping work.
    pub fn submit<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut item: InboxFn = Box::new(func);
        loop {
            match self.inbox.push(item) {
                Ok(()) => break,
                Err(back) => {
                    item = back;
                    self.notifier.notify();
                    std::thread::yield_now();
                }
            }
        }
        self.notifier.notify();
    }

    /// Ask the worker to exit once its ready queue and inbox drain
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notifier.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A per-thread reactor; see the module docs
pub struct Worker {
    id: usize,
    stack_size: usize,
    idle_wait_ms: u64,
    epoll: Epoll,
    ready: RefCell<VecDeque<Task>>,
    timers: RefCell<TimerHeap>,
    waiters: RefCell<HashMap<RawFd, FdWaiters>>,
    handle: Arc<WorkerHandle>,
}

impl Worker {
    /// Build a worker bound to no thread yet; `run` pins it
    pub fn new(id: usize, config: &SchedulerConfig) -> SchedResult<Rc<Self>> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| SchedError::Os(e as i32))?;
        let notifier = Notifier::create()?;

        let notify_fd = unsafe { BorrowedFd::borrow_raw(notifier.fd()) };
        epoll
            .add(notify_fd, EpollEvent::new(EpollFlags::EPOLLIN, NOTIFY_DATA))
            .map_err(|e| SchedError::Os(e as i32))?;

        let handle = Arc::new(WorkerHandle {
            worker_id: id,
            inbox: ArrayQueue::new(config.inbox_capacity),
            notifier,
            stopped: AtomicBool::new(false),
        });

        Ok(Rc::new(Self {
            id,
            stack_size: config.stack_size,
            idle_wait_ms: config.idle_wait_ms,
            epoll,
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerHeap::new()),
            waiters: RefCell::new(HashMap::new()),
            handle,
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> Arc<WorkerHandle> {
        Arc::clone(&self.handle)
    }

    /// The worker owning the calling thread, if it is a worker thread
    pub fn current() -> Option<Rc<Worker>> {
        CURRENT_WORKER.with(|w| w.borrow().clone())
    }

    /// Create a coroutine for `func` and queue it on this worker
    pub fn spawn<F>(&self, func: F) -> SchedResult<()>
    where
        F: FnOnce() + 'static,
    {
        let co = Coroutine::new(func, self.stack_size)?;
        self.schedule(co);
        Ok(())
    }

    /// Put a coroutine on the ready queue
    pub fn schedule(&self, co: Rc<Coroutine>) {
        self.ready.borrow_mut().push_back(Task::Co(co));
    }

    pub fn add_timer<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.timers.borrow_mut().add_timer(delay, callback)
    }

    pub fn add_conditional_timer<F>(
        &self,
        delay: Duration,
        token: std::sync::Weak<fibra_core::token::IoToken>,
        callback: F,
    ) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        self.timers
            .borrow_mut()
            .add_conditional(delay, token, callback)
    }

    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.timers.borrow_mut().cancel(handle)
    }

    /// Park `co` until `fd` is ready in direction `dir`
    ///
    /// Replaces any previous waiter for the same slot, re-queueing it
    /// so it is never silently lost.
    pub fn add_event(&self, fd: RawFd, dir: IoDirection, co: Rc<Coroutine>) -> SchedResult<()> {
        let mut waiters = self.waiters.borrow_mut();
        let known = waiters.contains_key(&fd);
        let entry = waiters.entry(fd).or_default();
        if let Some(old) = entry.slot(dir).replace(co) {
            rt_warn!("fd {} already had a {:?} waiter, re-queueing it", fd, dir);
            self.ready.borrow_mut().push_back(Task::Co(old));
        }
        let mut event = EpollEvent::new(entry.interest(), fd as u64);
        drop(waiters);

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let res = if known {
            self.epoll.modify(borrowed, &mut event)
        } else {
            self.epoll.add(borrowed, event)
        };
        res.map_err(|e| {
            rt_error!("epoll register failed for fd {}: {}", fd, e);
            self.take_waiter(fd, dir);
            SchedError::RegistrationFailed
        })
    }

    /// Wake the waiter for (`fd`, `dir`), pruning the epoll interest
    ///
    /// Safe to call when no waiter exists (timer and readiness paths
    /// can both reach here).
    pub fn handle_event(&self, fd: RawFd, dir: IoDirection) {
        if let Some(co) = self.take_waiter(fd, dir) {
            rt_trace!("fd {} {:?} ready, waking {}", fd, dir, co.id());
            self.ready.borrow_mut().push_back(Task::Co(co));
        }
    }

    /// Wake both directions; used when a descriptor is closed
    pub fn handle_all_events(&self, fd: RawFd) {
        self.handle_event(fd, IoDirection::Read);
        self.handle_event(fd, IoDirection::Write);
    }

    fn take_waiter(&self, fd: RawFd, dir: IoDirection) -> Option<Rc<Coroutine>> {
        let mut waiters = self.waiters.borrow_mut();
        let entry = waiters.get_mut(&fd)?;
        let co = entry.slot(dir).take();
        let remaining = entry.interest();
        let gone = entry.is_empty();
        if gone {
            waiters.remove(&fd);
        }
        drop(waiters);

        if co.is_some() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let res = if gone {
                self.epoll.delete(borrowed)
            } else {
                let mut event = EpollEvent::new(remaining, fd as u64);
                self.epoll.modify(borrowed, &mut event)
            };
            // ENOENT/EBADF here just means the fd was closed underneath
            // us; the kernel already dropped the registration
            if let Err(e) = res {
                rt_trace!("epoll prune for fd {} returned {}", fd, e);
            }
        }
        co
    }

    /// The reactor loop. Pins the worker to the calling thread and
    /// returns once `stop` was signalled and the queues drained.
    /// Suspended coroutines still waiting on I/O or timers are
    /// abandoned at that point.
    pub fn run(self: &Rc<Self>) {
        CURRENT_WORKER.with(|w| *w.borrow_mut() = Some(Rc::clone(self)));
        fibra_core::rlog::set_thread_label(&format!("w{}", self.id));
        crate::hook::set_hook_enabled(true);
        rt_debug!("worker {} running", self.id);

        let mut events = vec![EpollEvent::empty(); EVENT_BATCH];
        loop {
            self.drain_inbox();
            self.run_ready();
            self.fire_timers();

            if self.handle.is_stopped() && self.is_idle() {
                break;
            }

            let timeout = self.wait_timeout_ms();
            let n = match self.epoll.wait(&mut events, EpollTimeout::from(timeout)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    rt_error!("worker {} epoll_wait failed: {}", self.id, e);
                    break;
                }
            };

            for event in &events[..n] {
                if event.data() == NOTIFY_DATA {
                    self.handle.notifier.drain();
                    continue;
                }
                let fd = event.data() as RawFd;
                let flags = event.events();
                // Errors and hangups wake both sides so each waiter can
                // observe the failure from its own syscall retry
                let fail = flags
                    .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
                if fail || flags.contains(EpollFlags::EPOLLIN) {
                    self.handle_event(fd, IoDirection::Read);
                }
                if fail || flags.contains(EpollFlags::EPOLLOUT) {
                    self.handle_event(fd, IoDirection::Write);
                }
            }
        }

        rt_debug!("worker {} stopped", self.id);
        crate::hook::set_hook_enabled(false);
        fibra_core::rlog::clear_thread_label();
        CURRENT_WORKER.with(|w| *w.borrow_mut() = None);
    }

    fn is_idle(&self) -> bool {
        self.ready.borrow().is_empty() && self.handle.inbox.is_empty()
    }

    fn drain_inbox(&self) {
        while let Some(func) = self.handle.inbox.pop() {
            self.ready.borrow_mut().push_back(Task::Func(func));
        }
    }

    fn run_ready(&self) {
        // Snapshot drain: coroutines queued while running this batch
        // wait for the next pass, so a yield loop cannot starve epoll
        let batch = std::mem::take(&mut *self.ready.borrow_mut());
        for task in batch {
            match task {
                Task::Co(co) => self.run_coroutine(co),
                Task::Func(func) => match Coroutine::new(func, self.stack_size) {
                    Ok(co) => self.run_coroutine(co),
                    Err(e) => rt_error!("worker {} failed to spawn task: {}", self.id, e),
                },
            }
        }
    }

    fn run_coroutine(&self, co: Rc<Coroutine>) {
        co.resume();
        if co.state().is_runnable() {
            // Yielded cooperatively; back of the line
            self.ready.borrow_mut().push_back(Task::Co(co));
        }
        // Suspended: an event or timer holds the Rc and will re-queue.
        // Terminated: dropped here, stack unmapped.
    }

    fn fire_timers(&self) {
        // Callbacks run outside the borrow; they may re-arm timers
        let expired = self.timers.borrow_mut().take_expired(Instant::now());
        for callback in expired {
            callback();
        }
    }

    fn wait_timeout_ms(&self) -> u16 {
        if !self.ready.borrow().is_empty() || !self.handle.inbox.is_empty() {
            return 0;
        }
        let cap = self.idle_wait_ms.min(u16::MAX as u64);
        let ms = match self.timers.borrow().next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                // Round up so we never wake a hair before the deadline
                (until.as_millis() as u64).saturating_add(1).min(cap)
            }
            None => cap,
        };
        ms as u16
    }
}

/// Suspend the calling coroutine for `dur`
///
/// Outside a coroutine this degrades to a plain thread sleep.
pub fn sleep(dur: Duration) {
    let (worker, co) = match (Worker::current(), coroutine::current()) {
        (Some(w), Some(c)) => (w, c),
        _ => return std::thread::sleep(dur),
    };
    let weak: Weak<Worker> = Rc::downgrade(&worker);
    worker.add_timer(dur, move || {
        if let Some(worker) = weak.upgrade() {
            worker.schedule(co);
        }
    });
    drop(worker);
    coroutine::yield_to_suspend();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig::new().stack_size(64 * 1024)
    }

    #[test]
    fn ready_tasks_run_in_fifo_order() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for n in [1, 2, 3] {
            let o = Rc::clone(&order);
            worker.spawn(move || o.borrow_mut().push(n)).unwrap();
        }
        worker.handle().stop();
        worker.run();
        assert_eq!(*order.borrow(), [1, 2, 3]);
    }

    #[test]
    fn yielded_coroutines_go_to_the_back() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        worker
            .spawn(move || {
                o1.borrow_mut().push("a1");
                coroutine::yield_to_ready();
                o1.borrow_mut().push("a2");
            })
            .unwrap();
        let o2 = Rc::clone(&order);
        worker.spawn(move || o2.borrow_mut().push("b")).unwrap();
        worker.handle().stop();
        worker.run();
        assert_eq!(*order.borrow(), ["a1", "b", "a2"]);
    }

    #[test]
    fn inbox_submissions_run_as_coroutines() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let handle = worker.handle();
        let hit = Arc::new(AtomicBool::new(false));
        let h = Arc::clone(&hit);
        handle.submit(move || h.store(true, Ordering::SeqCst));
        handle.stop();
        worker.run();
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn submit_from_another_thread_wakes_the_worker() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let handle = worker.handle();
        let hit = Arc::new(AtomicBool::new(false));
        let h = Arc::clone(&hit);
        let h2 = Arc::clone(&handle);
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            h2.submit(move || h.store(true, Ordering::SeqCst));
            h2.stop();
        });
        // Worker sits in epoll until the submission arrives
        worker.run();
        sender.join().unwrap();
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn sleep_resumes_after_the_deadline() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let handle = worker.handle();
        let elapsed = Rc::new(RefCell::new(None));
        let e = Rc::clone(&elapsed);
        worker
            .spawn(move || {
                let start = Instant::now();
                sleep(Duration::from_millis(50));
                *e.borrow_mut() = Some(start.elapsed());
            })
            .unwrap();
        let h = Arc::clone(&handle);
        worker
            .spawn(move || {
                sleep(Duration::from_millis(80));
                h.stop();
            })
            .unwrap();
        worker.run();
        let elapsed = elapsed.borrow().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "woke at {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn timers_fire_in_deadline_order_across_coroutines() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let handle = worker.handle();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (n, ms) in [(3u32, 60u64), (1, 20), (2, 40)] {
            let o = Rc::clone(&order);
            worker
                .spawn(move || {
                    sleep(Duration::from_millis(ms));
                    o.borrow_mut().push(n);
                })
                .unwrap();
        }
        let h = Arc::clone(&handle);
        worker
            .spawn(move || {
                sleep(Duration::from_millis(100));
                h.stop();
            })
            .unwrap();
        worker.run();
        assert_eq!(*order.borrow(), [1, 2, 3]);
    }

    #[test]
    fn stop_drains_queued_work_before_exiting() {
        let worker = Worker::new(0, &test_config()).unwrap();
        let handle = worker.handle();
        handle.stop();
        let hit = Rc::new(RefCell::new(false));
        let h = Rc::clone(&hit);
        worker.spawn(move || *h.borrow_mut() = true).unwrap();
        worker.run();
        assert!(*hit.borrow());
    }
}
