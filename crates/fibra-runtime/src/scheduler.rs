//! # Scheduler - worker pool plus the caller's own reactor
//!
//! `Scheduler::new` builds N pool workers and one extra "main" worker
//! bound to the constructing thread. `start` spawns one named OS thread
//! per pool worker; `wait` runs the main worker's reactor loop inline
//! until `stop` is observed, then joins the pool.
//!
//! Unpinned tasks round-robin over the pool workers only; the main
//! worker receives work solely by explicit pinning (its id is
//! `num_workers`).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use fibra_core::error::{SchedError, SchedResult};
use fibra_core::{rt_debug, rt_error, rt_info};

use crate::config::SchedulerConfig;
use crate::hook;
use crate::worker::{Worker, WorkerHandle};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    /// Pool worker handles, index = worker id
    pool: Vec<Arc<WorkerHandle>>,
    /// Reactor owned by the thread that built the scheduler; id is
    /// `config.num_workers`
    main_worker: Rc<Worker>,
    threads: RefCell<Vec<thread::JoinHandle<()>>>,
    state: AtomicU8,
    /// Round-robin cursor over the pool
    next: AtomicUsize,
}

impl Scheduler {
    /// Validate the config and build the workers; none run yet
    pub fn new(name: &str, config: SchedulerConfig) -> SchedResult<Self> {
        config.validate()?;
        fibra_core::rlog::init();
        if config.debug_logging {
            fibra_core::rlog::set_log_level(fibra_core::rlog::LogLevel::Debug);
        }
        hook::set_default_connect_timeout_ms(config.connect_timeout_ms);

        let main_worker = Worker::new(config.num_workers, &config)?;

        Ok(Self {
            name: name.to_string(),
            config,
            pool: Vec::new(),
            main_worker,
            threads: RefCell::new(Vec::new()),
            state: AtomicU8::new(STATE_CREATED),
            next: AtomicUsize::new(0),
        })
    }

    /// Id of the main worker (for pinning work to the `wait` thread)
    pub fn main_worker_id(&self) -> usize {
        self.config.num_workers
    }

    /// A `Send` handle that tasks can capture to trigger shutdown
    /// from inside a worker
    pub fn stop_handle(&self) -> StopHandle {
        let mut handles: Vec<Arc<WorkerHandle>> =
            self.pool.iter().map(Arc::clone).collect();
        handles.push(self.main_worker.handle());
        StopHandle { handles }
    }

    /// Spawn the pool worker threads
    pub fn start(&mut self) -> SchedResult<()> {
        if self.state.swap(STATE_RUNNING, Ordering::AcqRel) != STATE_CREATED {
            return Err(SchedError::AlreadyStarted);
        }

        // Workers hold thread-local state, so each is built on its own
        // thread; the handle comes back over a channel before any work
        // is accepted
        let (tx, rx) = mpsc::channel::<SchedResult<Arc<WorkerHandle>>>();
        for id in 0..self.config.num_workers {
            let tx = tx.clone();
            let config = self.config.clone();
            let thread_name = format!("{}-w{}", self.name, id);
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || match Worker::new(id, &config) {
                    Ok(worker) => {
                        let _ = tx.send(Ok(worker.handle()));
                        worker.run();
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                })
                .map_err(|e| {
                    rt_error!("failed to spawn worker thread: {}", e);
                    SchedError::Os(libc::EAGAIN)
                })?;
            self.threads.borrow_mut().push(handle);
        }
        drop(tx);

        for _ in 0..self.config.num_workers {
            match rx.recv() {
                Ok(Ok(handle)) => self.pool.push(handle),
                Ok(Err(e)) => {
                    self.stop();
                    return Err(e);
                }
                Err(_) => {
                    self.stop();
                    return Err(SchedError::NotStarted);
                }
            }
        }
        // Channel order is arrival order, not id order
        self.pool.sort_by_key(|h| h.worker_id());

        rt_info!(
            "scheduler {} started with {} pool workers",
            self.name,
            self.pool.len()
        );
        Ok(())
    }

    /// Queue `func` to run as a coroutine
    ///
    /// `target = Some(id)` pins it to that worker; an unknown id is
    /// reported and the task dropped. `target = None` round-robins
    /// over the pool.
    pub fn add_task<F>(&self, func: F, target: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        match target {
            Some(id) if id < self.pool.len() => self.pool[id].submit(func),
            Some(id) if id == self.main_worker_id() => {
                self.main_worker.handle().submit(func)
            }
            Some(id) => {
                rt_error!("{}, dropping pinned task", SchedError::UnknownWorker(id));
            }
            None => match self.next_worker() {
                Some(handle) => handle.submit(func),
                None => rt_error!("add_task before start, dropping task"),
            },
        }
    }

    fn next_worker(&self) -> Option<&Arc<WorkerHandle>> {
        if self.pool.is_empty() {
            return None;
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Some(&self.pool[n % self.pool.len()])
    }

    /// Run the main worker's reactor loop on the calling thread until
    /// `stop`, then join the pool threads
    pub fn wait(&self) -> SchedResult<()> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Err(SchedError::NotStarted);
        }
        self.main_worker.run();
        // A StopHandle only signals worker loops; finish the shutdown
        self.stop();
        self.join_pool();
        Ok(())
    }

    /// `start` followed by `wait`
    pub fn start_and_wait(&mut self) -> SchedResult<()> {
        self.start()?;
        self.wait()
    }

    /// Signal every worker to finish its current pass and exit
    ///
    /// No drain is attempted: coroutines still suspended on I/O or
    /// timers are abandoned. Joins the pool threads unless called from
    /// inside a worker (where joining would deadlock); `wait` and Drop
    /// cover the join in that case.
    pub fn stop(&self) {
        let prev = self.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if prev == STATE_STOPPED {
            return;
        }
        rt_debug!("scheduler {} stopping", self.name);
        for handle in &self.pool {
            handle.stop();
        }
        self.main_worker.handle().stop();
        if Worker::current().is_none() {
            self.join_pool();
        }
    }

    fn join_pool(&self) {
        let threads = std::mem::take(&mut *self.threads.borrow_mut());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

/// Cross-thread shutdown trigger; see [`Scheduler::stop_handle`]
#[derive(Clone)]
pub struct StopHandle {
    handles: Vec<Arc<WorkerHandle>>,
}

impl StopHandle {
    /// Signal every worker to exit; never joins
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        if Worker::current().is_none() {
            self.join_pool();
        }
    }
}
