//! # fibra-runtime - the coroutine scheduling engine
//!
//! One `Worker` per OS thread runs a reactor loop combining a FIFO ready
//! queue, an epoll instance, and a timer heap. Stackful coroutines are
//! pinned to the worker that first runs them; blocking-looking calls go
//! through the `hook` shim, which attempts the syscall, and on
//! would-block registers readiness interest plus an optional timeout
//! timer and suspends the calling coroutine. The worker resumes it from
//! whichever side fires first.
//!
//! ```text
//!   app code ──► hook::read ──► attempt ──EAGAIN──► register + suspend
//!                                  ▲                      │
//!                                  └──── Worker loop ◄────┘
//!                                 (epoll / timer heap / ready queue)
//! ```

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod fd_table;
pub mod hook;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod worker;

pub use config::SchedulerConfig;
pub use coroutine::{current, yield_to_ready, yield_to_suspend, Coroutine};
pub use fd_table::{fd_table, FdContext, FdTable, TimeoutKind};
pub use scheduler::{Scheduler, StopHandle};
pub use timer::{TimerHandle, TimerHeap};
pub use worker::{sleep, IoDirection, Worker, WorkerHandle};
