//! # fibra - stackful coroutines with blocking-style I/O
//!
//! A small cooperative runtime: coroutines with their own guard-paged
//! stacks, scheduled over a pool of per-thread reactors (epoll + timer
//! heap + FIFO ready queue), plus a POSIX-shaped interception shim so
//! code written as straight-line blocking I/O never blocks its OS
//! thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fibra::{Scheduler, SchedulerConfig, hook};
//!
//! fn main() {
//!     let mut sched = Scheduler::new("app", SchedulerConfig::from_env()).unwrap();
//!     sched.start().unwrap();
//!
//!     sched.add_task(|| {
//!         // Looks blocking; suspends the coroutine, not the thread
//!         hook::sleep_ms(100);
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // ... hook::connect / hook::read / hook::write ...
//!         hook::close(fd);
//!     }, None);
//!
//!     sched.wait().unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    User Code                       │
//! │      add_task(), hook::read(), hook::sleep()       │
//! └────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌────────────────────────────────────────────────────┐
//! │                    Scheduler                       │
//! │     round-robin dispatch, pool + main worker       │
//! └────────────────────────────────────────────────────┘
//!              │                        │
//!              ▼                        ▼
//!       ┌────────────┐          ┌────────────┐
//!       │   Worker   │          │   Worker   │
//!       │ epoll+heap │          │ epoll+heap │
//!       └────────────┘          └────────────┘
//!              │                        │
//!              └───────────┬────────────┘
//!                          ▼
//!    ┌────────────────────────────────────────────────┐
//!    │    FdTable (shadow flags) + coroutine stacks   │
//!    └────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use fibra_core::error::{SchedError, SchedResult};
pub use fibra_core::id::CoroutineId;
pub use fibra_core::rlog::{self, init as init_logging, set_log_level, LogLevel};
pub use fibra_core::state::CoState;
pub use fibra_core::token::IoToken;
pub use fibra_core::{env_get, env_get_bool};
pub use fibra_core::{rt_debug, rt_error, rt_info, rt_log, rt_trace, rt_warn};

// Re-export the runtime surface
pub use fibra_runtime::hook;
pub use fibra_runtime::{
    current, fd_table, sleep, yield_to_ready, yield_to_suspend, Coroutine, FdContext, FdTable,
    IoDirection, Scheduler, SchedulerConfig, StopHandle, TimeoutKind, Worker, WorkerHandle,
};

/// Yield the calling coroutine back to its worker's ready queue
///
/// Outside a coroutine this yields the OS thread.
#[inline]
pub fn yield_now() {
    if fibra_runtime::current().is_some() {
        fibra_runtime::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

/// Whether the caller is running inside a coroutine
#[inline]
pub fn in_coroutine() -> bool {
    fibra_runtime::current().is_some()
}
