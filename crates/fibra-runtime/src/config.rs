//! Runtime configuration
//!
//! Compile-time defaults with environment variable overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use fibra_runtime::SchedulerConfig;
//!
//! // Defaults plus any FIB_* overrides from the environment
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::new().num_workers(8).stack_size(256 * 1024);
//! ```

use fibra_core::env::{env_get, env_get_bool};
use fibra_core::error::{SchedError, SchedResult};

pub mod defaults {
    /// Pool worker threads (the caller's thread is an extra worker)
    pub const NUM_WORKERS: usize = 4;
    /// Usable stack bytes per coroutine
    pub const STACK_SIZE: usize = 128 * 1024;
    /// Cross-thread submission queue slots per worker
    pub const INBOX_CAPACITY: usize = 4096;
    /// Epoll wait cap when no timer is pending, in milliseconds
    pub const IDLE_WAIT_MS: u64 = 3000;
    /// Default connect() timeout, in milliseconds
    pub const CONNECT_TIMEOUT_MS: i64 = 5000;
    pub const DEBUG_LOGGING: bool = false;
}

/// Scheduler configuration with builder-style setters
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of pool worker threads
    pub num_workers: usize,
    /// Coroutine stack size in bytes
    pub stack_size: usize,
    /// Capacity of each worker's cross-thread inbox
    pub inbox_capacity: usize,
    /// Longest a worker sleeps in epoll with no pending timer (ms)
    pub idle_wait_ms: u64,
    /// Timeout applied to intercepted connect() calls (ms, -1 = none)
    pub connect_timeout_ms: i64,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults, no environment override
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            inbox_capacity: defaults::INBOX_CAPACITY,
            idle_wait_ms: defaults::IDLE_WAIT_MS,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `FIB_NUM_WORKERS` - Number of pool worker threads
    /// - `FIB_STACK_SIZE` - Coroutine stack size in bytes
    /// - `FIB_INBOX_CAPACITY` - Cross-thread inbox slots per worker
    /// - `FIB_IDLE_WAIT_MS` - Idle epoll wait cap in milliseconds
    /// - `FIB_CONNECT_TIMEOUT_MS` - connect() timeout in milliseconds
    /// - `FIB_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("FIB_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("FIB_STACK_SIZE", defaults::STACK_SIZE),
            inbox_capacity: env_get("FIB_INBOX_CAPACITY", defaults::INBOX_CAPACITY),
            idle_wait_ms: env_get("FIB_IDLE_WAIT_MS", defaults::IDLE_WAIT_MS),
            connect_timeout_ms: env_get("FIB_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            debug_logging: env_get_bool("FIB_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn inbox_capacity(mut self, cap: usize) -> Self {
        self.inbox_capacity = cap;
        self
    }

    pub fn idle_wait_ms(mut self, ms: u64) -> Self {
        self.idle_wait_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: i64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn validate(&self) -> SchedResult<()> {
        if self.num_workers == 0 {
            return Err(SchedError::InvalidConfig("num_workers must be > 0"));
        }
        if self.num_workers > 256 {
            return Err(SchedError::InvalidConfig("num_workers must be <= 256"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(SchedError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.inbox_capacity == 0 {
            return Err(SchedError::InvalidConfig("inbox_capacity must be > 0"));
        }
        Ok(())
    }
}
