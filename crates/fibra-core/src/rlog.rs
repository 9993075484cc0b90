//! Leveled stderr logging for the runtime
//!
//! Small printk-style layer: no sink plumbing, just levels, an optional
//! per-line flush, and a per-thread label so worker output is
//! attributable.
//!
//! # Environment Variables
//!
//! - `FIB_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `FIB_FLUSH_LOG=1` - Flush stderr after each line (debugging crashes)
//!
//! # Usage
//!
//! ```ignore
//! rt_info!("worker {} started", id);
//! rt_error!("add_event({}) failed", fd);
//! ```

use std::cell::RefCell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Label printed with every line from this thread (worker name)
    static THREAD_LABEL: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Initialize from environment variables
///
/// Called automatically on first log; callable explicitly for
/// deterministic startup.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("FIB_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Info,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("FIB_FLUSH_LOG") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Label this thread's log lines (worker name)
pub fn set_thread_label(label: &str) {
    THREAD_LABEL.with(|cell| *cell.borrow_mut() = Some(label.to_string()));
}

/// Remove this thread's log label
pub fn clear_thread_label() {
    THREAD_LABEL.with(|cell| *cell.borrow_mut() = None);
}

/// Check whether a message at `level` would be emitted
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed) && level != LogLevel::Off
}

/// Emit one formatted line; used by the macros, not called directly
pub fn write_line(level: LogLevel, args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = THREAD_LABEL.with(|cell| match &*cell.borrow() {
        Some(label) => writeln!(out, "{} [{}] {}", level.prefix(), label, args),
        None => writeln!(out, "{} {}", level.prefix(), args),
    });
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! rt_log {
    ($lvl:expr, $($arg:tt)*) => {{
        if $crate::rlog::enabled($lvl) {
            $crate::rlog::write_line($lvl, format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! rt_error {
    ($($arg:tt)*) => { $crate::rt_log!($crate::rlog::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! rt_warn {
    ($($arg:tt)*) => { $crate::rt_log!($crate::rlog::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! rt_info {
    ($($arg:tt)*) => { $crate::rt_log!($crate::rlog::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! rt_debug {
    ($($arg:tt)*) => { $crate::rt_log!($crate::rlog::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! rt_trace {
    ($($arg:tt)*) => { $crate::rt_log!($crate::rlog::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_enabled_respects_level() {
        set_log_level(LogLevel::Warn);
        assert!(enabled(LogLevel::Error));
        assert!(enabled(LogLevel::Warn));
        assert!(!enabled(LogLevel::Info));
        set_log_level(LogLevel::Info);
    }
}
