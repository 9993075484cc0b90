//! # fibra-core - Core types for the fibra coroutine runtime
//!
//! Platform-agnostic building blocks shared by the runtime and its
//! consumers: coroutine state, identifiers, errors, the I/O-vs-timeout
//! cancellation token, environment helpers, and the log macros.

pub mod env;
pub mod error;
pub mod id;
pub mod rlog;
pub mod state;
pub mod token;

pub use env::{env_get, env_get_bool};
pub use error::{SchedError, SchedResult};
pub use id::CoroutineId;
pub use rlog::LogLevel;
pub use state::CoState;
pub use token::IoToken;
