//! Architecture-specific context switching
//!
//! Saves and restores the callee-saved register set when control moves
//! between a worker's scheduling context and a coroutine stack. No heap
//! allocation happens on this path.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{init_context, context_switch, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{init_context, context_switch, SavedRegs};
    }
}
