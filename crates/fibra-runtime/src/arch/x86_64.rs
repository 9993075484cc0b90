//! x86_64 context switching
//!
//! Callee-saved registers only: a switch always happens at a call
//! boundary (resume or yield), so caller-saved registers are already
//! dead per the System V ABI.

use std::arch::naked_asm;

/// Saved execution context: stack pointer, resume address, and the
/// System V callee-saved registers.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh coroutine context
///
/// The first switch into `regs` starts execution in the trampoline,
/// which calls `entry_fn(entry_arg)` and then the terminated epilogue.
///
/// # Safety
///
/// `regs` must point to writable `SavedRegs` memory and `stack_top` to
/// the top of a live stack mapping.
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned at the trampoline's `call` so the entry function
    // observes the standard rsp % 16 == 8 on entry
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument, then the
/// terminated epilogue (which switches away and never returns)
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finished}",
        "ud2",
        finished = sym crate::coroutine::finish_current,
    );
}

/// Switch stacks: save the current context into `save`, restore `restore`
///
/// Returns (to the saved rip) when some later switch restores `save`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut SavedRegs, _restore: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers into save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from restore (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
