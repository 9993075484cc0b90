//! aarch64 context switching
//!
//! Saves sp, the resume pc, x19-x28, fp and lr - the AAPCS64
//! callee-saved set.

use std::arch::naked_asm;

/// Saved execution context (AAPCS64 callee-saved set)
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedRegs {
    pub sp: u64,
    pub pc: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub lr: u64,
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            pc: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
        }
    }
}

/// Initialize a fresh coroutine context
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
    // sp must stay 16-byte aligned at all times on aarch64
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    *regs = SavedRegs::zeroed();
    regs.sp = aligned_sp as u64;
    regs.pc = entry_trampoline as usize as u64;
    regs.x19 = entry_fn as u64;
    regs.x20 = entry_arg as u64;
}

/// Trampoline that calls the entry function with its argument, then the
/// terminated epilogue (which switches away and never returns)
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "bl {finished}",
        "brk #0",
        finished = sym crate::coroutine::finish_current,
    );
}

/// Switch stacks: save the current context into `save` (x0), restore
/// `restore` (x1)
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut SavedRegs, _restore: *const SavedRegs) {
    naked_asm!(
        // Save into x0
        "mov x9, sp",
        "str x9, [x0, 0x00]",
        "adr x9, 1f",
        "str x9, [x0, 0x08]",
        "stp x19, x20, [x0, 0x10]",
        "stp x21, x22, [x0, 0x20]",
        "stp x23, x24, [x0, 0x30]",
        "stp x25, x26, [x0, 0x40]",
        "stp x27, x28, [x0, 0x50]",
        "stp x29, x30, [x0, 0x60]",
        // Load from x1
        "ldr x9, [x1, 0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, 0x10]",
        "ldp x21, x22, [x1, 0x20]",
        "ldp x23, x24, [x1, 0x30]",
        "ldp x25, x26, [x1, 0x40]",
        "ldp x27, x28, [x1, 0x50]",
        "ldp x29, x30, [x1, 0x60]",
        "ldr x9, [x1, 0x08]",
        "br x9",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
