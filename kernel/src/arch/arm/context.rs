//! The context-switch primitive and the first-switch trampoline.
//!
//! A context switch pushes the kernel-mode r0-r12 and lr onto the outgoing
//! stack, parks the resulting stack pointer in the outgoing thread's save
//! slot, adopts the incoming thread's saved stack pointer, pops its frame
//! and returns into whatever kernel code that thread was executing. For a
//! brand-new thread the saved frame's return address is
//! `thread_start_trampoline`, which pops the initial interrupt frame and
//! drops to user mode at the entry point.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .text
    .global _context_switch
    .type _context_switch, %function
_context_switch:
    // r0 = &mut saved-sp slot of the outgoing thread
    // r1 = saved sp of the incoming thread
    push    {{r0-r12, lr}}
    str     sp, [r0]
    mov     sp, r1
    pop     {{r0-r12, lr}}
    cpsie   i
    bx      lr
    .size _context_switch, . - _context_switch

    .global _thread_start_trampoline
    .type _thread_start_trampoline, %function
_thread_start_trampoline:
    // sp points at a full InterruptFrame: restore the banked user sp/lr,
    // then the general registers, then return-from-exception.
    ldmia   sp, {{sp, lr}}^
    add     sp, sp, #8
    pop     {{r0-r12}}
    pop     {{lr}}
    rfeia   sp!
    .size _thread_start_trampoline, . - _thread_start_trampoline
"#
);

extern "C" {
    fn _context_switch(from_slot: *mut *mut u8, to: *mut u8);
    static _thread_start_trampoline: u8;
}

/// Switch kernel stacks: save the outgoing thread's kernel context into
/// `from_slot` and resume the incoming thread at `to`.
///
/// # Safety
/// Must be called in supervisor mode with IRQs disabled. `from_slot` must
/// be the outgoing thread's save slot and `to` a stack pointer previously
/// produced by this function (or by the initial stack builder).
pub unsafe fn context_switch(from_slot: *mut *mut u8, to: *mut u8) {
    debug_assert!(super::cpu::is_supervisor_mode());
    unsafe { _context_switch(from_slot, to) }
}

/// Address of the first-switch trampoline.
pub fn thread_start_trampoline() -> u32 {
    // SAFETY: only the asm symbol's address is taken, never its value.
    unsafe { core::ptr::addr_of!(_thread_start_trampoline) as u32 }
}
