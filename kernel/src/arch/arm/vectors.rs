//! Exception vector table and the register save/restore stubs.
//!
//! The table is copied to virtual address 0 during interrupt setup (the
//! stub addresses are absolute, so the copy keeps working). Every vector
//! funnels into one stub flavour that builds an `InterruptFrame` on the
//! trapping thread's supervisor stack and calls the C-level dispatcher
//! with the vector offset.
//!
//! The frame layout here is bit-exact with
//! [`crate::arch::InterruptFrame`]; the two must change together.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .text
    .align 5
    .global vector_table_start
    .global vector_table_end

vector_table_start:
    ldr     pc, [pc, #24]       // 0x00 reset
    ldr     pc, [pc, #24]       // 0x04 undefined instruction
    ldr     pc, [pc, #24]       // 0x08 software interrupt
    ldr     pc, [pc, #24]       // 0x0c prefetch abort
    ldr     pc, [pc, #24]       // 0x10 data abort
    ldr     pc, [pc, #24]       // 0x14 unused
    ldr     pc, [pc, #24]       // 0x18 irq
    ldr     pc, [pc, #24]       // 0x1c fiq
    .word   _vec_reset
    .word   _vec_undefined
    .word   _vec_swi
    .word   _vec_prefetch_abort
    .word   _vec_data_abort
    .word   _vec_unused
    .word   _vec_irq
    .word   _vec_fiq
vector_table_end:

    // Build an InterruptFrame on the supervisor stack and dispatch.
    //
    // On entry lr has already been adjusted to the resume address. srsdb
    // pushes {{lr, spsr}} onto the supervisor stack regardless of the mode
    // the exception was taken in, so aborts and IRQs land on the trapped
    // thread's kernel stack like SWIs do.
.macro vector_stub name, offset, lr_adjust
    .type \name, %function
\name:
    .if \lr_adjust
    sub     lr, lr, #\lr_adjust
    .endif
    srsdb   sp!, #0x13
    cps     #0x13
    push    {{lr}}
    push    {{r0-r12}}
    sub     sp, sp, #8
    stmia   sp, {{sp, lr}}^
    mov     r0, #\offset
    mov     r1, sp
    bl      irq_and_exception_handler
    ldmia   sp, {{sp, lr}}^
    add     sp, sp, #8
    pop     {{r0-r12}}
    pop     {{lr}}
    rfeia   sp!
    .size \name, . - \name
.endm

    vector_stub _vec_reset,          0x00, 0
    vector_stub _vec_undefined,      0x04, 0
    vector_stub _vec_swi,            0x08, 0
    vector_stub _vec_prefetch_abort, 0x0c, 4
    vector_stub _vec_data_abort,     0x10, 8
    vector_stub _vec_unused,         0x14, 0
    vector_stub _vec_irq,            0x18, 4
    vector_stub _vec_fiq,            0x1c, 4
"#
);

extern "C" {
    static vector_table_start: u8;
    static vector_table_end: u8;
}

/// The vector table image to be copied to virtual address 0.
pub fn table_image() -> &'static [u8] {
    // Addresses of asm symbols; the range is the assembled table plus
    // its literal pool.
    unsafe {
        let start = core::ptr::addr_of!(vector_table_start);
        let end = core::ptr::addr_of!(vector_table_end);
        core::slice::from_raw_parts(start, end as usize - start as usize)
    }
}
