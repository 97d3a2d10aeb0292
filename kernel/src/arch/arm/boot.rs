//! Pre-MMU boot path.
//!
//! Runs from the physical entry point with the MMU off. Builds the
//! initial translation table in the boot-memory arena, maps RAM twice
//! (identity, so the enable sequence survives, and through the
//! physical-memory hole at the higher-half base), sets up a proper
//! kernel stack with the [`BootParams`] record on top and turns the MMU
//! on, landing in `kernel_entry` at higher-half addresses.
//!
//! Board specifics (early console, RAM and boot-arena ranges) come in
//! through the `board_early_*` hooks the board layer links in.

use core::arch::global_asm;

use crate::{
    bootstrap::{BootMem, BootParams},
    mm::{areas, page_table::{lvl1_index, AccessPermissions, FirstLevelEntry}, round_down,
        MIB, SECTION_SIZE},
    print,
};

global_asm!(
    r#"
    .section .text.boot, "ax"
    .global _start
_start:
    // Supervisor mode, IRQ/FIQ masked.
    cpsid   if, #0x13
    ldr     sp, =__boot_stack_top
    b       boot_start

    .section .bss.boot, "aw", %nobits
    .align 3
__boot_stack:
    .space  4096
__boot_stack_top:

    .section .text.boot, "ax"
    .global activate_mmu_and_jump
    .type activate_mmu_and_jump, %function
activate_mmu_and_jump:
    // r0 = L1 table physical base, r1 = new stack pointer (higher-half,
    // pointing at the BootParams record), r2 = entry point.
    mcr     p15, 0, r0, c2, c0, 0       // TTBR0
    mov     r4, #0
    mcr     p15, 0, r4, c2, c0, 2       // TTBCR: one table for all of it
    mov     r4, #1
    mcr     p15, 0, r4, c3, c0, 0       // domain 0: client
    mrc     p15, 0, r4, c1, c0, 0
    orr     r4, r4, #1                  // SCTLR.M
    mcr     p15, 0, r4, c1, c0, 0
    mcr     p15, 0, r4, c8, c7, 0       // invalidate TLBs
    dsb
    isb
    mov     sp, r1
    mov     r0, r1
    bx      r2
    .size activate_mmu_and_jump, . - activate_mmu_and_jump
"#
);

extern "C" {
    /// Bring up the board's early console.
    fn board_early_console_init();
    /// Emit one byte on the early console.
    fn board_early_putchar(byte: u8);
    /// Detected RAM range (physical).
    fn board_early_ram_range(start: *mut u32, size: *mut u32);
    /// Boot-memory arena, above the kernel image (physical).
    fn board_early_bootmem_range(start: *mut u32, size: *mut u32);

    fn activate_mmu_and_jump(ttbr0: u32, stack: u32, entry: u32) -> !;
    /// Higher-half entry in the kernel binary.
    fn kernel_entry(params: *const BootParams) -> !;

    static __bundle_dtb_start: u8;
    static __bundle_dtb_end: u8;
}

fn console_putchar(byte: u8) {
    // SAFETY: board hook, single-threaded boot context.
    unsafe { board_early_putchar(byte) };
}

/// Map one 1 MiB section in the boot L1 table.
///
/// # Safety
/// `table` must point at the 16 KiB boot table; `virt`/`phys` must be
/// section-aligned.
unsafe fn map_boot_section(table: *mut FirstLevelEntry, virt: u32, phys: u32) {
    unsafe {
        table
            .add(lvl1_index(virt))
            .write_volatile(FirstLevelEntry::section(phys, AccessPermissions::KernelOnly));
    }
}

/// C entry from `_start`. Still at physical addresses, MMU off; the
/// board linker script locates the `.boot` sections at the load address.
#[no_mangle]
#[link_section = ".text.boot"]
pub extern "C" fn boot_start(_r0: u32, _r1: u32, _r2: u32, _load_address: u32) -> ! {
    // SAFETY: single-threaded pre-MMU context; the board hooks are the
    // boot contract.
    unsafe { board_early_console_init() };
    print::set_console(console_putchar);
    kprintln!("booting...");

    let (mut ram_start, mut ram_size) = (0u32, 0u32);
    let (mut bootmem_start, mut bootmem_size) = (0u32, 0u32);
    // SAFETY: out-parameter board hooks.
    unsafe {
        board_early_ram_range(&mut ram_start, &mut ram_size);
        board_early_bootmem_range(&mut bootmem_start, &mut bootmem_size);
    }

    let mut arena = BootMem::new(bootmem_start, bootmem_size);

    // The initial L1 table: 16 KiB, 16 KiB aligned.
    let table_addr = arena.alloc(16 * 1024, 16 * 1024);
    let table = table_addr as usize as *mut FirstLevelEntry;
    // SAFETY: the arena handed us exclusive, in-RAM backing.
    unsafe { core::ptr::write_bytes(table as *mut u8, 0, 16 * 1024) };

    // Map RAM twice: identity (so enabling the MMU does not pull the rug
    // out) and through the physical-memory hole. The hole is bounded by
    // the kernel-image window; RAM beyond it is only reachable once the
    // heap maps it explicitly.
    let hole_size = ram_size.min(areas::KERNEL_IMAGE.len());
    let mapped = round_down(hole_size, SECTION_SIZE);
    kprintln!(
        "RAM {} MiB at {:#x}, hole covers {} MiB",
        ram_size / MIB,
        ram_start,
        mapped / MIB
    );

    let mut offset = 0;
    while offset < mapped {
        let phys = ram_start + offset;
        // SAFETY: table is the boot L1; both addresses are
        // section-aligned.
        unsafe {
            map_boot_section(table, phys, phys);
            map_boot_section(table, areas::HIGHER_HALF_START + offset, phys);
        }
        offset += SECTION_SIZE;
    }

    // A real kernel stack, with the boot parameters on top.
    let stack_size = 64 * 1024;
    let stack_base = arena.alloc(stack_size, 4096);
    let mut stack_top = stack_base + stack_size - 16;

    let to_hole = |phys: u32| phys - ram_start + areas::HIGHER_HALF_START;
    // SAFETY: dtb bundle symbols come from the linker script.
    let (dtb_start, dtb_end) = unsafe {
        (
            core::ptr::addr_of!(__bundle_dtb_start) as u32,
            core::ptr::addr_of!(__bundle_dtb_end) as u32,
        )
    };

    let params = BootParams {
        ram_start,
        ram_size,
        bootmem_start: to_hole(bootmem_start),
        bootmem_size: arena.allocated(),
        device_tree_start: to_hole(dtb_start),
        device_tree_size: dtb_end - dtb_start,
        initrd_start: 0,
        initrd_size: 0,
    };
    stack_top -= core::mem::size_of::<BootParams>() as u32;
    // SAFETY: the stack is arena-backed and unused; alignment is 16.
    unsafe { (stack_top as usize as *mut BootParams).write(params) };

    kprintln!("jumping to the higher half");
    // SAFETY: the table maps the kernel both ways; stack and entry are
    // their higher-half forms.
    unsafe {
        activate_mmu_and_jump(
            table_addr,
            to_hole(stack_top),
            kernel_entry as usize as u32,
        )
    }
}
