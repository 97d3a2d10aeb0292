//! Higher-half kernel bring-up.
//!
//! The pre-MMU boot code (see `arch::arm::boot`) builds the initial
//! translation table, switches the MMU on and jumps here with a
//! [`BootParams`] record sitting at the top of the new kernel stack.
//! From that point everything runs at higher-half addresses.

use log::LevelFilter;

use crate::{
    irq,
    mm::{areas, heap, page_alloc, vm},
    print, process, sched, syscall, timer,
};

/// Handed from the bootloader to the kernel at the top of the initial
/// kernel stack. All addresses are 32-bit virtual addresses in their
/// higher-half form.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootParams {
    pub ram_start: u32,
    pub ram_size: u32,
    pub bootmem_start: u32,
    pub bootmem_size: u32,
    pub device_tree_start: u32,
    pub device_tree_size: u32,
    pub initrd_start: u32,
    pub initrd_size: u32,
}

/// Bump allocator over the boot-memory arena.
///
/// Used with the MMU off to place the initial page table and the kernel
/// stack. There is no free; exhaustion is fatal by design.
pub struct BootMem {
    start: u32,
    end: u32,
    current: u32,
}

impl BootMem {
    pub const fn new(start: u32, size: u32) -> Self {
        Self {
            start,
            end: start + size,
            current: start,
        }
    }

    /// Reserve `size` bytes at the given power-of-two alignment and
    /// return their address.
    pub fn alloc(&mut self, size: u32, alignment: u32) -> u32 {
        let aligned = (self.current + alignment - 1) & !(alignment - 1);
        if aligned + size > self.end {
            panic!("boot memory arena exhausted");
        }
        self.current = aligned + size;
        aligned
    }

    /// Bytes handed out so far.
    pub fn allocated(&self) -> u32 {
        self.current - self.start
    }
}

/// Kernel entry once the MMU is on. Wires every subsystem in dependency
/// order, creates the first process and hands the CPU to the scheduler.
///
/// The board layer has already installed the early console sink and
/// registered its driver singletons (interrupt controller, system timer,
/// RTC) before this runs.
pub fn kernel_main(params: &BootParams) -> ! {
    print::init_logger(LevelFilter::Info);
    log::info!(
        "basalt kernel, {} MiB RAM, boot arena {} KiB",
        params.ram_size / (1024 * 1024),
        params.bootmem_size / 1024
    );

    // Physical memory: the descriptor array goes right above the boot
    // arena (which itself sits above the kernel image). The buddy only
    // manages RAM visible through the physical-memory hole; anything
    // beyond feeds the heap's section pool instead.
    let first_free_phys = params.bootmem_start - areas::HIGHER_HALF_START + params.bootmem_size;
    let hole_covered = params.ram_size.min(areas::KERNEL_IMAGE.len());
    // SAFETY: the boot code mapped `hole_covered` bytes through the hole
    // and nothing above first_free_phys is live yet.
    unsafe { page_alloc::init(hole_covered, first_free_phys) }
        .expect("page allocator init failed");

    vm::init().expect("vm init failed");
    heap::init(params.ram_size).expect("heap init failed");

    let stats = page_alloc::statistics();
    log::debug!(
        "page allocator up: {} free 16 KiB blocks, {} free 4 KiB, {} free 1 KiB",
        stats.free_16k,
        stats.free_4k,
        stats.free_1k
    );

    irq::init().expect("vector table installation failed");
    syscall::init();

    timer::datetime::init();
    if let Err(e) = timer::init() {
        log::warn!("no scheduler tick: {}", e);
    }

    let pid = process::create_first_process("kernel", crate::stage2 as usize as u32)
        .expect("failed to create the first process");
    log::info!("first process ready [{}]", pid);

    crate::arch::irq_enable();
    sched::start();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootmem_alignment_and_exhaustion() {
        let mut arena = BootMem::new(0x10000, 0x1000);
        let a = arena.alloc(16, 16);
        assert_eq!(a, 0x10000);
        let b = arena.alloc(100, 64);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 16);
        assert_eq!(arena.allocated(), b + 100 - 0x10000);
    }

    #[test]
    #[should_panic(expected = "boot memory arena exhausted")]
    fn test_bootmem_panics_when_empty() {
        let mut arena = BootMem::new(0, 64);
        arena.alloc(128, 16);
    }

    #[test]
    fn test_boot_params_layout() {
        // Eight u32 fields, bit-exact with the bootloader's record.
        assert_eq!(core::mem::size_of::<BootParams>(), 32);
    }
}
