//! Interrupt and exception dispatch.
//!
//! The assembly vector stubs save the trapping register set as an
//! [`InterruptFrame`] on the current thread's kernel stack and call
//! [`irq_and_exception_handler`] with the vector offset. From there:
//! software interrupts route to the installed SWI service (the syscall
//! dispatcher registers itself at `svc #0x10`), IRQs fan out through the
//! interrupt controller driver, and aborts go through the page-fault
//! triage. Everything else is fatal.

use spin::Mutex;

use crate::{
    arch::{self, InterruptFrame},
    drivers, kprintln,
    mm::{
        page_alloc::{self, PageOrder},
        vm::{self, PageFaultOutcome},
    },
    sched,
    sync::IrqGuard,
};

/// Exception vectors, by table offset / 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vector {
    Reset = 0,
    UndefinedInstruction = 1,
    SoftwareInterrupt = 2,
    PrefetchAbort = 3,
    DataAbort = 4,
    Unused = 5,
    Irq = 6,
    Fiq = 7,
}

impl Vector {
    fn from_offset(offset: u32) -> Option<Self> {
        Some(match offset / 4 {
            0 => Self::Reset,
            1 => Self::UndefinedInstruction,
            2 => Self::SoftwareInterrupt,
            3 => Self::PrefetchAbort,
            4 => Self::DataAbort,
            5 => Self::Unused,
            6 => Self::Irq,
            7 => Self::Fiq,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::Reset => "RESET",
            Self::UndefinedInstruction => "UNDEFINED INSTRUCTION",
            Self::SoftwareInterrupt => "SOFTWARE INTERRUPT",
            Self::PrefetchAbort => "PREFETCH ABORT",
            Self::DataAbort => "DATA ABORT",
            Self::Unused => "UNUSED",
            Self::Irq => "IRQ",
            Self::Fiq => "FIQ",
        }
    }
}

/// SWI service handler, selected by the instruction's immediate field.
pub type SwiHandler = fn(&mut InterruptFrame);

const MAX_SWI_SERVICES: usize = 256;

static SWI_HANDLERS: Mutex<[Option<SwiHandler>; MAX_SWI_SERVICES]> =
    Mutex::new([None; MAX_SWI_SERVICES]);

/// Register the handler for one SWI immediate. Double installation is a
/// kernel bug.
pub fn install_swi_handler(swi_number: u32, handler: SwiHandler) {
    let _irq = IrqGuard::new();
    let mut handlers = SWI_HANDLERS.lock();
    let slot = &mut handlers[swi_number as usize % MAX_SWI_SERVICES];
    assert!(
        slot.is_none(),
        "SWI handler {} installed twice",
        swi_number
    );
    *slot = Some(handler);
}

/// Copy the vector table to virtual address 0.
///
/// The backing page is mapped kernel-only into the canonical table; every
/// address space inherits the mapping through its first L1 slot.
pub fn init() -> crate::error::KernelResult<()> {
    let page = page_alloc::alloc(PageOrder::FourKib)?;
    let image = arch::vector_table_image();

    let dst = page.addr().to_virt().as_mut_ptr::<u8>();
    // SAFETY: the fresh page is visible through the physical-memory hole
    // and the image fits well inside 4 KiB.
    unsafe { core::ptr::copy_nonoverlapping(image.as_ptr(), dst, image.len()) };

    vm::map_vector_page(page)?;
    page_alloc::free(page, PageOrder::FourKib);
    Ok(())
}

/// C-level dispatcher, called from the assembly vector stubs.
///
/// # Safety
/// `frame` must point at the InterruptFrame the stub just built; only the
/// assembly entry path may call this.
#[no_mangle]
pub unsafe extern "C" fn irq_and_exception_handler(vector_offset: u32, frame: *mut InterruptFrame) {
    // SAFETY: per the contract above, the frame is live for the whole
    // dispatch.
    let frame = unsafe { &mut *frame };

    let Some(vector) = Vector::from_offset(vector_offset) else {
        panic!("unexpected vector offset {:#x}", vector_offset);
    };

    match vector {
        Vector::SoftwareInterrupt => software_interrupt(frame),
        Vector::Irq => irq(frame),
        Vector::DataAbort => abort(frame, arch::read_fault_address(), "data abort"),
        Vector::PrefetchAbort => abort(frame, frame.lr, "prefetch abort"),
        Vector::UndefinedInstruction | Vector::Reset | Vector::Unused | Vector::Fiq => {
            fatal_dump(vector.name(), frame, frame.lr);
        }
    }
}

fn software_interrupt(frame: &mut InterruptFrame) {
    // The stub saved lr pointing just past the trapping instruction; its
    // low bits carry the service immediate.
    let insn_addr = frame.lr.wrapping_sub(4);
    // SAFETY: the instruction was just executed, so it is mapped.
    let insn = unsafe { (insn_addr as usize as *const u32).read_volatile() };
    let swi_number = (insn & 0x00FF_FFFF) as usize % MAX_SWI_SERVICES;

    let handler = SWI_HANDLERS.lock()[swi_number];
    match handler {
        Some(handler) => handler(frame),
        None => log::warn!("unknown software interrupt {}", swi_number),
    }
}

fn irq(frame: &mut InterruptFrame) {
    match drivers::interrupt_controller() {
        Some(controller) => controller.dispatch(frame),
        None => log::warn!("IRQ with no interrupt controller registered"),
    }
}

/// Exit code recorded for a process killed by a fault.
const FAULT_EXIT_CODE: i32 = 139;

fn abort(frame: &mut InterruptFrame, fault_addr: u32, kind: &'static str) {
    match vm::try_fix_page_fault(fault_addr) {
        PageFaultOutcome::Fixed => {
            log::debug!("{} at 0x{:08x} repaired from the kernel table", kind, fault_addr);
        }
        PageFaultOutcome::ProcessFatal => {
            let pid = sched::current_pid();
            log::error!(
                "{}: process {:?} killed, {} at 0x{:08x} (insn 0x{:08x})",
                kind,
                pid.map(|p| p.0),
                arch::fault_status_name(arch::read_fault_status()),
                fault_addr,
                frame.lr
            );
            if let Some(pid) = pid {
                let _ = crate::process::with_process(pid, |p| p.exit_code = FAULT_EXIT_CODE);
            }
            // The frame is abandoned; the next context switch never
            // returns here.
            sched::exit_current_thread();
        }
        PageFaultOutcome::KernelFatal => {
            fatal_dump(kind, frame, fault_addr);
        }
    }
}

fn fatal_dump(reason: &str, frame: &InterruptFrame, fault_addr: u32) -> ! {
    kprintln!("[{}] at instruction 0x{:08x}", reason, frame.lr);
    kprintln!("fault address: 0x{:08x}", fault_addr);
    kprintln!(
        " r0: {:08x}  r1: {:08x}  r2: {:08x}  r3: {:08x}",
        frame.r[0],
        frame.r[1],
        frame.r[2],
        frame.r[3]
    );
    kprintln!(
        " r4: {:08x}  r5: {:08x}  r6: {:08x}  r7: {:08x}",
        frame.r[4],
        frame.r[5],
        frame.r[6],
        frame.r[7]
    );
    kprintln!(
        " r8: {:08x}  r9: {:08x} r10: {:08x} r11: {:08x}",
        frame.r[8],
        frame.r[9],
        frame.r[10],
        frame.r[11]
    );
    kprintln!(
        "r12: {:08x}  sp: {:08x}  lr: {:08x} spsr: {:08x}",
        frame.r[12],
        frame.user_sp,
        frame.user_lr,
        frame.spsr
    );
    panic!("{} at 0x{:08x}", reason, fault_addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_decoding() {
        assert_eq!(Vector::from_offset(0x08), Some(Vector::SoftwareInterrupt));
        assert_eq!(Vector::from_offset(0x10), Some(Vector::DataAbort));
        assert_eq!(Vector::from_offset(0x18), Some(Vector::Irq));
        assert_eq!(Vector::from_offset(0x40), None);
    }
}
