//! Contracts between the core kernel and its device drivers.
//!
//! Concrete drivers (UART, GPIO, SD host, virtio, interrupt controllers,
//! system timers) live outside this crate; the core only ever talks to
//! them through these traits. One registry slot exists per singleton role
//! (interrupt controller, system timer, real-time clock), filled by the
//! board layer during bring-up.

use crate::{
    arch::InterruptFrame,
    error::KernelResult,
    sync::OnceLock,
    timer::DateTime,
};

/// Major/minor identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub major: u8,
    pub minor: u8,
}

/// Character or block flavour of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Byte-stream device; offsets are ignored.
    Character,
    /// Random-access device; offsets are in units of the block size.
    Block,
}

/// A hardware device as seen by the core.
pub trait Device: Send + Sync {
    fn id(&self) -> DeviceId;
    fn name(&self) -> &str;
    fn class(&self) -> DeviceClass;

    /// Bring the hardware up. Drivers implement a bounded retry loop with
    /// timeout internally; a returned error is final.
    fn init(&self) -> KernelResult<()>;

    fn shutdown(&self) -> KernelResult<()>;

    /// Read into `buf` at `offset`; character devices ignore the offset.
    /// Returns the number of bytes read.
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;

    /// Write `buf` at `offset`; character devices ignore the offset.
    /// Returns the number of bytes written.
    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize>;

    /// Device-specific control.
    fn ioctl(&self, request: u32, arg: u32) -> KernelResult<u32>;
}

/// IRQ handler: invoked with the trapped frame and the argument it was
/// registered with. Runs with IRQs disabled and must not block.
pub type IrqHandler = fn(&mut InterruptFrame, usize);

/// The board's interrupt controller.
pub trait InterruptController: Send + Sync {
    fn mask(&self, irq: u32);
    fn unmask(&self, irq: u32);

    /// Register `handler` for `irq`. The controller invokes it from
    /// [`InterruptController::dispatch`] whenever the line is pending.
    fn install(&self, irq: u32, handler: IrqHandler, arg: usize) -> KernelResult<()>;

    /// Read the pending registers and invoke the handler of every asserted
    /// IRQ. Called from the IRQ exception path.
    fn dispatch(&self, frame: &mut InterruptFrame);
}

/// Callback fired by the system timer; receives the trapped frame and the
/// registered argument.
pub type TimerTickHandler = fn(&mut InterruptFrame, usize);

/// The board's tick source.
pub trait SystemTimer: Send + Sync {
    /// Free-running counter value.
    fn ticks(&self) -> u64;

    /// Counter increments per millisecond.
    fn ticks_per_ms(&self) -> u64;

    /// Arrange for `handler` to fire every `period` ticks.
    fn start(&self, period: u64, handler: TimerTickHandler, arg: usize) -> KernelResult<()>;
}

/// Battery-backed wall clock, if the board has one.
pub trait RealTimeClock: Send + Sync {
    fn get_time(&self) -> KernelResult<DateTime>;
    fn set_time(&self, dt: &DateTime) -> KernelResult<()>;
}

static INTERRUPT_CONTROLLER: OnceLock<&'static dyn InterruptController> = OnceLock::new();
static SYSTEM_TIMER: OnceLock<&'static dyn SystemTimer> = OnceLock::new();
static REAL_TIME_CLOCK: OnceLock<&'static dyn RealTimeClock> = OnceLock::new();

/// Register the board's interrupt controller. One per boot.
pub fn register_interrupt_controller(ic: &'static dyn InterruptController) {
    if INTERRUPT_CONTROLLER.set(ic).is_err() {
        panic!("interrupt controller registered twice");
    }
}

/// Register the board's system timer. One per boot.
pub fn register_system_timer(timer: &'static dyn SystemTimer) {
    if SYSTEM_TIMER.set(timer).is_err() {
        panic!("system timer registered twice");
    }
}

/// Register the board's real-time clock. One per boot.
pub fn register_real_time_clock(rtc: &'static dyn RealTimeClock) {
    if REAL_TIME_CLOCK.set(rtc).is_err() {
        panic!("real-time clock registered twice");
    }
}

pub fn interrupt_controller() -> Option<&'static dyn InterruptController> {
    INTERRUPT_CONTROLLER.get().copied()
}

pub fn system_timer() -> Option<&'static dyn SystemTimer> {
    SYSTEM_TIMER.get().copied()
}

pub fn real_time_clock() -> Option<&'static dyn RealTimeClock> {
    REAL_TIME_CLOCK.get().copied()
}
