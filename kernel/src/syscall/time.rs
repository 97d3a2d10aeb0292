//! Time-family syscall handlers.

use crate::{
    error::KernelResult,
    sync::{Mutex, MutexInitialState},
    syscall::userptr,
    timer::{self, datetime},
};

pub fn sys_get_datetime(out: u32) -> KernelResult<u32> {
    let now = datetime::read();
    userptr::write_struct(out, &now)?;
    Ok(0)
}

fn open_sleep_gate(arg: usize) {
    // SAFETY: the sleeping thread is parked in `take()` below until this
    // release, so the gate on its stack is still live.
    unsafe { &*(arg as *const Mutex) }.release();
}

/// Timer-backed suspend; unconditional until the timer fires.
pub fn sys_millisleep(ms: u32) -> KernelResult<u32> {
    if ms == 0 {
        return Ok(0);
    }

    // A gate the timer opens: born locked, released by the one-shot
    // callback, taken (yielding) here.
    let gate = Mutex::new(MutexInitialState::Locked);
    timer::exec_after(ms as u64, open_sleep_gate, &gate as *const Mutex as usize);
    gate.take();
    Ok(0)
}

/// Milliseconds since boot.
pub fn sys_get_ticks() -> KernelResult<u32> {
    Ok(timer::uptime_ms() as u32)
}
