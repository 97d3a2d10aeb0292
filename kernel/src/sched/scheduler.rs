//! The scheduler coroutine and context-switch orchestration.
//!
//! One run queue: the global thread table, walked round-robin. On every
//! pass the scheduler reaps Zombies (kernel stack freed, slot emptied,
//! the owning process collapsed when its last thread goes), skips
//! Suspended threads and switches into each Runnable one in turn.
//!
//! The scheduler runs as a coroutine on the boot kernel stack. A thread
//! enters it by context-switching to the scheduler's saved context
//! (voluntary yield, or the preemption tick at the end of a quantum);
//! the scheduler enters a thread by switching to the thread's saved
//! kernel stack pointer.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::{
    arch, mm::vm, process,
    process::Pid,
    sched::thread::{self, ThreadState, Tid, MAX_THREADS},
};

/// TID of the thread currently on the CPU; 0 while the scheduler
/// coroutine itself runs.
static CURRENT_TID: AtomicU32 = AtomicU32::new(0);

static STARTED: AtomicBool = AtomicBool::new(false);

/// The scheduler coroutine's saved stack pointer while a thread runs.
struct SchedulerContext(UnsafeCell<*mut u8>);

// SAFETY: written only by the context-switch discipline on the single CPU
// with IRQs disabled around every access.
unsafe impl Sync for SchedulerContext {}

static SCHEDULER_SP: SchedulerContext = SchedulerContext(UnsafeCell::new(core::ptr::null_mut()));

/// Whether the scheduler loop has taken over the CPU.
pub fn has_started() -> bool {
    STARTED.load(Ordering::Relaxed)
}

/// TID of the running thread, `None` in scheduler or early-boot context.
pub fn current_tid() -> Option<Tid> {
    match CURRENT_TID.load(Ordering::Relaxed) {
        0 => None,
        tid => Some(Tid(tid)),
    }
}

/// PID of the running thread's process.
pub fn current_pid() -> Option<Pid> {
    let tid = current_tid()?;
    thread::with_thread(tid, |t| t.pid).ok()
}

/// Voluntarily re-enter the scheduler. Returns when this thread is next
/// selected.
pub fn yield_now() {
    if !has_started() {
        return;
    }
    // Clear "current" before switching away: once the scheduler owns the
    // CPU again, a preemption tick must see no running thread.
    let tid = Tid(match CURRENT_TID.swap(0, Ordering::Relaxed) {
        0 => return, // already in scheduler context
        tid => tid,
    });

    arch::irq_disable();
    let from_slot = thread::with_thread(tid, |t| {
        core::ptr::addr_of_mut!(t.saved_sp)
    })
    .expect("current thread vanished");
    // SAFETY: from_slot points into the boxed thread record (stable
    // address); the scheduler's saved sp was stored by the switch that
    // started this thread. IRQs are disabled; the switch re-enables them.
    unsafe {
        let to = *SCHEDULER_SP.0.get();
        arch::context_switch(from_slot, to);
    }
}

/// Preemption point, invoked from the timer IRQ at the end of a quantum.
pub fn preempt() {
    if has_started() && current_tid().is_some() {
        yield_now();
    }
}

/// Mark the calling thread Zombie and leave the CPU for good.
pub fn exit_current_thread() -> ! {
    let tid = current_tid().expect("exit without a current thread");
    thread::set_thread_state(tid, ThreadState::Zombie).expect("cannot zombify current thread");
    yield_now();
    unreachable!("zombie thread was rescheduled");
}

enum WalkAction {
    Nothing,
    Reap(Tid),
    Run(Tid),
}

/// The scheduler main loop. Called once at the end of bring-up, with the
/// first process created; never returns.
pub fn start() -> ! {
    STARTED.store(true, Ordering::Relaxed);
    CURRENT_TID.store(0, Ordering::Relaxed);

    loop {
        let mut ran_anything = false;

        for slot_idx in 0..MAX_THREADS {
            let action = thread::with_table(|table| match table.slots[slot_idx].as_ref() {
                None => WalkAction::Nothing,
                Some(t) => match t.state {
                    ThreadState::Zombie => WalkAction::Reap(t.tid),
                    ThreadState::Suspended => WalkAction::Nothing,
                    ThreadState::Runnable => WalkAction::Run(t.tid),
                },
            });

            match action {
                WalkAction::Nothing => {}
                WalkAction::Reap(tid) => reap(tid),
                WalkAction::Run(tid) => {
                    ran_anything = true;
                    run_thread(tid);
                }
            }
        }

        if !ran_anything {
            // Everything is suspended; sleep until an interrupt changes
            // that.
            arch::wait_for_interrupt();
        }
    }
}

/// Free a zombie's resources and notify its process.
fn reap(tid: Tid) {
    let Some(dead) = thread::with_table(|table| table.remove(tid)) else {
        return;
    };
    log::debug!("reaping thread {} of process {}", dead.tid.0, dead.pid.0);
    crate::mm::page_alloc::free(dead.kernel_stack, crate::mm::PageOrder::FourKib);
    process::on_thread_reaped(dead.pid, dead.tid);
}

/// Switch the CPU over to `tid` until it yields back.
fn run_thread(tid: Tid) {
    arch::irq_disable();

    let Ok((space, to_sp)) = thread::with_thread(tid, |t| (t.pid, t.saved_sp))
        .and_then(|(pid, sp)| {
            process::address_space_of(pid).map(|space| (space, sp))
        })
    else {
        arch::irq_enable();
        return;
    };

    vm::switch_address_space(&space);
    CURRENT_TID.store(tid.0, Ordering::Relaxed);

    // SAFETY: to_sp was saved by the thread's last switch-out (or by the
    // initial stack builder); the slot is the scheduler's own. IRQs are
    // off and the switch re-enables them inside the thread.
    unsafe {
        arch::context_switch(SCHEDULER_SP.0.get(), to_sp);
    }
    // Back in the scheduler: the thread yielded, slept or exited.
}
