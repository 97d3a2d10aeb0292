//! Kernel timers and the scheduler tick.
//!
//! The board's [`SystemTimer`](crate::drivers::SystemTimer) driver fires a
//! periodic interrupt (5 ms default). On every tick the kernel timer list
//! is walked: one-shot entries fire once and are removed, periodic
//! entries fire and re-arm. The tick doubles as the scheduler quantum;
//! preemption runs last so expired timers get serviced first.

pub mod datetime;

pub use datetime::DateTime;

use alloc::vec::Vec;

use spin::Mutex;

use crate::{
    arch::InterruptFrame,
    drivers,
    error::{KernelError, KernelResult},
    sched,
    sync::IrqGuard,
};

/// Scheduler quantum in milliseconds.
pub const SCHEDULER_TICK_MS: u64 = 5;

/// Callback invoked when a kernel timer elapses; receives the argument it
/// was registered with. Runs in IRQ context and must not block.
pub type TimerCallback = fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    OneShot,
    Periodic,
}

struct KernelTimer {
    mode: TimerMode,
    callback: TimerCallback,
    arg: usize,
    /// Tick count when the timer was (re-)armed.
    armed_at: u64,
    /// Ticks until expiry.
    period: u64,
}

/// Most timers fired on one tick.
const MAX_FIRED_PER_TICK: usize = 16;

fn noop_callback(_arg: usize) {}

/// Fixed-size batch of due callbacks, handed out of the list lock.
struct FiredBatch {
    entries: [(TimerCallback, usize); MAX_FIRED_PER_TICK],
    count: usize,
}

impl Default for FiredBatch {
    fn default() -> Self {
        Self {
            entries: [(noop_callback as TimerCallback, 0); MAX_FIRED_PER_TICK],
            count: 0,
        }
    }
}

impl FiredBatch {
    fn is_full(&self) -> bool {
        self.count == MAX_FIRED_PER_TICK
    }

    fn push(&mut self, callback: TimerCallback, arg: usize) {
        self.entries[self.count] = (callback, arg);
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }

    fn iter(&self) -> impl Iterator<Item = &(TimerCallback, usize)> {
        self.entries.iter().take(self.count)
    }
}

/// The pending kernel timers. Walked on every tick; entries fire in
/// insertion order.
pub(crate) struct TimerList {
    timers: Vec<KernelTimer>,
}

impl TimerList {
    const fn new() -> Self {
        Self { timers: Vec::new() }
    }

    fn schedule(&mut self, mode: TimerMode, now: u64, period: u64, cb: TimerCallback, arg: usize) {
        self.timers.push(KernelTimer {
            mode,
            callback: cb,
            arg,
            armed_at: now,
            period,
        });
    }

    /// Collect the callbacks of every elapsed timer, removing one-shots
    /// and re-arming periodic entries. Callbacks are returned rather than
    /// invoked so the caller can drop the list lock first; the buffer is
    /// fixed-size because this runs in IRQ context, where the kernel heap
    /// is off limits. Timers past the batch fire on the next tick.
    fn expire(&mut self, now: u64) -> FiredBatch {
        let mut due = FiredBatch::default();
        self.timers.retain_mut(|timer| {
            if timer.armed_at + timer.period > now || due.is_full() {
                return true;
            }
            due.push(timer.callback, timer.arg);
            match timer.mode {
                TimerMode::OneShot => false,
                TimerMode::Periodic => {
                    timer.armed_at = now;
                    true
                }
            }
        });
        due
    }

    fn pending(&self) -> usize {
        self.timers.len()
    }
}

static TIMERS: Mutex<TimerList> = Mutex::new(TimerList::new());

fn with_timers<R>(f: impl FnOnce(&mut TimerList) -> R) -> R {
    let _irq = IrqGuard::new();
    f(&mut TIMERS.lock())
}

/// Raw tick count since boot; 0 before the timer driver is registered.
pub fn ticks() -> u64 {
    drivers::system_timer().map_or(0, |t| t.ticks())
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    match drivers::system_timer() {
        Some(t) => t.ticks() / t.ticks_per_ms(),
        None => 0,
    }
}

/// Start the periodic tick on the board's system timer.
pub fn init() -> KernelResult<()> {
    let timer = drivers::system_timer().ok_or(KernelError::NotInitialized {
        subsystem: "system timer",
    })?;
    timer.start(SCHEDULER_TICK_MS * timer.ticks_per_ms(), tick, 0)
}

/// The periodic tick handler: fire elapsed kernel timers, then give the
/// scheduler its preemption point.
fn tick(_frame: &mut InterruptFrame, _arg: usize) {
    let now = ticks();
    let due = with_timers(|timers| timers.expire(now));
    for &(callback, arg) in due.iter() {
        callback(arg);
    }
    sched::preempt();
}

fn ms_to_ticks(ms: u64) -> u64 {
    let per_ms = drivers::system_timer().map_or(1, |t| t.ticks_per_ms());
    ms * per_ms
}

/// Run `callback(arg)` once, `ms` milliseconds from now.
pub fn exec_after(ms: u64, callback: TimerCallback, arg: usize) {
    let now = ticks();
    with_timers(|timers| {
        timers.schedule(TimerMode::OneShot, now, ms_to_ticks(ms), callback, arg)
    });
}

/// Run `callback(arg)` every `ms` milliseconds until the kernel halts.
pub fn exec_periodic(ms: u64, callback: TimerCallback, arg: usize) {
    let now = ticks();
    with_timers(|timers| {
        timers.schedule(TimerMode::Periodic, now, ms_to_ticks(ms), callback, arg)
    });
}

/// Number of pending kernel timers, for diagnostics.
pub fn pending_timers() -> usize {
    with_timers(|timers| timers.pending())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_fire(arg: usize) {
        FIRED.fetch_add(arg, Ordering::Relaxed);
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut list = TimerList::new();
        list.schedule(TimerMode::OneShot, 0, 100, count_fire, 1);

        assert_eq!(list.expire(99).len(), 0);
        assert_eq!(list.pending(), 1);

        let due = list.expire(100);
        assert_eq!(due.len(), 1);
        assert_eq!(list.pending(), 0);

        assert_eq!(list.expire(500).len(), 0);
    }

    #[test]
    fn test_periodic_rearms() {
        let mut list = TimerList::new();
        list.schedule(TimerMode::Periodic, 0, 50, count_fire, 1);

        assert_eq!(list.expire(50).len(), 1);
        assert_eq!(list.pending(), 1);
        // Re-armed at 50, so not due again until 100.
        assert_eq!(list.expire(80).len(), 0);
        assert_eq!(list.expire(100).len(), 1);
    }

    #[test]
    fn test_mixed_timers_fire_independently() {
        let mut list = TimerList::new();
        list.schedule(TimerMode::OneShot, 0, 10, count_fire, 1);
        list.schedule(TimerMode::Periodic, 0, 20, count_fire, 2);

        let due = list.expire(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due.entries[0].1, 1);

        let due = list.expire(20);
        assert_eq!(due.len(), 1);
        assert_eq!(due.entries[0].1, 2);
        assert_eq!(list.pending(), 1);
    }

    #[test]
    fn test_returned_callbacks_are_invocable() {
        FIRED.store(0, Ordering::Relaxed);
        let mut list = TimerList::new();
        list.schedule(TimerMode::OneShot, 0, 1, count_fire, 5);
        for &(cb, arg) in list.expire(1).iter() {
            cb(arg);
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_fired_batch_caps_per_tick() {
        let mut list = TimerList::new();
        for _ in 0..MAX_FIRED_PER_TICK + 4 {
            list.schedule(TimerMode::OneShot, 0, 1, count_fire, 1);
        }
        let due = list.expire(1);
        assert_eq!(due.len(), MAX_FIRED_PER_TICK);
        // The overflow stays armed for the next tick.
        assert_eq!(list.pending(), 4);
        assert_eq!(list.expire(2).len(), 4);
    }
}
