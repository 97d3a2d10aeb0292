//! Locking primitives.
//!
//! Four tiers, from cheapest to heaviest:
//!
//! * [`IrqGuard`]: scoped IRQ-disable; mutual exclusion against interrupt
//!   handlers on this CPU. The only primitive IRQ handlers themselves may
//!   rely on.
//! * `spin::Mutex` (from the `spin` crate, used directly throughout the
//!   kernel): short non-yielding critical sections over plain data.
//! * [`Spinlock`]: a single word acquired with an atomic swap; contended
//!   takers yield to the scheduler instead of burning their quantum.
//! * [`Mutex`]: built on [`Spinlock`], adds a timed take. Releasable from
//!   another context (IRQ handlers release mutexes to wake blocked
//!   threads), which is why these are explicit take/release rather than
//!   guard-scoped.

pub mod once_lock;

pub use once_lock::{GlobalState, OnceLock};

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch,
    error::{KernelError, KernelResult},
    sched, timer,
};

/// Scoped IRQ-disable. Disables IRQs at construction and restores the
/// previous state on drop, so nesting is safe.
pub struct IrqGuard {
    were_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let were_enabled = arch::irqs_enabled();
        arch::irq_disable();
        Self { were_enabled }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::irq_enable();
        }
    }
}

/// Yield if the scheduler is running, otherwise just relax the CPU.
fn yield_or_relax() {
    if sched::has_started() {
        sched::yield_now();
    } else {
        arch::cpu_relax();
    }
}

/// A single-word lock. Contended takers yield.
pub struct Spinlock {
    word: AtomicU32,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    /// Attempt the atomic-swap acquire once.
    pub fn try_take(&self) -> bool {
        self.word.swap(1, Ordering::Acquire) == 0
    }

    /// Acquire, yielding to the scheduler while the word is held.
    pub fn take(&self) {
        while !self.try_take() {
            yield_or_relax();
        }
    }

    pub fn release(&self) {
        self.word.store(0, Ordering::Release);
    }

    pub fn is_taken(&self) -> bool {
        self.word.load(Ordering::Relaxed) != 0
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Initial ownership of a freshly created [`Mutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexInitialState {
    Unlocked,
    Locked,
}

/// Yielding mutex with a timed take.
pub struct Mutex {
    lock: Spinlock,
}

impl Mutex {
    pub const fn new(state: MutexInitialState) -> Self {
        let word = match state {
            MutexInitialState::Unlocked => 0,
            MutexInitialState::Locked => 1,
        };
        Self {
            lock: Spinlock {
                word: AtomicU32::new(word),
            },
        }
    }

    /// Acquire, yielding until the lock is free.
    pub fn take(&self) {
        self.lock.take();
    }

    pub fn try_take(&self) -> bool {
        self.lock.try_take()
    }

    /// Acquire with a deadline. On timeout the lock is left unowned by the
    /// caller and [`KernelError::Timeout`] is returned.
    pub fn take_timeout(&self, timeout_ms: u32) -> KernelResult<()> {
        let deadline = timer::uptime_ms().saturating_add(timeout_ms as u64);
        loop {
            if self.lock.try_take() {
                return Ok(());
            }
            if timer::uptime_ms() >= deadline {
                return Err(KernelError::Timeout {
                    operation: "mutex take",
                });
            }
            yield_or_relax();
        }
    }

    pub fn release(&self) {
        self.lock.release();
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_taken()
    }
}

/// Owner sentinel for an unheld [`ReentrantSpinlock`]. PIDs start at 1.
const NO_OWNER: u32 = 0;
/// Owner id used before the first process exists.
const BOOT_OWNER: u32 = u32::MAX - 1;

fn current_owner_id() -> u32 {
    sched::current_pid().map(|pid| pid.0).unwrap_or(BOOT_OWNER)
}

/// Spinlock that the owning process may re-enter; a depth count tracks
/// nesting and the lock is released when the outermost take is undone.
pub struct ReentrantSpinlock {
    inner: Spinlock,
    owner: AtomicU32,
    depth: AtomicU32,
}

impl ReentrantSpinlock {
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new(),
            owner: AtomicU32::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    pub fn take(&self) {
        let myself = current_owner_id();
        if self.depth.load(Ordering::Relaxed) > 0 && self.owner.load(Ordering::Relaxed) == myself {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.inner.take();
        self.owner.store(myself, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    pub fn release(&self) {
        let myself = current_owner_id();
        assert_eq!(
            self.owner.load(Ordering::Relaxed),
            myself,
            "reentrant spinlock released by non-owner"
        );
        let depth = self.depth.fetch_sub(1, Ordering::Relaxed);
        assert!(depth > 0, "reentrant spinlock released when not taken");
        if depth == 1 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            self.inner.release();
        }
    }

    pub fn is_taken(&self) -> bool {
        self.depth.load(Ordering::Relaxed) > 0
    }
}

impl Default for ReentrantSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spinlock_take_release() {
        let lock = Spinlock::new();
        assert!(!lock.is_taken());
        assert!(lock.try_take());
        assert!(lock.is_taken());
        assert!(!lock.try_take());
        lock.release();
        assert!(!lock.is_taken());
    }

    #[test]
    fn test_mutex_initial_states() {
        let unlocked = Mutex::new(MutexInitialState::Unlocked);
        assert!(!unlocked.is_locked());
        let locked = Mutex::new(MutexInitialState::Locked);
        assert!(locked.is_locked());
        assert!(!locked.try_take());
    }

    #[test]
    fn test_mutex_timed_take_times_out() {
        let mutex = Mutex::new(MutexInitialState::Locked);
        let result = mutex.take_timeout(0);
        assert_eq!(
            result,
            Err(KernelError::Timeout {
                operation: "mutex take"
            })
        );
        // Lock stays with its original owner.
        assert!(mutex.is_locked());
    }

    #[test]
    fn test_mutex_timed_take_succeeds_when_free() {
        let mutex = Mutex::new(MutexInitialState::Unlocked);
        assert!(mutex.take_timeout(10).is_ok());
        assert!(mutex.is_locked());
    }

    #[test]
    fn test_reentrant_lock_nests() {
        let lock = ReentrantSpinlock::new();
        lock.take();
        lock.take();
        assert!(lock.is_taken());
        lock.release();
        assert!(lock.is_taken());
        lock.release();
        assert!(!lock.is_taken());
    }

    #[test]
    fn test_irq_guard_nesting() {
        // Host stand-ins make these no-ops; this checks drop order compiles
        // and the guard is usable in nested scopes.
        let outer = IrqGuard::new();
        {
            let _inner = IrqGuard::new();
        }
        drop(outer);
    }
}
