//! Threads and the global thread table.
//!
//! Thread records live in a fixed-size global table indexed by TID, and
//! processes refer to their threads by TID; nothing follows pointers
//! between the two, which keeps the process/thread graph acyclic.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::{
    arch::{self, InterruptFrame},
    error::{KernelError, KernelResult},
    mm::{
        page_alloc::{self, PageHandle, PageOrder},
    },
    process::Pid,
    sync::IrqGuard,
};

/// Upper bound on live threads.
pub const MAX_THREADS: usize = 64;

/// Globally unique thread identifier. TIDs start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u32);

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

fn alloc_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to run.
    Runnable,
    /// Waiting for an explicit wake-up (sleep, waitexit, blocked I/O).
    Suspended,
    /// Exited; resources reclaimed at the next scheduler walk.
    Zombie,
}

impl ThreadState {
    /// Legal transitions: Runnable <-> Suspended, Runnable -> Zombie, and
    /// identity no-ops. A Zombie never comes back.
    pub fn can_transition(self, to: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, to),
            (Runnable, Suspended) | (Suspended, Runnable) | (Runnable, Zombie)
        ) || self == to
    }
}

/// One kernel thread.
///
/// While the thread is not running, its complete machine state is
/// reachable through `saved_sp` (kernel-side registers) and `iframe`
/// (user-side registers), both living on its kernel stack.
pub struct Thread {
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    pub state: ThreadState,
    /// 4 KiB kernel stack page.
    pub kernel_stack: PageHandle,
    /// Saved context-switch frame; valid whenever the thread is not
    /// currently running.
    pub saved_sp: *mut u8,
    /// The interrupt frame at the top of the kernel stack.
    pub iframe: *mut InterruptFrame,
}

// SAFETY: thread records are only touched on the single CPU under the
// table lock (or by the one context executing the thread itself).
unsafe impl Send for Thread {}

/// The global thread table. Slots are scanned round-robin by the
/// scheduler.
pub struct ThreadTable {
    pub(crate) slots: [Option<Box<Thread>>; MAX_THREADS],
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_THREADS],
        }
    }

    pub fn insert(&mut self, thread: Box<Thread>) -> KernelResult<()> {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(thread);
                return Ok(());
            }
        }
        Err(KernelError::ResourceExhausted {
            resource: "thread table",
        })
    }

    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.slots
            .iter_mut()
            .flatten()
            .map(|boxed| &mut **boxed)
            .find(|t| t.tid == tid)
    }

    pub fn remove(&mut self, tid: Tid) -> Option<Box<Thread>> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|t| t.tid == tid) {
                return slot.take();
            }
        }
        None
    }

    /// Validated state change.
    pub fn set_state(&mut self, tid: Tid, state: ThreadState) -> KernelResult<()> {
        let thread = self.get_mut(tid).ok_or(KernelError::ThreadNotFound { tid: tid.0 })?;
        if !thread.state.can_transition(state) {
            return Err(KernelError::InvalidArgument { name: "thread state" });
        }
        thread.state = state;
        Ok(())
    }
}

static THREADS: Mutex<ThreadTable> = Mutex::new(ThreadTable::new());

/// Run `f` on the locked table, IRQs masked (IRQ handlers wake threads
/// through this same lock).
pub(crate) fn with_table<R>(f: impl FnOnce(&mut ThreadTable) -> R) -> R {
    let _irq = IrqGuard::new();
    f(&mut THREADS.lock())
}

/// Create a thread with a fresh kernel stack, Suspended until someone
/// marks it Runnable.
///
/// The initial frames are arranged so the first context switch into the
/// thread "returns" to `entry` with `user_sp` as its stack pointer.
pub fn create(pid: Pid, entry: u32, user_sp: u32, privileged: bool) -> KernelResult<Tid> {
    let stack_page = page_alloc::alloc(PageOrder::FourKib)?;
    let stack_top = stack_page.addr().to_virt().as_u32() + PageOrder::FourKib.size()
        - crate::arch::STACK_ALIGNMENT;

    // SAFETY: the page was just allocated and is mapped through the
    // physical-memory hole; both frames fit far below the 4 KiB top.
    let (saved_sp, iframe) = unsafe {
        arch::build_initial_kernel_stack(
            stack_top as usize as *mut u8,
            user_sp,
            entry,
            arch::thread_start_trampoline(),
            privileged,
        )
    };

    let tid = alloc_tid();
    let thread = Box::new(Thread {
        tid,
        pid,
        state: ThreadState::Suspended,
        kernel_stack: stack_page,
        saved_sp,
        iframe,
    });

    if let Err(e) = with_table(|table| table.insert(thread)) {
        page_alloc::free(stack_page, PageOrder::FourKib);
        return Err(e);
    }
    Ok(tid)
}

/// Run `f` on one thread's record.
pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> KernelResult<R> {
    with_table(|table| {
        table
            .get_mut(tid)
            .map(f)
            .ok_or(KernelError::ThreadNotFound { tid: tid.0 })
    })
}

/// Validated state change on the global table.
pub fn set_thread_state(tid: Tid, state: ThreadState) -> KernelResult<()> {
    with_table(|table| table.set_state(tid, state))
}

/// Current state of a thread, if it exists.
pub fn state_of(tid: Tid) -> Option<ThreadState> {
    with_table(|table| table.get_mut(tid).map(|t| t.state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_thread(tid: u32) -> Box<Thread> {
        Box::new(Thread {
            tid: Tid(tid),
            pid: Pid(1),
            state: ThreadState::Suspended,
            kernel_stack: PageHandle::from_addr(crate::mm::PhysicalAddress::new(0)),
            saved_sp: core::ptr::null_mut(),
            iframe: core::ptr::null_mut(),
        })
    }

    #[test]
    fn test_state_transitions() {
        use ThreadState::*;
        assert!(Runnable.can_transition(Suspended));
        assert!(Suspended.can_transition(Runnable));
        assert!(Runnable.can_transition(Zombie));
        assert!(!Suspended.can_transition(Zombie));
        assert!(!Zombie.can_transition(Runnable));
        assert!(!Zombie.can_transition(Suspended));
        assert!(Zombie.can_transition(Zombie));
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let mut table = ThreadTable::new();
        table.insert(dummy_thread(7)).unwrap();
        table.insert(dummy_thread(8)).unwrap();

        assert_eq!(table.get_mut(Tid(7)).unwrap().tid, Tid(7));
        assert!(table.get_mut(Tid(9)).is_none());

        let removed = table.remove(Tid(7)).unwrap();
        assert_eq!(removed.tid, Tid(7));
        assert!(table.get_mut(Tid(7)).is_none());
        assert!(table.remove(Tid(7)).is_none());
    }

    #[test]
    fn test_table_fills_up() {
        let mut table = ThreadTable::new();
        for i in 0..MAX_THREADS {
            table.insert(dummy_thread(i as u32 + 1)).unwrap();
        }
        assert_eq!(
            table.insert(dummy_thread(999)),
            Err(KernelError::ResourceExhausted {
                resource: "thread table"
            })
        );
    }

    #[test]
    fn test_set_state_validates() {
        let mut table = ThreadTable::new();
        table.insert(dummy_thread(1)).unwrap();
        table.set_state(Tid(1), ThreadState::Runnable).unwrap();
        table.set_state(Tid(1), ThreadState::Zombie).unwrap();
        // A zombie never runs again.
        assert!(table.set_state(Tid(1), ThreadState::Runnable).is_err());
        assert!(table.set_state(Tid(2), ThreadState::Runnable).is_err());
    }
}
