//! Preemptive round-robin scheduler.
//!
//! Threads are grouped into processes but scheduled individually from a
//! single global table. The scheduler itself is a coroutine on the boot
//! stack: threads context-switch into it, it picks the next runnable
//! thread and switches out. Zombies are reaped during the walk.

pub mod scheduler;
pub mod thread;

pub use scheduler::{
    current_pid, current_tid, exit_current_thread, has_started, preempt, start, yield_now,
};
pub use thread::{set_thread_state, Thread, ThreadState, Tid};
