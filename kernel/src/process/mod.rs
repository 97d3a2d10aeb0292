//! Processes: records, registry, ELF loading and lifecycle.

pub mod lifecycle;
pub mod loader;
pub mod pcb;
pub mod table;

pub use lifecycle::{create_first_process, execve, exit, fork, waitexit};
pub use pcb::{Process, MAX_OPEN_FILES};
pub use table::{address_space_of, on_thread_reaped, with_process};

/// Process identifier. PIDs start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
