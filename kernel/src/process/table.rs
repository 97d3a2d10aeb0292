//! The global process registry.
//!
//! Processes are looked up by PID; the registry owns the records. The
//! lock is IRQ-masked because exit listeners and wake-ups run from timer
//! callbacks.

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::vm::{self, AddressSpace},
    process::{pcb::Process, Pid},
    sched::Tid,
    sync::IrqGuard,
};

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

lazy_static! {
    static ref PROCESSES: Mutex<BTreeMap<u32, Process>> = Mutex::new(BTreeMap::new());
}

pub fn alloc_pid() -> Pid {
    Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

fn with_registry<R>(f: impl FnOnce(&mut BTreeMap<u32, Process>) -> R) -> R {
    let _irq = IrqGuard::new();
    f(&mut PROCESSES.lock())
}

/// Register a new process.
pub fn insert(process: Process) {
    with_registry(|registry| {
        let previous = registry.insert(process.pid.0, process);
        debug_assert!(previous.is_none(), "pid reused");
    });
}

/// Remove a process record entirely.
pub fn remove(pid: Pid) -> Option<Process> {
    with_registry(|registry| registry.remove(&pid.0))
}

/// Run `f` on the process record.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    with_registry(|registry| {
        registry
            .get_mut(&pid.0)
            .map(f)
            .ok_or(KernelError::ProcessNotFound { pid: pid.0 })
    })
}

/// The address space a thread of `pid` must run under.
pub fn address_space_of(pid: Pid) -> KernelResult<AddressSpace> {
    with_process(pid, |p| p.address_space)
}

/// Scheduler callback: a thread of `pid` has been reaped.
///
/// When the last thread goes, the process's open files are released, its
/// address space is torn down and its exit listeners fire. The record
/// itself stays (marked `exited`, exit code readable) until a waiter
/// collects it.
pub fn on_thread_reaped(pid: Pid, tid: Tid) {
    // Pull everything that needs releasing out of the record first; file
    // closes and address-space teardown must not run under the registry
    // lock.
    let cleanup = with_process(pid, |p| {
        p.threads.retain(|&t| t != tid);
        if !p.threads.is_empty() || p.exited {
            return None;
        }
        p.exited = true;
        let files: [Option<crate::fs::FileCustody>; super::MAX_OPEN_FILES] =
            core::array::from_fn(|i| p.open_files[i].take());
        let listeners = core::mem::take(&mut p.exit_listeners);
        Some((p.address_space, files, listeners))
    });

    let Ok(Some((space, files, listeners))) = cleanup else {
        return;
    };

    log::info!("process {} finished", pid.0);
    drop(files);

    // Never tear down the tables the MMU is walking.
    if vm::current_address_space() == space {
        vm::switch_address_space(&vm::kernel_address_space());
    }
    vm::free_address_space(space);

    for (callback, arg) in listeners {
        callback(pid, arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{page_alloc::PageHandle, PhysicalAddress};

    fn dummy_space(addr: u32) -> AddressSpace {
        AddressSpace {
            ttbr0: PageHandle::from_addr(PhysicalAddress::new(addr)),
        }
    }

    #[test]
    fn test_registry_insert_lookup_remove() {
        let pid = alloc_pid();
        insert(Process::new(pid, "reg-test", dummy_space(0x8000)));

        let name = with_process(pid, |p| p.name.clone()).unwrap();
        assert_eq!(name, "reg-test");
        assert_eq!(address_space_of(pid).unwrap(), dummy_space(0x8000));

        let removed = remove(pid).unwrap();
        assert_eq!(removed.pid, pid);
        assert!(with_process(pid, |_| ()).is_err());
    }

    #[test]
    fn test_pids_are_unique() {
        let a = alloc_pid();
        let b = alloc_pid();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_reap_of_non_last_thread_keeps_process() {
        let pid = alloc_pid();
        let mut process = Process::new(pid, "multi", dummy_space(0xC000));
        process.threads.push(Tid(101));
        process.threads.push(Tid(102));
        insert(process);

        on_thread_reaped(pid, Tid(101));
        let (exited, remaining) =
            with_process(pid, |p| (p.exited, p.threads.len())).unwrap();
        assert!(!exited);
        assert_eq!(remaining, 1);

        remove(pid);
    }
}
