//! The process record.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::FileCustody,
    mm::vm::AddressSpace,
    process::Pid,
    sched::Tid,
};

/// Fixed size of the per-process open file table.
pub const MAX_OPEN_FILES: usize = 16;

/// Callback fired when a process finishes; receives the exiting PID and
/// the registered argument.
pub type ExitCallback = fn(Pid, usize);

/// One process: identity, address space, open files, threads.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub address_space: AddressSpace,
    /// Descriptor table; the index is the userland fd.
    pub open_files: [Option<FileCustody>; MAX_OPEN_FILES],
    /// Current working directory (absolute path).
    pub cwd: String,
    pub exit_code: i32,
    /// TIDs of this process's threads; looked up in the global thread
    /// table, never via pointers.
    pub threads: Vec<Tid>,
    /// Set once the last thread has been reaped and resources released.
    pub exited: bool,
    pub(crate) exit_listeners: Vec<(ExitCallback, usize)>,
}

impl Process {
    pub fn new(pid: Pid, name: &str, address_space: AddressSpace) -> Self {
        Self {
            pid,
            name: String::from(name),
            address_space,
            open_files: [const { None }; MAX_OPEN_FILES],
            cwd: String::from("/"),
            exit_code: 0,
            threads: Vec::new(),
            exited: false,
            exit_listeners: Vec::new(),
        }
    }

    /// Lowest unused descriptor.
    pub fn find_free_fd(&self) -> KernelResult<usize> {
        self.open_files
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::TooManyOpenFiles)
    }

    fn check_fd(&self, fd: i32) -> KernelResult<usize> {
        let idx = usize::try_from(fd).map_err(|_| KernelError::BadDescriptor { fd })?;
        if idx >= MAX_OPEN_FILES {
            return Err(KernelError::BadDescriptor { fd });
        }
        Ok(idx)
    }

    pub fn custody(&self, fd: i32) -> KernelResult<&FileCustody> {
        let idx = self.check_fd(fd)?;
        self.open_files[idx]
            .as_ref()
            .ok_or(KernelError::BadDescriptor { fd })
    }

    pub fn custody_mut(&mut self, fd: i32) -> KernelResult<&mut FileCustody> {
        let idx = self.check_fd(fd)?;
        self.open_files[idx]
            .as_mut()
            .ok_or(KernelError::BadDescriptor { fd })
    }

    /// Install a custody at `fd`, closing whatever was there.
    pub fn set_fd(&mut self, fd: i32, custody: FileCustody) -> KernelResult<()> {
        let idx = self.check_fd(fd)?;
        self.open_files[idx] = Some(custody);
        Ok(())
    }

    /// Remove and return the custody at `fd`.
    pub fn take_fd(&mut self, fd: i32) -> KernelResult<FileCustody> {
        let idx = self.check_fd(fd)?;
        self.open_files[idx]
            .take()
            .ok_or(KernelError::BadDescriptor { fd })
    }

    pub fn add_exit_listener(&mut self, callback: ExitCallback, arg: usize) {
        self.exit_listeners.push((callback, arg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{console::console_custody, OpenFlags};
    use crate::mm::{page_alloc::PageHandle, PhysicalAddress};

    fn test_process() -> Process {
        let space = AddressSpace {
            ttbr0: PageHandle::from_addr(PhysicalAddress::new(0x4000)),
        };
        Process::new(Pid(1), "test", space)
    }

    #[test]
    fn test_fd_allocation_is_lowest_first() {
        let mut p = test_process();
        assert_eq!(p.find_free_fd().unwrap(), 0);
        p.set_fd(0, console_custody(OpenFlags::READ)).unwrap();
        p.set_fd(1, console_custody(OpenFlags::WRITE)).unwrap();
        assert_eq!(p.find_free_fd().unwrap(), 2);

        p.take_fd(0).unwrap();
        assert_eq!(p.find_free_fd().unwrap(), 0);
    }

    #[test]
    fn test_bad_descriptors_are_rejected() {
        let mut p = test_process();
        assert!(p.custody(-1).is_err());
        assert!(p.custody(MAX_OPEN_FILES as i32).is_err());
        assert!(p.custody(3).is_err());
        assert!(p.take_fd(3).is_err());
        assert!(p.custody_mut(99).is_err());
    }

    #[test]
    fn test_table_fills_at_sixteen() {
        let mut p = test_process();
        for i in 0..MAX_OPEN_FILES {
            let fd = p.find_free_fd().unwrap();
            assert_eq!(fd, i);
            p.set_fd(fd as i32, console_custody(OpenFlags::WRITE)).unwrap();
        }
        assert_eq!(p.find_free_fd(), Err(KernelError::TooManyOpenFiles));
    }
}
