//! System call dispatch.
//!
//! Userland traps with `svc #0x10`, the call number in r7 and up to four
//! arguments in r0-r3. The dispatcher decodes the number, routes to the
//! handler, and writes the two return values back into the trap frame:
//! r0 carries `rc` (0 or a positive result on success, a negative errno
//! on failure) and r1 carries the secondary value.
//!
//! Every user pointer crossing the boundary is range-checked against the
//! user half and moved with the address-space copy routines; handlers
//! never dereference user memory directly.

pub mod filesystem;
pub mod process;
pub mod time;
pub mod userptr;

use crate::{arch::InterruptFrame, error::KernelResult, irq};

/// SWI immediate that selects the syscall service.
pub const SYSCALL_SWI: u32 = 0x10;

/// The syscall catalogue. Numbers are userland ABI and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Yield = 1,
    Exit = 2,
    DebugLog = 3,
    GetProcessInfo = 4,
    Fork = 5,
    Execve = 6,
    WaitPid = 7,

    Open = 10,
    Read = 11,
    Write = 12,
    Close = 13,
    Stat = 14,
    Seek = 15,
    CreatePipe = 16,
    Dup2 = 17,
    Select = 18,
    FStat = 19,

    MakeDirectory = 20,
    RemoveDirectory = 21,
    Link = 22,
    Unlink = 23,
    Ioctl = 24,
    SetCwd = 25,
    GetCwd = 26,

    GetDateTime = 30,
    MilliSleep = 31,
    GetTicks = 32,
}

impl Syscall {
    pub fn from_number(nr: u32) -> Option<Self> {
        Some(match nr {
            1 => Self::Yield,
            2 => Self::Exit,
            3 => Self::DebugLog,
            4 => Self::GetProcessInfo,
            5 => Self::Fork,
            6 => Self::Execve,
            7 => Self::WaitPid,
            10 => Self::Open,
            11 => Self::Read,
            12 => Self::Write,
            13 => Self::Close,
            14 => Self::Stat,
            15 => Self::Seek,
            16 => Self::CreatePipe,
            17 => Self::Dup2,
            18 => Self::Select,
            19 => Self::FStat,
            20 => Self::MakeDirectory,
            21 => Self::RemoveDirectory,
            22 => Self::Link,
            23 => Self::Unlink,
            24 => Self::Ioctl,
            25 => Self::SetCwd,
            26 => Self::GetCwd,
            30 => Self::GetDateTime,
            31 => Self::MilliSleep,
            32 => Self::GetTicks,
            _ => return None,
        })
    }
}

/// Install the syscall service on the SWI vector.
pub fn init() {
    irq::install_swi_handler(SYSCALL_SWI, handle_trap);
}

/// Entry from the SWI path: decode, dispatch, write results back.
fn handle_trap(frame: &mut InterruptFrame) {
    let nr = frame.r[7];
    let args = [frame.r[0], frame.r[1], frame.r[2], frame.r[3]];

    let result = match Syscall::from_number(nr) {
        Some(call) => dispatch(call, args),
        None => Err(crate::error::KernelError::InvalidSyscall { nr }),
    };

    match result {
        Ok(value) => frame.set_syscall_return(value, value),
        Err(e) => {
            log::debug!("syscall {} failed: {}", nr, e);
            frame.set_syscall_return(e.to_errno() as u32, 0);
        }
    }
}

fn dispatch(call: Syscall, args: [u32; 4]) -> KernelResult<u32> {
    match call {
        Syscall::Yield => process::sys_yield(),
        Syscall::Exit => process::sys_exit(args[0]),
        Syscall::DebugLog => process::sys_debug_log(args[0], args[1]),
        Syscall::GetProcessInfo => process::sys_get_process_info(args[0]),
        Syscall::Fork => process::sys_fork(),
        Syscall::Execve => process::sys_execve(args[0], args[1], args[2]),
        Syscall::WaitPid => process::sys_waitpid(args[0]),

        Syscall::Open => filesystem::sys_open(args[0], args[1]),
        Syscall::Read => filesystem::sys_read(args[0], args[1], args[2]),
        Syscall::Write => filesystem::sys_write(args[0], args[1], args[2]),
        Syscall::Close => filesystem::sys_close(args[0]),
        Syscall::Stat => filesystem::sys_stat(args[0], args[1]),
        Syscall::Seek => filesystem::sys_seek(args[0], args[1], args[2]),
        Syscall::CreatePipe => filesystem::sys_create_pipe(args[0]),
        Syscall::Dup2 => filesystem::sys_dup2(args[0], args[1]),
        Syscall::Select => filesystem::sys_select(args[0], args[1]),
        Syscall::FStat => filesystem::sys_fstat(args[0], args[1]),

        Syscall::MakeDirectory => filesystem::sys_make_directory(args[0]),
        Syscall::RemoveDirectory => filesystem::sys_remove_directory(args[0]),
        Syscall::Link => filesystem::sys_link(args[0], args[1]),
        Syscall::Unlink => filesystem::sys_unlink(args[0]),
        Syscall::Ioctl => filesystem::sys_ioctl(args[0], args[1], args[2]),
        Syscall::SetCwd => filesystem::sys_setcwd(args[0]),
        Syscall::GetCwd => filesystem::sys_getcwd(args[0], args[1]),

        Syscall::GetDateTime => time::sys_get_datetime(args[0]),
        Syscall::MilliSleep => time::sys_millisleep(args[0]),
        Syscall::GetTicks => time::sys_get_ticks(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_numbers_are_stable() {
        assert_eq!(Syscall::Yield as u32, 1);
        assert_eq!(Syscall::WaitPid as u32, 7);
        assert_eq!(Syscall::Open as u32, 10);
        assert_eq!(Syscall::FStat as u32, 19);
        assert_eq!(Syscall::MakeDirectory as u32, 20);
        assert_eq!(Syscall::Unlink as u32, 23);
        assert_eq!(Syscall::GetDateTime as u32, 30);
        assert_eq!(Syscall::MilliSleep as u32, 31);
    }

    #[test]
    fn test_decode_round_trips() {
        for nr in 0..64u32 {
            if let Some(call) = Syscall::from_number(nr) {
                assert_eq!(call as u32, nr);
            }
        }
        assert_eq!(Syscall::from_number(1), Some(Syscall::Yield));
        assert_eq!(Syscall::from_number(8), None);
        assert_eq!(Syscall::from_number(99), None);
    }
}
