//! Process-family syscall handlers.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    kprint,
    process::{self, Pid},
    sched,
    syscall::userptr,
};

/// Cap on one DebugLog write.
const DEBUG_LOG_MAX: usize = 2048;

/// Cap on argv/envp entries accepted by Execve.
const MAX_ARG_ENTRIES: usize = 32;

/// Identity record copied out by GetProcessInfo.
#[repr(C)]
#[derive(Clone, Copy)]
struct ProcessInfo {
    pid: u32,
    name: [u8; 32],
}

pub fn sys_yield() -> KernelResult<u32> {
    sched::yield_now();
    Ok(0)
}

pub fn sys_exit(code: u32) -> KernelResult<u32> {
    process::exit(code as i32)
}

pub fn sys_debug_log(buf: u32, len: u32) -> KernelResult<u32> {
    let len = (len as usize).min(DEBUG_LOG_MAX);
    let bytes = userptr::read_bytes(buf, len)?;
    for chunk in bytes.utf8_chunks() {
        kprint!("{}", chunk.valid());
    }
    Ok(len as u32)
}

pub fn sys_get_process_info(out: u32) -> KernelResult<u32> {
    let pid = sched::current_pid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;
    let name = process::with_process(pid, |p| p.name.clone())?;

    let mut info = ProcessInfo {
        pid: pid.0,
        name: [0; 32],
    };
    let n = name.len().min(info.name.len() - 1);
    info.name[..n].copy_from_slice(&name.as_bytes()[..n]);

    userptr::write_struct(out, &info)?;
    Ok(0)
}

pub fn sys_fork() -> KernelResult<u32> {
    process::fork().map(|pid| pid.0)
}

pub fn sys_execve(path: u32, argv: u32, envp: u32) -> KernelResult<u32> {
    let path = userptr::read_cstr(path)?;
    let argv: Vec<String> = userptr::read_cstr_array(argv, MAX_ARG_ENTRIES)?;
    let envp: Vec<String> = userptr::read_cstr_array(envp, MAX_ARG_ENTRIES)?;

    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();
    process::execve(&path, &argv_refs, &envp_refs)?;
    Ok(0)
}

pub fn sys_waitpid(pid: u32) -> KernelResult<u32> {
    let code = process::waitexit(Pid(pid))?;
    Ok(code as u32)
}
