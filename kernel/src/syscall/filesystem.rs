//! File-family syscall handlers.
//!
//! Blocking VFS calls must not run under the process registry lock, so
//! custodies are taken out of the descriptor table for the duration of
//! the operation and put back afterwards.

use alloc::{string::String, vec, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::{path, pipe, vfs, FileCustody, OpenFlags, PollEvents, SeekMode},
    process::{self, Pid, Process},
    sched,
    syscall::userptr,
};

/// Cap on one read/write bounce buffer; longer requests return short.
const IO_CHUNK_MAX: usize = 64 * 1024;

fn current_pid() -> KernelResult<Pid> {
    sched::current_pid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })
}

fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    process::with_process(current_pid()?, f)
}

fn take_custody(fd: u32) -> KernelResult<(i32, FileCustody)> {
    let fd = fd as i32;
    let custody = with_current(|p| p.take_fd(fd))??;
    Ok((fd, custody))
}

fn put_custody(fd: i32, custody: FileCustody) {
    let _ = with_current(|p| p.set_fd(fd, custody));
}

/// Resolve a user path against the caller's working directory.
fn absolute_user_path(addr: u32) -> KernelResult<String> {
    let raw = userptr::read_cstr(addr)?;
    if path::is_absolute(&raw) {
        return Ok(raw);
    }
    let cwd = with_current(|p| p.cwd.clone())?;
    Ok(path::join(&cwd, &raw))
}

pub fn sys_open(path_ptr: u32, flags: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    let flags = OpenFlags::from_bits_truncate(flags);

    let custody = vfs::open(&path, flags)?;
    let fd = with_current(|p| -> KernelResult<usize> {
        let fd = p.find_free_fd()?;
        p.set_fd(fd as i32, custody)?;
        Ok(fd)
    })??;
    Ok(fd as u32)
}

pub fn sys_read(fd: u32, buf: u32, count: u32) -> KernelResult<u32> {
    let count = (count as usize).min(IO_CHUNK_MAX);
    userptr::check_user_range(buf, count)?;

    let (fd, mut custody) = take_custody(fd)?;
    let mut bounce = vec![0u8; count];
    let result = vfs::read(&mut custody, &mut bounce);
    put_custody(fd, custody);

    let n = result?;
    userptr::write_bytes(buf, &bounce[..n])?;
    Ok(n as u32)
}

pub fn sys_write(fd: u32, buf: u32, count: u32) -> KernelResult<u32> {
    let count = (count as usize).min(IO_CHUNK_MAX);
    let bounce = userptr::read_bytes(buf, count)?;

    let (fd, mut custody) = take_custody(fd)?;
    let result = vfs::write(&mut custody, &bounce);
    put_custody(fd, custody);

    Ok(result? as u32)
}

pub fn sys_close(fd: u32) -> KernelResult<u32> {
    let (_, custody) = take_custody(fd)?;
    drop(custody);
    Ok(0)
}

pub fn sys_stat(path_ptr: u32, out: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    let stat = vfs::stat(&path)?;
    userptr::write_struct(out, &stat)?;
    Ok(0)
}

pub fn sys_fstat(fd: u32, out: u32) -> KernelResult<u32> {
    let stat = with_current(|p| p.custody(fd as i32).map(vfs::fstat))??;
    userptr::write_struct(out, &stat)?;
    Ok(0)
}

pub fn sys_seek(fd: u32, offset: u32, whence: u32) -> KernelResult<u32> {
    let mode = SeekMode::from_raw(whence).ok_or(KernelError::InvalidArgument {
        name: "seek mode",
    })?;
    let position = with_current(|p| {
        p.custody_mut(fd as i32)
            .and_then(|custody| vfs::seek(custody, mode, offset as i32))
    })??;
    Ok(position as u32)
}

pub fn sys_create_pipe(out_fds: u32) -> KernelResult<u32> {
    let (read_end, write_end) = pipe::create_pipe();

    let (read_fd, write_fd) = with_current(|p| -> KernelResult<(i32, i32)> {
        let read_fd = p.find_free_fd()? as i32;
        p.set_fd(read_fd, read_end)?;
        match p.find_free_fd() {
            Ok(write_fd) => {
                p.set_fd(write_fd as i32, write_end)?;
                Ok((read_fd, write_fd as i32))
            }
            Err(e) => {
                let _ = p.take_fd(read_fd);
                Err(e)
            }
        }
    })??;

    let fds = [read_fd, write_fd];
    // SAFETY: two i32s viewed as bytes.
    let bytes =
        unsafe { core::slice::from_raw_parts(fds.as_ptr().cast::<u8>(), 8) };
    userptr::write_bytes(out_fds, bytes)?;
    Ok(0)
}

pub fn sys_dup2(old_fd: u32, new_fd: u32) -> KernelResult<u32> {
    with_current(|p| -> KernelResult<u32> {
        let copy = p.custody(old_fd as i32)?.duplicate();
        // Whatever occupied new_fd closes now.
        let _ = p.take_fd(new_fd as i32);
        p.set_fd(new_fd as i32, copy)?;
        Ok(new_fd)
    })?
}

/// Block until one of the given descriptors is readable.
pub fn sys_select(fds_ptr: u32, nfds: u32) -> KernelResult<u32> {
    let nfds = (nfds as usize).min(process::MAX_OPEN_FILES);
    let bytes = userptr::read_bytes(fds_ptr, nfds * 4)?;
    let fds: Vec<i32> = bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    loop {
        let ready = with_current(|p| -> KernelResult<bool> {
            for &fd in &fds {
                let custody = p.custody(fd)?;
                if vfs::poll(custody, PollEvents::POLLIN).contains(PollEvents::POLLIN) {
                    return Ok(true);
                }
            }
            Ok(false)
        })??;
        if ready {
            return Ok(0);
        }
        sched::yield_now();
    }
}

pub fn sys_make_directory(path_ptr: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    vfs::make_directory(&path)?;
    Ok(0)
}

pub fn sys_remove_directory(path_ptr: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    vfs::remove_directory(&path)?;
    Ok(0)
}

pub fn sys_unlink(path_ptr: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    vfs::unlink(&path)?;
    Ok(0)
}

pub fn sys_link(old_ptr: u32, new_ptr: u32) -> KernelResult<u32> {
    let old_path = absolute_user_path(old_ptr)?;
    let new_path = absolute_user_path(new_ptr)?;
    vfs::link(&old_path, &new_path)?;
    Ok(0)
}

pub fn sys_ioctl(fd: u32, request: u32, arg: u32) -> KernelResult<u32> {
    with_current(|p| {
        p.custody(fd as i32)
            .and_then(|custody| vfs::ioctl(custody, request, arg))
    })?
}

pub fn sys_setcwd(path_ptr: u32) -> KernelResult<u32> {
    let path = absolute_user_path(path_ptr)?;
    // Must name a directory.
    drop(vfs::open(&path, OpenFlags::READ | OpenFlags::DIRECTORY)?);
    with_current(|p| p.cwd = path)?;
    Ok(0)
}

pub fn sys_getcwd(buf: u32, len: u32) -> KernelResult<u32> {
    let cwd = with_current(|p| p.cwd.clone())?;
    if (len as usize) < cwd.len() + 1 {
        return Err(KernelError::Fs(crate::error::FsError::PathTooLong));
    }
    let mut bytes = Vec::with_capacity(cwd.len() + 1);
    bytes.extend_from_slice(cwd.as_bytes());
    bytes.push(0);
    userptr::write_bytes(buf, &bytes)?;
    Ok(cwd.len() as u32)
}
