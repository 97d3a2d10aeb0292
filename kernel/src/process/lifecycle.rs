//! Process lifecycle: creation, fork, execve, exit and reaping.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    fs::{console::console_custody, FileCustody, OpenFlags},
    mm::{
        areas,
        page_alloc::{self, PageOrder},
        page_table::AccessPermissions,
        round_down,
        vm::{self, AddressSpace},
        VirtualAddress, MIB,
    },
    process::{loader, pcb::Process, table, Pid},
    sched::{self, thread, ThreadState},
    sync::IrqGuard,
};

/// Ceiling on one thread's user stack.
pub const THREAD_STACK_MAX: u32 = 2 * MIB;

/// Pages mapped for a fresh user stack (16 KiB).
const INITIAL_STACK_PAGES: u32 = 4;

/// Map a fresh user stack for thread number `thread_index` of `space`.
///
/// Stacks grow down from just under the kernel boundary, one 2 MiB slot
/// per thread. Returns the initial stack pointer.
fn alloc_user_stack(space: &AddressSpace, thread_index: u32) -> KernelResult<u32> {
    let top = areas::USER.end - thread_index * THREAD_STACK_MAX;

    for i in 0..INITIAL_STACK_PAGES {
        let page = page_alloc::alloc(PageOrder::FourKib)?;
        let virt = top - (i + 1) * 4096;
        vm::map(
            space,
            page,
            VirtualAddress::new(virt),
            AccessPermissions::UserFullAccess,
        )?;
        // The mapping keeps the page alive.
        page_alloc::free(page, PageOrder::FourKib);
    }

    Ok(top - crate::arch::STACK_ALIGNMENT)
}

/// Compute the initial user stack image for `execve`.
///
/// Ascending from the returned stack pointer: the `{argc, argv, envc,
/// envp}` header, the envp pointer array, the argv pointer array (both
/// word-aligned and null-terminated), then the packed strings. The stack
/// pointer is 8-byte aligned.
///
/// Returns `(sp, image)`; the image is to be written at `sp`.
pub fn build_stack_image(top: u32, argv: &[&str], envp: &[&str]) -> (u32, Vec<u8>) {
    let argc = argv.len();
    let envc = envp.len();

    let header_size = 16;
    let envp_array_size = 4 * (envc + 1);
    let argv_array_size = 4 * (argc + 1);
    let strings_size: usize = argv
        .iter()
        .chain(envp.iter())
        .map(|s| s.len() + 1)
        .sum();
    let total = header_size + envp_array_size + argv_array_size + strings_size;

    let sp = round_down(top - total as u32, crate::arch::STACK_ALIGNMENT);
    let mut image = Vec::new();
    image.resize(total, 0);

    let envp_array_at = header_size;
    let argv_array_at = envp_array_at + envp_array_size;
    let mut string_at = argv_array_at + argv_array_size;

    fn put_u32(image: &mut [u8], at: usize, value: u32) {
        image[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    for (i, arg) in argv.iter().enumerate() {
        put_u32(&mut image, argv_array_at + 4 * i, sp + string_at as u32);
        image[string_at..string_at + arg.len()].copy_from_slice(arg.as_bytes());
        string_at += arg.len() + 1;
    }
    for (i, var) in envp.iter().enumerate() {
        put_u32(&mut image, envp_array_at + 4 * i, sp + string_at as u32);
        image[string_at..string_at + var.len()].copy_from_slice(var.as_bytes());
        string_at += var.len() + 1;
    }

    // Header: {argc, argv, envc, envp}.
    put_u32(&mut image, 0, argc as u32);
    put_u32(&mut image, 4, sp + argv_array_at as u32);
    put_u32(&mut image, 8, envc as u32);
    put_u32(&mut image, 12, sp + envp_array_at as u32);

    (sp, image)
}

/// Create a process with one Suspended thread entering at `entry`.
pub fn create_process(name: &str, entry: u32, privileged: bool) -> KernelResult<Pid> {
    let space = vm::create_address_space()?;
    let pid = table::alloc_pid();

    let user_sp = match alloc_user_stack(&space, 0) {
        Ok(sp) => sp,
        Err(e) => {
            vm::free_address_space(space);
            return Err(e);
        }
    };
    let tid = match thread::create(pid, entry, user_sp, privileged) {
        Ok(tid) => tid,
        Err(e) => {
            vm::free_address_space(space);
            return Err(e);
        }
    };

    let mut process = Process::new(pid, name, space);
    process.threads.push(tid);
    table::insert(process);

    log::info!("created process '{}' [{}]", name, pid);
    Ok(pid)
}

/// Create the first (privileged) process, wire its stdio to the kernel
/// console and make it Runnable. The scheduler picks it up when started.
pub fn create_first_process(name: &str, entry: u32) -> KernelResult<Pid> {
    let pid = create_process(name, entry, true)?;

    table::with_process(pid, |p| {
        p.set_fd(0, console_custody(OpenFlags::READ))?;
        p.set_fd(1, console_custody(OpenFlags::WRITE))?;
        p.set_fd(2, console_custody(OpenFlags::WRITE))?;
        Ok::<(), KernelError>(())
    })??;

    let tid = table::with_process(pid, |p| p.threads[0])?;
    sched::set_thread_state(tid, ThreadState::Runnable)?;
    Ok(pid)
}

/// Fork the calling process.
///
/// The child gets an eager copy of every user mapping, duplicates of all
/// open custodies and a copy of the parent's trap frame with the syscall
/// return rewritten to 0. The parent receives the child PID.
pub fn fork() -> KernelResult<Pid> {
    let parent_pid = sched::current_pid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;
    let parent_tid = sched::current_tid().expect("current pid without current tid");

    let (parent_space, name, cwd) = table::with_process(parent_pid, |p| {
        (p.address_space, p.name.clone(), p.cwd.clone())
    })?;

    let child_space = vm::create_address_space()?;
    if let Err(e) = vm::fork_copy(&parent_space, &child_space) {
        vm::free_address_space(child_space);
        return Err(e);
    }

    let child_pid = table::alloc_pid();
    let child_tid = match thread::create(child_pid, 0, 0, false) {
        Ok(tid) => tid,
        Err(e) => {
            vm::free_address_space(child_space);
            return Err(e);
        }
    };

    // The child resumes exactly where the parent trapped, but its
    // syscall returns 0.
    let parent_frame = thread::with_thread(parent_tid, |t| {
        // SAFETY: iframe points at the parent's own kernel stack; the
        // parent is the current thread, so the frame is complete.
        unsafe { *t.iframe }
    })?;
    thread::with_thread(child_tid, |t| {
        // SAFETY: iframe was placed on the child's fresh kernel stack by
        // thread::create.
        unsafe {
            *t.iframe = parent_frame;
            (*t.iframe).set_syscall_return(0, 0);
        }
    })?;

    let duplicates: Vec<Option<FileCustody>> = table::with_process(parent_pid, |p| {
        p.open_files
            .iter()
            .map(|slot| slot.as_ref().map(FileCustody::duplicate))
            .collect()
    })?;

    let mut child = Process::new(child_pid, &name, child_space);
    child.cwd = cwd;
    child.threads.push(child_tid);
    for (fd, custody) in duplicates.into_iter().enumerate() {
        if let Some(custody) = custody {
            child.open_files[fd] = Some(custody);
        }
    }
    table::insert(child);

    sched::set_thread_state(child_tid, ThreadState::Runnable)?;
    log::info!("forked process {} into {}", parent_pid, child_pid);
    Ok(child_pid)
}

/// Replace the calling process's image with the executable at `path`.
///
/// Refused when the process has more than one thread. On success the
/// current thread's trap frame is rewritten so the return to user mode
/// lands on the fresh image's entry point with the argv/envp stack laid
/// out.
pub fn execve(path: &str, argv: &[&str], envp: &[&str]) -> KernelResult<()> {
    let pid = sched::current_pid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;
    let tid = sched::current_tid().expect("current pid without current tid");

    let thread_count = table::with_process(pid, |p| p.threads.len())?;
    if thread_count > 1 {
        return Err(KernelError::InvalidArgument {
            name: "execve with multiple threads",
        });
    }

    let new_space = vm::create_address_space()?;
    let result: KernelResult<(u32, u32)> = (|| {
        let entry = loader::load_from_path(path, &new_space, false)?;
        let stack_top = alloc_user_stack(&new_space, 0)?;
        let (sp, image) = build_stack_image(stack_top, argv, envp);
        vm::copy_to_user(&new_space, sp, &image)?;
        Ok((entry, sp))
    })();

    let (entry, sp) = match result {
        Ok(values) => values,
        Err(e) => {
            vm::free_address_space(new_space);
            return Err(e);
        }
    };

    // Point of no return: swap the address space under the running
    // thread. The kernel stack stays valid; it lives in the shared half.
    let old_space = table::with_process(pid, |p| {
        core::mem::replace(&mut p.address_space, new_space)
    })?;
    vm::switch_address_space(&new_space);
    vm::free_address_space(old_space);

    thread::with_thread(tid, |t| {
        // SAFETY: the frame is on this thread's own kernel stack.
        unsafe { (*t.iframe).set_thread_start(entry, sp) };
    })?;

    log::info!("process {} exec '{}'", pid, path);
    Ok(())
}

/// Record the exit code, zombify the calling thread and never return.
pub fn exit(code: i32) -> ! {
    if let Some(pid) = sched::current_pid() {
        let _ = table::with_process(pid, |p| p.exit_code = code);
        log::info!("process {} exiting with code {}", pid, code);
    }
    sched::exit_current_thread();
}

fn wake_waiter(_exited: Pid, arg: usize) {
    let _ = sched::set_thread_state(crate::sched::Tid(arg as u32), ThreadState::Runnable);
}

/// Suspend until `target` has exited; returns its exit code.
///
/// The waiter that observes the exit also retires the process record.
pub fn waitexit(target: Pid) -> KernelResult<i32> {
    let my_tid = sched::current_tid().ok_or(KernelError::NotInitialized {
        subsystem: "scheduler",
    })?;

    loop {
        {
            // No preemption between the exit check and the suspend, or a
            // wake-up could slip through before we sleep.
            let _irq = IrqGuard::new();
            let observed = table::with_process(target, |p| {
                if p.exited {
                    Some(p.exit_code)
                } else {
                    p.add_exit_listener(wake_waiter, my_tid.0 as usize);
                    None
                }
            })?;
            match observed {
                Some(code) => {
                    table::remove(target);
                    return Ok(code);
                }
                None => {
                    let _ = sched::set_thread_state(my_tid, ThreadState::Suspended);
                }
            }
        }
        sched::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_at(image: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]])
    }

    #[test]
    fn test_stack_image_header() {
        // The first word below the alignment padding holds argc.
        let (sp, image) = build_stack_image(0x1000_0000 - 8, &["shell"], &[]);
        assert_eq!(sp % 8, 0);
        assert_eq!(word_at(&image, 0), 1); // argc

        let argv_ptr = word_at(&image, 4);
        assert_eq!(word_at(&image, 8), 0); // envc
        let envp_ptr = word_at(&image, 12);

        assert_eq!(argv_ptr % 4, 0);
        assert_eq!(envp_ptr % 4, 0);
        assert!(argv_ptr > sp && argv_ptr < 0x1000_0000);
    }

    #[test]
    fn test_stack_image_strings_and_terminators() {
        let top = 0xBFFF_FFF8;
        let (sp, image) = build_stack_image(top, &["ls", "-l"], &["TERM=basalt"]);

        let argv_ptr = word_at(&image, 4);
        let envp_ptr = word_at(&image, 12);
        assert_eq!(word_at(&image, 0), 2);
        assert_eq!(word_at(&image, 8), 1);

        let read_str = |addr: u32| {
            let at = (addr - sp) as usize;
            let end = image[at..].iter().position(|&b| b == 0).unwrap() + at;
            core::str::from_utf8(&image[at..end]).unwrap()
        };

        let argv0 = word_at(&image, (argv_ptr - sp) as usize);
        let argv1 = word_at(&image, (argv_ptr - sp) as usize + 4);
        let argv_null = word_at(&image, (argv_ptr - sp) as usize + 8);
        assert_eq!(read_str(argv0), "ls");
        assert_eq!(read_str(argv1), "-l");
        assert_eq!(argv_null, 0);

        let envp0 = word_at(&image, (envp_ptr - sp) as usize);
        let envp_null = word_at(&image, (envp_ptr - sp) as usize + 4);
        assert_eq!(read_str(envp0), "TERM=basalt");
        assert_eq!(envp_null, 0);

        // Everything fits between sp and the stack top.
        assert!(sp + image.len() as u32 <= top);
    }

    #[test]
    fn test_stack_image_empty_args() {
        let (sp, image) = build_stack_image(0xBFFF_FFF8, &[], &[]);
        assert_eq!(sp % 8, 0);
        assert_eq!(word_at(&image, 0), 0);
        // Null terminators of both arrays are present.
        assert_eq!(image.len(), 16 + 4 + 4);
    }
}
