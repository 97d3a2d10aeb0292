//! The kernel console as a file.
//!
//! The first process gets its stdin/stdout/stderr wired to this
//! character device so user writes to fd 1/2 reach the console before
//! any real device filesystem is mounted.

use alloc::sync::Arc;

use crate::{
    error::FsResult,
    fs::{
        file::{FileCustody, OpenFile},
        FileType, InodeInfo, InodeOps, OpenFlags, PollEvents,
    },
    kprint,
};

struct ConsoleInode;

impl InodeOps for ConsoleInode {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        // No input path on the plain console.
        Ok(0)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> FsResult<usize> {
        for chunk in buf.utf8_chunks() {
            kprint!("{}", chunk.valid());
        }
        Ok(buf.len())
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        events
    }
}

/// A custody over the kernel console.
pub fn console_custody(flags: OpenFlags) -> FileCustody {
    let file = Arc::new(OpenFile::new(
        InodeInfo {
            id: 0,
            file_type: FileType::CharacterDevice,
            size: 0,
            fs_data: 0,
        },
        Arc::new(ConsoleInode),
        None,
    ));
    FileCustody::new(file, flags)
}
