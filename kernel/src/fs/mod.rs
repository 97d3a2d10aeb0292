//! Virtual file system.
//!
//! The core knows nothing about concrete filesystems; it consumes the
//! [`Filesystem`] and [`InodeOps`] contracts defined here. Paths are
//! canonicalised ([`path`]), mounts are longest-prefix matched, open
//! inodes are cached per filesystem, and processes hold
//! [`FileCustody`](file::FileCustody) handles into the shared
//! [`OpenFile`](file::OpenFile) objects ([`vfs`]).

pub mod console;
pub mod file;
pub mod path;
pub mod pipe;
pub mod vfs;

pub use file::{FileCustody, OpenFile};

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::FsResult;

/// Longest accepted path, in bytes.
pub const MAX_PATH: usize = 256;

/// Longest file name storable in a [`DirectoryEntry`].
pub const MAX_NAME: usize = 64;

bitflags! {
    /// Flags a file may be opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const APPEND    = 1 << 2;
        const NONBLOCK  = 1 << 3;
        const DIRECTORY = 1 << 4;
        const CREATE    = 1 << 5;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

bitflags! {
    /// Poll-able readiness events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const POLLIN  = 1 << 0;
        const POLLOUT = 1 << 1;
    }
}

/// Filetypes; an open set as far as the VFS is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    RegularFile = 0,
    Directory = 1,
    Pipe = 2,
    CharacterDevice = 3,
    BlockDevice = 4,
    Symlink = 5,
    Socket = 6,
    Fifo = 7,
}

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
    Current,
    End,
}

impl SeekMode {
    /// Decode the userland whence value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Current),
            2 => Some(Self::End),
            _ => None,
        }
    }
}

/// Filesystem-assigned inode identity.
pub type InodeId = u64;

/// Everything the VFS knows about an inode without opening it. The
/// `fs_data` word is opaque filesystem state carried from lookup to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub id: InodeId,
    pub file_type: FileType,
    pub size: u64,
    pub fs_data: u64,
}

/// Fixed-size directory record produced by reading a directory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub name: [u8; MAX_NAME],
    pub name_len: u32,
    pub file_type: u32,
    pub size: u64,
    pub fs_data: u64,
}

impl DirectoryEntry {
    pub fn new(name: &str, file_type: FileType, size: u64, fs_data: u64) -> Self {
        let mut entry = Self {
            name: [0; MAX_NAME],
            name_len: name.len().min(MAX_NAME) as u32,
            file_type: file_type as u32,
            size,
            fs_data,
        };
        entry.name[..entry.name_len as usize]
            .copy_from_slice(&name.as_bytes()[..entry.name_len as usize]);
        entry
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

/// File metadata returned by `stat`/`fstat`. Layout is shared with
/// userland.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub st_dev: u32,
    pub st_ino: u64,
    pub st_type: u32,
    pub st_size: u64,
    pub st_nlink: u32,
    pub st_blksize: u32,
}

/// Operations on one open inode. File-flavoured and directory-flavoured
/// methods default to `NotSupported` so implementations only fill in
/// their side.
pub trait InodeOps: Send + Sync {
    // File operations.

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Err(crate::error::FsError::NotSupported)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> FsResult<usize> {
        Err(crate::error::FsError::NotSupported)
    }

    /// Compute a new seek position. The default clamps into `[0, size]`.
    fn seek(&self, current: u64, mode: SeekMode, offset: i32, size: u64) -> FsResult<u64> {
        Ok(default_checked_seek(size, current, mode, offset))
    }

    fn ioctl(&self, _request: u32, _arg: u32) -> FsResult<u32> {
        Err(crate::error::FsError::NotSupported)
    }

    /// Which of `events` are ready right now. The default says all:
    /// regular files and directories never block.
    fn poll(&self, events: PollEvents) -> PollEvents {
        events
    }

    /// Called when the last custody over this inode goes away.
    fn on_last_close(&self) {}

    // Directory operations.

    fn lookup(&self, _name: &str) -> FsResult<InodeInfo> {
        Err(crate::error::FsError::NotSupported)
    }

    fn create(&self, _name: &str, _file_type: FileType) -> FsResult<InodeInfo> {
        Err(crate::error::FsError::NotSupported)
    }

    fn mkdir(&self, _name: &str) -> FsResult<InodeInfo> {
        Err(crate::error::FsError::NotSupported)
    }

    fn rmdir(&self, _name: &str) -> FsResult<()> {
        Err(crate::error::FsError::NotSupported)
    }

    fn unlink(&self, _name: &str) -> FsResult<()> {
        Err(crate::error::FsError::NotSupported)
    }

    /// Hard-link `target` under this directory as `name`.
    fn link(&self, _name: &str, _target: &InodeInfo) -> FsResult<()> {
        Err(crate::error::FsError::NotSupported)
    }

    /// The `index`-th directory entry, or `None` past the end.
    fn getdents(&self, _index: usize) -> FsResult<Option<DirectoryEntry>> {
        Err(crate::error::FsError::NotSupported)
    }
}

/// A mountable filesystem.
pub trait Filesystem: Send + Sync {
    /// Called once at mount; returns the (closed) root inode.
    fn on_mount(&self) -> FsResult<InodeInfo>;

    /// Open an inode previously produced by `on_mount`, `lookup` or
    /// `create`.
    fn open_inode(&self, info: &InodeInfo) -> FsResult<Arc<dyn InodeOps>>;

    /// Release an inode after its last custody closed.
    fn close_inode(&self, _info: &InodeInfo) -> FsResult<()> {
        Ok(())
    }
}

/// Clamp a seek request into `[0, filesize]`.
pub fn default_checked_seek(filesize: u64, current: u64, mode: SeekMode, offset: i32) -> u64 {
    let target = match mode {
        SeekMode::Set => offset as i64,
        SeekMode::Current => current as i64 + offset as i64,
        SeekMode::End => filesize as i64 - offset as i64,
    };
    target.clamp(0, filesize as i64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_seek_clamps() {
        assert_eq!(default_checked_seek(100, 0, SeekMode::Set, 50), 50);
        assert_eq!(default_checked_seek(100, 0, SeekMode::Set, 150), 100);
        assert_eq!(default_checked_seek(100, 60, SeekMode::Current, -80), 0);
        assert_eq!(default_checked_seek(100, 60, SeekMode::Current, 20), 80);
        assert_eq!(default_checked_seek(100, 0, SeekMode::End, 30), 70);
        assert_eq!(default_checked_seek(100, 0, SeekMode::End, 0), 100);
    }

    #[test]
    fn test_directory_entry_name_bounds() {
        let entry = DirectoryEntry::new("hello.txt", FileType::RegularFile, 12, 0);
        assert_eq!(entry.name(), "hello.txt");

        let long = core::str::from_utf8(&[b'a'; 100]).unwrap();
        let entry = DirectoryEntry::new(long, FileType::RegularFile, 0, 0);
        assert_eq!(entry.name().len(), MAX_NAME);
    }

    #[test]
    fn test_seek_mode_decoding() {
        assert_eq!(SeekMode::from_raw(0), Some(SeekMode::Set));
        assert_eq!(SeekMode::from_raw(2), Some(SeekMode::End));
        assert_eq!(SeekMode::from_raw(7), None);
    }
}
