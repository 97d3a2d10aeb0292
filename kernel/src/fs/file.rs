//! Open files and per-process custody handles.
//!
//! An [`OpenFile`] is the shared object behind one open inode: its
//! metadata, its operation table and a count of the custodies pointing at
//! it. A [`FileCustody`] is what actually sits in a process's descriptor
//! table: a reference to the shared file plus the open flags and the
//! private seek position. Custodies multiply through `dup2` and `fork`;
//! the file notices only when the last one goes away.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::fs::{vfs, InodeInfo, InodeOps, OpenFlags};

/// The shared object behind one open inode.
pub struct OpenFile {
    pub info: InodeInfo,
    pub ops: Arc<dyn InodeOps>,
    /// Mount this file was opened through; `None` for anonymous files
    /// (pipes, the kernel console).
    pub(crate) mount: Option<Arc<vfs::Mount>>,
    /// Number of custodies referring to this file.
    refcount: AtomicU32,
}

impl OpenFile {
    /// A file with one outstanding custody.
    pub(crate) fn new(
        info: InodeInfo,
        ops: Arc<dyn InodeOps>,
        mount: Option<Arc<vfs::Mount>>,
    ) -> Self {
        Self {
            info,
            ops,
            mount,
            refcount: AtomicU32::new(1),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one custody's reference; true when it was the last.
    pub(crate) fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::Release) == 1
    }
}

/// A process's handle on an open file.
pub struct FileCustody {
    pub file: Arc<OpenFile>,
    pub flags: OpenFlags,
    /// Current seek position (byte offset, or directory entry cursor).
    pub offset: u64,
}

impl core::fmt::Debug for FileCustody {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileCustody")
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .finish()
    }
}

impl FileCustody {
    pub(crate) fn new(file: Arc<OpenFile>, flags: OpenFlags) -> Self {
        Self {
            file,
            flags,
            offset: 0,
        }
    }

    /// A second custody over the same file, sharing the seek position
    /// value at the time of duplication.
    pub fn duplicate(&self) -> FileCustody {
        self.file.retain();
        FileCustody {
            file: self.file.clone(),
            flags: self.flags,
            offset: self.offset,
        }
    }
}

impl Drop for FileCustody {
    fn drop(&mut self) {
        vfs::on_custody_dropped(&self.file);
    }
}
