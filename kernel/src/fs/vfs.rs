//! VFS core: mount table, path traversal, inode cache and custody
//! operations.
//!
//! Mounts are kept ordered by path length descending so the first prefix
//! match is the longest one. Each mount carries its own inode cache,
//! keyed by filesystem-assigned identifier: every live `OpenFile` for an
//! inode is shared by all custodies referring to it, and the
//! filesystem's `open_inode`/`close_inode` pair runs exactly once per
//! cache residency.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use lazy_static::lazy_static;
use spin::{Mutex, RwLock};

use crate::{
    error::{FsError, KernelError, KernelResult},
    fs::{
        file::{FileCustody, OpenFile},
        path::{self, CanonicalPath},
        DirectoryEntry, FileType, Filesystem, InodeId, InodeInfo, OpenFlags, PollEvents, SeekMode,
        Stat,
    },
    sched,
};

/// One mounted filesystem.
pub struct Mount {
    pub path: CanonicalPath,
    pub fs: Arc<dyn Filesystem>,
    pub root: InodeInfo,
    icache: Mutex<BTreeMap<InodeId, Arc<OpenFile>>>,
}

lazy_static! {
    /// Mount list, longest canonical path first.
    static ref MOUNTS: RwLock<Vec<Arc<Mount>>> = RwLock::new(Vec::new());
}

/// Mount `fs` at `path`.
pub fn mount(path_str: &str, fs: Arc<dyn Filesystem>) -> KernelResult<()> {
    let cpath = path::canonicalize(path_str)?;
    let root = fs.on_mount()?;
    if root.file_type != FileType::Directory {
        return Err(FsError::NotADirectory.into());
    }

    let mount = Arc::new(Mount {
        path: cpath,
        fs,
        root,
        icache: Mutex::new(BTreeMap::new()),
    });

    // Keep the root inode permanently open so repeated traversals do not
    // churn the filesystem.
    let root_file = open_inode_cached(&mount, &root)?;
    core::mem::forget(FileCustody::new(root_file, OpenFlags::empty()));

    let mut mounts = MOUNTS.write();
    let position = mounts
        .iter()
        .position(|m| m.path.component_count() < mount.path.component_count())
        .unwrap_or(mounts.len());
    mounts.insert(position, mount);

    log::info!("mounted filesystem at '{}'", path_str);
    Ok(())
}

fn find_mount(cpath: &CanonicalPath) -> Option<Arc<Mount>> {
    MOUNTS
        .read()
        .iter()
        .find(|m| cpath.starts_with(&m.path))
        .cloned()
}

/// Fetch an inode through the mount's cache, opening it on a miss.
fn open_inode_cached(mount: &Arc<Mount>, info: &InodeInfo) -> KernelResult<Arc<OpenFile>> {
    let mut cache = mount.icache.lock();
    if let Some(existing) = cache.get(&info.id) {
        existing.retain();
        return Ok(existing.clone());
    }

    let ops = mount.fs.open_inode(info)?;
    let file = Arc::new(OpenFile::new(*info, ops, Some(mount.clone())));
    cache.insert(info.id, file.clone());
    Ok(file)
}

/// Custody drop hook: the last reference evicts the inode from the cache
/// and gives the filesystem its close callback.
pub(crate) fn on_custody_dropped(file: &Arc<OpenFile>) {
    if !file.release() {
        return;
    }
    file.ops.on_last_close();
    if let Some(mount) = &file.mount {
        mount.icache.lock().remove(&file.info.id);
        let _ = mount.fs.close_inode(&file.info);
    }
}

/// Outcome of resolving a path.
enum Resolution {
    /// Every component resolved.
    Found {
        parent: Option<FileCustody>,
        file: FileCustody,
        /// Final component name; `None` for a mount root.
        name: Option<String>,
    },
    /// Everything but the last component resolved, and the second-to-last
    /// is a directory: the position a `create` would fill.
    MissingLast { parent: FileCustody, name: String },
}

fn resolve(path_str: &str) -> KernelResult<Resolution> {
    let cpath = path::canonicalize(path_str)?;
    let mount = find_mount(&cpath).ok_or(FsError::NotFound)?;
    let relative = cpath.strip_prefix(&mount.path);

    let root = open_inode_cached(&mount, &mount.root)?;
    let mut current = FileCustody::new(root, OpenFlags::empty());
    let mut parent: Option<FileCustody> = None;
    let mut current_name: Option<String> = None;

    let count = relative.component_count();
    for (index, component) in relative.components().enumerate() {
        if current.file.info.file_type != FileType::Directory {
            return Err(FsError::NotADirectory.into());
        }

        match current.file.ops.lookup(component) {
            Ok(info) => {
                let file = open_inode_cached(&mount, &info)?;
                parent = Some(current);
                current = FileCustody::new(file, OpenFlags::empty());
                current_name = Some(component.to_string());
            }
            Err(FsError::NotFound) if index + 1 == count => {
                return Ok(Resolution::MissingLast {
                    parent: current,
                    name: component.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Resolution::Found {
        parent,
        file: current,
        name: current_name,
    })
}

/// Open `path` with `flags`, creating a regular file when `CREATE` is
/// set and only the final component is missing.
pub fn open(path_str: &str, flags: OpenFlags) -> KernelResult<FileCustody> {
    let mut custody = match resolve(path_str)? {
        Resolution::Found { file, .. } => file,
        Resolution::MissingLast { parent, name } => {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(FsError::NotFound.into());
            }
            let info = parent.file.ops.create(&name, FileType::RegularFile)?;
            let mount = parent
                .file
                .mount
                .as_ref()
                .expect("created through a mounted filesystem")
                .clone();
            let file = open_inode_cached(&mount, &info)?;
            FileCustody::new(file, OpenFlags::empty())
        }
    };

    let is_dir = custody.file.info.file_type == FileType::Directory;
    if is_dir && !flags.contains(OpenFlags::DIRECTORY) {
        return Err(FsError::IsADirectory.into());
    }
    if !is_dir && flags.contains(OpenFlags::DIRECTORY) {
        return Err(FsError::NotADirectory.into());
    }

    custody.flags = flags;
    if flags.contains(OpenFlags::APPEND) {
        custody.offset = custody.file.info.size;
    }
    Ok(custody)
}

/// Open relative paths against a working directory.
pub fn open_at(workdir: &str, path_str: &str, flags: OpenFlags) -> KernelResult<FileCustody> {
    if path::is_absolute(path_str) {
        open(path_str, flags)
    } else {
        open(&path::join(workdir, path_str), flags)
    }
}

/// Block (yielding) until one of `events` is ready on the custody.
fn wait_ready(custody: &FileCustody, events: PollEvents) {
    loop {
        if !custody.file.ops.poll(events).is_empty() {
            return;
        }
        sched::yield_now();
    }
}

/// Read from the custody at its seek position.
///
/// Directory reads produce packed [`DirectoryEntry`] records and require
/// the custody to have been opened with `DIRECTORY`. Blocking custodies
/// wait for readability first.
pub fn read(custody: &mut FileCustody, buf: &mut [u8]) -> KernelResult<usize> {
    let is_dir = custody.file.info.file_type == FileType::Directory;
    if is_dir {
        if !custody.flags.contains(OpenFlags::DIRECTORY) {
            return Err(FsError::IsADirectory.into());
        }
        return read_dirents(custody, buf);
    }

    if !custody.flags.readable() {
        return Err(KernelError::PermissionDenied { operation: "read" });
    }
    if !custody.flags.contains(OpenFlags::NONBLOCK) {
        wait_ready(custody, PollEvents::POLLIN);
    }

    let n = custody.file.ops.read(custody.offset, buf)?;
    custody.offset += n as u64;
    Ok(n)
}

fn read_dirents(custody: &mut FileCustody, buf: &mut [u8]) -> KernelResult<usize> {
    let entry_size = core::mem::size_of::<DirectoryEntry>();
    let capacity = buf.len() / entry_size;
    if capacity == 0 {
        return Err(KernelError::InvalidArgument { name: "buffer" });
    }

    let mut produced = 0usize;
    while produced < capacity {
        let index = custody.offset as usize / entry_size + produced;
        match custody.file.ops.getdents(index)? {
            None => break,
            Some(entry) => {
                let at = produced * entry_size;
                // SAFETY: DirectoryEntry is plain old data and
                // `at + entry_size <= buf.len()` by the capacity bound.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        (&entry as *const DirectoryEntry).cast::<u8>(),
                        buf.as_mut_ptr().add(at),
                        entry_size,
                    );
                }
                produced += 1;
            }
        }
    }

    let bytes = produced * entry_size;
    custody.offset += bytes as u64;
    Ok(bytes)
}

/// Write to the custody at its seek position. Directories refuse writes;
/// blocking custodies wait for writability first.
pub fn write(custody: &mut FileCustody, buf: &[u8]) -> KernelResult<usize> {
    if custody.file.info.file_type == FileType::Directory {
        return Err(KernelError::InvalidArgument {
            name: "write to directory",
        });
    }
    if !custody.flags.writable() {
        return Err(KernelError::PermissionDenied { operation: "write" });
    }
    if !custody.flags.contains(OpenFlags::NONBLOCK) {
        wait_ready(custody, PollEvents::POLLOUT);
    }

    let n = custody.file.ops.write(custody.offset, buf)?;
    custody.offset += n as u64;
    Ok(n)
}

/// Move the custody's seek position; returns the new position.
pub fn seek(custody: &mut FileCustody, mode: SeekMode, offset: i32) -> KernelResult<u64> {
    let new_position = if custody.file.info.file_type == FileType::Directory {
        // Directory sizes are filesystem-private; allow free cursor moves.
        crate::fs::default_checked_seek(u32::MAX as u64, custody.offset, mode, offset)
    } else {
        custody
            .file
            .ops
            .seek(custody.offset, mode, offset, custody.file.info.size)?
    };
    custody.offset = new_position;
    Ok(new_position)
}

fn stat_of(info: &InodeInfo, nlink: u32) -> Stat {
    Stat {
        st_dev: 0,
        st_ino: info.id,
        st_type: info.file_type as u32,
        st_size: info.size,
        st_nlink: nlink,
        st_blksize: 512,
    }
}

/// Stat by path.
pub fn stat(path_str: &str) -> KernelResult<Stat> {
    match resolve(path_str)? {
        Resolution::Found { file, .. } => Ok(stat_of(&file.file.info, file.file.ref_count())),
        Resolution::MissingLast { .. } => Err(FsError::NotFound.into()),
    }
}

/// Stat an open custody.
pub fn fstat(custody: &FileCustody) -> Stat {
    stat_of(&custody.file.info, custody.file.ref_count())
}

/// Device-specific control on an open custody.
pub fn ioctl(custody: &FileCustody, request: u32, arg: u32) -> KernelResult<u32> {
    if custody.file.info.file_type == FileType::Directory {
        return Err(FsError::IsADirectory.into());
    }
    Ok(custody.file.ops.ioctl(request, arg)?)
}

/// Which of `events` are ready on the custody right now.
pub fn poll(custody: &FileCustody, events: PollEvents) -> PollEvents {
    custody.file.ops.poll(events)
}

/// Create a directory.
pub fn make_directory(path_str: &str) -> KernelResult<()> {
    match resolve(path_str)? {
        Resolution::Found { .. } => Err(KernelError::InvalidArgument {
            name: "path already exists",
        }),
        Resolution::MissingLast { parent, name } => {
            parent.file.ops.mkdir(&name)?;
            Ok(())
        }
    }
}

/// Remove an empty directory.
pub fn remove_directory(path_str: &str) -> KernelResult<()> {
    match resolve(path_str)? {
        Resolution::Found {
            parent: Some(parent),
            file,
            name: Some(name),
        } => {
            if file.file.info.file_type != FileType::Directory {
                return Err(FsError::NotADirectory.into());
            }
            Ok(parent.file.ops.rmdir(&name)?)
        }
        Resolution::Found { .. } => Err(KernelError::InvalidArgument {
            name: "cannot remove a mount root",
        }),
        Resolution::MissingLast { .. } => Err(FsError::NotFound.into()),
    }
}

/// Remove a non-directory entry.
pub fn unlink(path_str: &str) -> KernelResult<()> {
    match resolve(path_str)? {
        Resolution::Found {
            parent: Some(parent),
            file,
            name: Some(name),
        } => {
            if file.file.info.file_type == FileType::Directory {
                return Err(FsError::IsADirectory.into());
            }
            Ok(parent.file.ops.unlink(&name)?)
        }
        Resolution::Found { .. } => Err(KernelError::InvalidArgument {
            name: "cannot unlink a mount root",
        }),
        Resolution::MissingLast { .. } => Err(FsError::NotFound.into()),
    }
}

/// Hard-link `old_path` at `new_path`.
pub fn link(old_path: &str, new_path: &str) -> KernelResult<()> {
    let target = match resolve(old_path)? {
        Resolution::Found { file, .. } => file.file.info,
        Resolution::MissingLast { .. } => return Err(FsError::NotFound.into()),
    };
    match resolve(new_path)? {
        Resolution::Found { .. } => Err(KernelError::InvalidArgument {
            name: "link target exists",
        }),
        Resolution::MissingLast { parent, name } => {
            parent.file.ops.link(&name, &target)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::{string::String, vec, vec::Vec};
    use core::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::error::FsResult;
    use crate::fs::InodeOps;

    // -- A small in-memory filesystem implementing the VFS contract. ----

    struct MockNode {
        info: InodeInfo,
        data: Vec<u8>,
        children: Vec<(String, InodeId)>,
    }

    struct MockFsInner {
        nodes: Mutex<BTreeMap<InodeId, MockNode>>,
        next_id: AtomicU64,
        opens: AtomicU64,
        closes: AtomicU64,
    }

    struct MockFs {
        inner: Arc<MockFsInner>,
    }

    const ROOT_ID: InodeId = 1;

    impl MockFs {
        fn new() -> Self {
            let mut nodes = BTreeMap::new();
            nodes.insert(
                ROOT_ID,
                MockNode {
                    info: InodeInfo {
                        id: ROOT_ID,
                        file_type: FileType::Directory,
                        size: 0,
                        fs_data: 0,
                    },
                    data: Vec::new(),
                    children: Vec::new(),
                },
            );
            Self {
                inner: Arc::new(MockFsInner {
                    nodes: Mutex::new(nodes),
                    next_id: AtomicU64::new(2),
                    opens: AtomicU64::new(0),
                    closes: AtomicU64::new(0),
                }),
            }
        }

        fn add_file(&self, parent: InodeId, name: &str, contents: &[u8]) -> InodeId {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let mut nodes = self.inner.nodes.lock();
            nodes.insert(
                id,
                MockNode {
                    info: InodeInfo {
                        id,
                        file_type: FileType::RegularFile,
                        size: contents.len() as u64,
                        fs_data: 0,
                    },
                    data: contents.to_vec(),
                    children: Vec::new(),
                },
            );
            nodes
                .get_mut(&parent)
                .unwrap()
                .children
                .push((String::from(name), id));
            id
        }

        fn add_dir(&self, parent: InodeId, name: &str) -> InodeId {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let mut nodes = self.inner.nodes.lock();
            nodes.insert(
                id,
                MockNode {
                    info: InodeInfo {
                        id,
                        file_type: FileType::Directory,
                        size: 0,
                        fs_data: 0,
                    },
                    data: Vec::new(),
                    children: Vec::new(),
                },
            );
            nodes
                .get_mut(&parent)
                .unwrap()
                .children
                .push((String::from(name), id));
            id
        }
    }

    struct MockInode {
        fs: Arc<MockFsInner>,
        id: InodeId,
    }

    impl InodeOps for MockInode {
        fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
            let nodes = self.fs.nodes.lock();
            let node = nodes.get(&self.id).ok_or(FsError::NotFound)?;
            let start = (offset as usize).min(node.data.len());
            let n = buf.len().min(node.data.len() - start);
            buf[..n].copy_from_slice(&node.data[start..start + n]);
            Ok(n)
        }

        fn write(&self, offset: u64, buf: &[u8]) -> FsResult<usize> {
            let mut nodes = self.fs.nodes.lock();
            let node = nodes.get_mut(&self.id).ok_or(FsError::NotFound)?;
            let end = offset as usize + buf.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
                node.info.size = end as u64;
            }
            node.data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn lookup(&self, name: &str) -> FsResult<InodeInfo> {
            let nodes = self.fs.nodes.lock();
            let node = nodes.get(&self.id).ok_or(FsError::NotFound)?;
            let (_, child_id) = node
                .children
                .iter()
                .find(|(n, _)| n == name)
                .ok_or(FsError::NotFound)?;
            Ok(nodes.get(child_id).ok_or(FsError::NotFound)?.info)
        }

        fn create(&self, name: &str, file_type: FileType) -> FsResult<InodeInfo> {
            if file_type != FileType::RegularFile {
                return Err(FsError::NotSupported);
            }
            let id = self.fs.next_id.fetch_add(1, Ordering::Relaxed);
            let info = InodeInfo {
                id,
                file_type,
                size: 0,
                fs_data: 0,
            };
            let mut nodes = self.fs.nodes.lock();
            nodes.insert(
                id,
                MockNode {
                    info,
                    data: Vec::new(),
                    children: Vec::new(),
                },
            );
            nodes
                .get_mut(&self.id)
                .ok_or(FsError::NotFound)?
                .children
                .push((String::from(name), id));
            Ok(info)
        }

        fn getdents(&self, index: usize) -> FsResult<Option<DirectoryEntry>> {
            let nodes = self.fs.nodes.lock();
            let node = nodes.get(&self.id).ok_or(FsError::NotFound)?;
            Ok(node.children.get(index).map(|(name, id)| {
                let child = &nodes[id];
                DirectoryEntry::new(name, child.info.file_type, child.info.size, 0)
            }))
        }
    }

    impl Filesystem for MockFs {
        fn on_mount(&self) -> FsResult<InodeInfo> {
            Ok(self.inner.nodes.lock()[&ROOT_ID].info)
        }

        fn open_inode(&self, info: &InodeInfo) -> FsResult<Arc<dyn InodeOps>> {
            self.inner.opens.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(MockInode {
                fs: self.inner.clone(),
                id: info.id,
            }))
        }

        fn close_inode(&self, _info: &InodeInfo) -> FsResult<()> {
            self.inner.closes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn read_flags() -> OpenFlags {
        OpenFlags::READ | OpenFlags::NONBLOCK
    }

    // Each test mounts its own prefix; the mount table is global.

    #[test]
    fn test_open_read_close_is_repeatable() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "hello.txt", b"hello world");
        mount("/t-repeat", Arc::new(fs)).unwrap();

        for _ in 0..3 {
            let mut custody = open("/t-repeat/hello.txt", read_flags()).unwrap();
            let mut buf = [0u8; 32];
            let n = read(&mut custody, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello world");
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        mount("/t-missing", Arc::new(MockFs::new())).unwrap();
        let err = open("/t-missing/nope", read_flags()).unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::NotFound));
        // Missing intermediate component too.
        let err = open("/t-missing/no/such/dir", read_flags()).unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::NotFound));
    }

    #[test]
    fn test_directory_flag_enforcement() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "file", b"x");
        fs.add_dir(ROOT_ID, "dir");
        mount("/t-dirflag", Arc::new(fs)).unwrap();

        let err = open("/t-dirflag/dir", read_flags()).unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::IsADirectory));

        let err = open(
            "/t-dirflag/file",
            OpenFlags::READ | OpenFlags::DIRECTORY,
        )
        .unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::NotADirectory));

        assert!(open("/t-dirflag/dir", OpenFlags::READ | OpenFlags::DIRECTORY).is_ok());
    }

    #[test]
    fn test_traversal_through_file_fails() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "file", b"x");
        mount("/t-notdir", Arc::new(fs)).unwrap();

        let err = open("/t-notdir/file/child", read_flags()).unwrap_err();
        assert_eq!(err, KernelError::Fs(FsError::NotADirectory));
    }

    #[test]
    fn test_read_directory_entries() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "a.txt", b"aaaa");
        fs.add_dir(ROOT_ID, "subdir");
        mount("/t-dirents", Arc::new(fs)).unwrap();

        let mut custody =
            open("/t-dirents", OpenFlags::READ | OpenFlags::DIRECTORY).unwrap();

        let entry_size = core::mem::size_of::<DirectoryEntry>();
        let mut buf = vec![0u8; entry_size];
        let n = read(&mut custody, &mut buf).unwrap();
        assert_eq!(n, entry_size);
        // SAFETY: buffer holds one packed DirectoryEntry written by read.
        let entry = unsafe { *(buf.as_ptr() as *const DirectoryEntry) };
        assert_eq!(entry.name(), "a.txt");
        assert_eq!(entry.size, 4);

        let n = read(&mut custody, &mut buf).unwrap();
        assert_eq!(n, entry_size);
        let entry = unsafe { *(buf.as_ptr() as *const DirectoryEntry) };
        assert_eq!(entry.name(), "subdir");
        assert_eq!(entry.file_type, FileType::Directory as u32);

        // Past the end: EOF.
        assert_eq!(read(&mut custody, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_create_flag_creates_missing_file() {
        let fs = MockFs::new();
        mount("/t-create", Arc::new(fs)).unwrap();

        let flags = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::NONBLOCK;
        let mut custody = open("/t-create/new.txt", flags).unwrap();
        assert_eq!(write(&mut custody, b"fresh").unwrap(), 5);
        drop(custody);

        let mut custody = open("/t-create/new.txt", read_flags()).unwrap();
        let mut buf = [0u8; 8];
        let n = read(&mut custody, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"fresh");
    }

    #[test]
    fn test_open_files_share_one_cached_inode() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "shared", b"data");
        let inner = fs.inner.clone();
        mount("/t-shared", Arc::new(fs)).unwrap();

        let opens_before = inner.opens.load(Ordering::Relaxed);
        let a = open("/t-shared/shared", read_flags()).unwrap();
        let b = open("/t-shared/shared", read_flags()).unwrap();
        assert!(Arc::ptr_eq(&a.file, &b.file));
        assert_eq!(a.file.ref_count(), 2);
        // Second open was served from the cache.
        assert_eq!(inner.opens.load(Ordering::Relaxed), opens_before + 1);

        let closes_before = inner.closes.load(Ordering::Relaxed);
        drop(a);
        assert_eq!(inner.closes.load(Ordering::Relaxed), closes_before);
        drop(b);
        assert_eq!(inner.closes.load(Ordering::Relaxed), closes_before + 1);
    }

    #[test]
    fn test_seek_and_fstat() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "f", b"0123456789");
        mount("/t-seek", Arc::new(fs)).unwrap();

        let mut custody = open("/t-seek/f", read_flags()).unwrap();
        assert_eq!(seek(&mut custody, SeekMode::Set, 4).unwrap(), 4);
        let mut buf = [0u8; 2];
        read(&mut custody, &mut buf).unwrap();
        assert_eq!(&buf, b"45");

        assert_eq!(seek(&mut custody, SeekMode::End, 2).unwrap(), 8);
        assert_eq!(seek(&mut custody, SeekMode::Current, -100).unwrap(), 0);

        let st = fstat(&custody);
        assert_eq!(st.st_size, 10);
        assert_eq!(st.st_type, FileType::RegularFile as u32);
    }

    #[test]
    fn test_longest_prefix_mount_wins() {
        let outer = MockFs::new();
        outer.add_file(ROOT_ID, "marker", b"outer");
        // A directory that the inner mount will shadow.
        let shadow = outer.add_dir(ROOT_ID, "inner");
        outer.add_file(shadow, "marker", b"outer-inner");
        mount("/t-nested", Arc::new(outer)).unwrap();

        let inner = MockFs::new();
        inner.add_file(ROOT_ID, "marker", b"inner");
        mount("/t-nested/inner", Arc::new(inner)).unwrap();

        let mut buf = [0u8; 16];
        let mut custody = open("/t-nested/marker", read_flags()).unwrap();
        let n = read(&mut custody, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"outer");

        let mut custody = open("/t-nested/inner/marker", read_flags()).unwrap();
        let n = read(&mut custody, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"inner");
    }

    #[test]
    fn test_write_to_directory_is_refused() {
        let fs = MockFs::new();
        mount("/t-dirwrite", Arc::new(fs)).unwrap();
        let mut custody =
            open("/t-dirwrite", OpenFlags::WRITE | OpenFlags::DIRECTORY).unwrap();
        assert!(write(&mut custody, b"nope").is_err());
    }

    #[test]
    fn test_stat_by_path() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "st", b"abcde");
        mount("/t-stat", Arc::new(fs)).unwrap();

        let st = stat("/t-stat/st").unwrap();
        assert_eq!(st.st_size, 5);
        assert_eq!(stat("/t-stat/none").unwrap_err(), KernelError::Fs(FsError::NotFound));
    }

    #[test]
    fn test_duplicate_shares_file_and_refcount() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "dup", b"zz");
        mount("/t-dup", Arc::new(fs)).unwrap();

        let custody = open("/t-dup/dup", read_flags()).unwrap();
        let copy = custody.duplicate();
        assert_eq!(custody.file.ref_count(), 2);
        assert!(Arc::ptr_eq(&custody.file, &copy.file));
        drop(custody);
        assert_eq!(copy.file.ref_count(), 1);
    }

    #[test]
    fn test_access_mode_enforcement() {
        let fs = MockFs::new();
        fs.add_file(ROOT_ID, "ro", b"x");
        mount("/t-mode", Arc::new(fs)).unwrap();

        let mut readonly = open("/t-mode/ro", read_flags()).unwrap();
        assert!(write(&mut readonly, b"y").is_err());

        let mut writeonly =
            open("/t-mode/ro", OpenFlags::WRITE | OpenFlags::NONBLOCK).unwrap();
        let mut buf = [0u8; 4];
        assert!(read(&mut writeonly, &mut buf).is_err());
    }
}
