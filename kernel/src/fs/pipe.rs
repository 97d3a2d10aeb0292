//! In-kernel pipes.
//!
//! A pipe is a fixed-capacity byte ring shared by two custodies with
//! disjoint directions. The ring itself never blocks: short reads and
//! writes are returned, and the custody layer's poll loop supplies the
//! blocking semantics. Read and write indices are only touched with IRQs
//! masked.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::{
    error::{FsError, FsResult},
    fs::{
        file::{FileCustody, OpenFile},
        FileType, InodeInfo, InodeOps, OpenFlags, PollEvents,
    },
    sync::IrqGuard,
};

/// Ring capacity in bytes.
pub const PIPE_CAPACITY: usize = 1024;

/// The byte ring. One slot is sacrificed to distinguish full from empty.
struct PipeRing {
    data: [u8; PIPE_CAPACITY + 1],
    rd: usize,
    wr: usize,
}

impl PipeRing {
    const fn new() -> Self {
        Self {
            data: [0; PIPE_CAPACITY + 1],
            rd: 0,
            wr: 0,
        }
    }

    fn len(&self) -> usize {
        if self.wr >= self.rd {
            self.wr - self.rd
        } else {
            self.data.len() - (self.rd - self.wr)
        }
    }

    fn available(&self) -> usize {
        self.data.len() - 1 - self.len()
    }

    fn pop_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len());
        for byte in buf.iter_mut().take(n) {
            *byte = self.data[self.rd];
            self.rd = (self.rd + 1) % self.data.len();
        }
        n
    }

    fn push_from(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.available());
        for &byte in buf.iter().take(n) {
            self.data[self.wr] = byte;
            self.wr = (self.wr + 1) % self.data.len();
        }
        n
    }
}

/// Shared state behind both pipe ends.
struct PipeState {
    ring: Mutex<PipeRing>,
    /// Live read-end files.
    readers: AtomicU32,
    /// Live write-end files.
    writers: AtomicU32,
}

impl PipeState {
    fn with_ring<R>(&self, f: impl FnOnce(&mut PipeRing) -> R) -> R {
        let _irq = IrqGuard::new();
        f(&mut self.ring.lock())
    }
}

/// The read end of a pipe.
struct PipeReadEnd {
    state: Arc<PipeState>,
}

impl InodeOps for PipeReadEnd {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        // Empty ring: EOF if the write side is gone, otherwise a zero
        // read (the custody layer blocks before getting here).
        Ok(self.state.with_ring(|ring| ring.pop_into(buf)))
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::POLLIN) {
            let has_data = self.state.with_ring(|ring| ring.len() > 0);
            if has_data || self.state.writers.load(Ordering::Acquire) == 0 {
                ready |= PollEvents::POLLIN;
            }
        }
        ready
    }

    fn on_last_close(&self) {
        self.state.readers.fetch_sub(1, Ordering::Release);
    }
}

/// The write end of a pipe.
struct PipeWriteEnd {
    state: Arc<PipeState>,
}

impl InodeOps for PipeWriteEnd {
    fn write(&self, _offset: u64, buf: &[u8]) -> FsResult<usize> {
        if self.state.readers.load(Ordering::Acquire) == 0 {
            // Nobody will ever drain this.
            return Err(FsError::EndOfData);
        }
        Ok(self.state.with_ring(|ring| ring.push_from(buf)))
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if events.contains(PollEvents::POLLOUT) {
            let has_space = self.state.with_ring(|ring| ring.available() > 0);
            if has_space || self.state.readers.load(Ordering::Acquire) == 0 {
                ready |= PollEvents::POLLOUT;
            }
        }
        ready
    }

    fn on_last_close(&self) {
        self.state.writers.fetch_sub(1, Ordering::Release);
    }
}

fn pipe_inode_info(id: u64) -> InodeInfo {
    InodeInfo {
        id,
        file_type: FileType::Pipe,
        size: 0,
        fs_data: 0,
    }
}

/// Create a pipe: `(read_end, write_end)` custodies over a fresh ring.
///
/// The ring lives as long as either end's file does; dropping the last
/// write custody makes the read end return EOF once drained.
pub fn create_pipe() -> (FileCustody, FileCustody) {
    let state = Arc::new(PipeState {
        ring: Mutex::new(PipeRing::new()),
        readers: AtomicU32::new(1),
        writers: AtomicU32::new(1),
    });

    let read_file = Arc::new(OpenFile::new(
        pipe_inode_info(0),
        Arc::new(PipeReadEnd {
            state: state.clone(),
        }),
        None,
    ));
    let write_file = Arc::new(OpenFile::new(
        pipe_inode_info(1),
        Arc::new(PipeWriteEnd { state }),
        None,
    ));

    (
        FileCustody::new(read_file, OpenFlags::READ),
        FileCustody::new(write_file, OpenFlags::WRITE),
    )
}

#[cfg(test)]
mod tests {
    use crate::fs::vfs;

    use super::*;

    #[test]
    fn test_ring_wraps_and_counts() {
        let mut ring = PipeRing::new();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.available(), PIPE_CAPACITY);

        assert_eq!(ring.push_from(b"abc"), 3);
        assert_eq!(ring.len(), 3);

        let mut buf = [0u8; 2];
        assert_eq!(ring.pop_into(&mut buf), 2);
        assert_eq!(&buf, b"ab");
        assert_eq!(ring.len(), 1);

        // Force wrap-around.
        let big = [7u8; PIPE_CAPACITY];
        let pushed = ring.push_from(&big);
        assert_eq!(pushed, PIPE_CAPACITY - 1);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_ring_rejects_overfill() {
        let mut ring = PipeRing::new();
        let big = [1u8; PIPE_CAPACITY + 100];
        assert_eq!(ring.push_from(&big), PIPE_CAPACITY);
        assert_eq!(ring.push_from(b"more"), 0);
    }

    #[test]
    fn test_pipe_round_trip() {
        let (mut rx, mut tx) = create_pipe();
        assert_eq!(vfs::write(&mut tx, b"abc").unwrap(), 3);

        let mut buf = [0u8; 3];
        assert_eq!(vfs::read(&mut rx, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_reads_never_exceed_writes() {
        let (mut rx, mut tx) = create_pipe();
        let mut total_written = 0;
        let mut total_read = 0;

        for chunk in [&b"one"[..], b"two2", b"three"] {
            total_written += vfs::write(&mut tx, chunk).unwrap();
        }
        let mut buf = [0u8; 64];
        // NONBLOCK not needed: data is already there.
        total_read += vfs::read(&mut rx, &mut buf[..4]).unwrap();
        total_read += vfs::read(&mut rx, &mut buf).unwrap();
        assert!(total_read <= total_written);
        assert_eq!(total_read, total_written);
        // Second read started after "onet" was consumed.
        assert_eq!(&buf[..8], b"wo2three");
    }

    #[test]
    fn test_directions_are_enforced() {
        let (mut rx, mut tx) = create_pipe();
        let mut buf = [0u8; 4];
        assert!(vfs::read(&mut tx, &mut buf).is_err());
        assert!(vfs::write(&mut rx, b"x").is_err());
    }

    #[test]
    fn test_eof_after_writer_closes() {
        let (mut rx, tx) = create_pipe();
        {
            let mut tx = tx;
            vfs::write(&mut tx, b"last words").unwrap();
        } // write end dropped here

        let mut buf = [0u8; 32];
        let n = vfs::read(&mut rx, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"last words");
        // Drained and the writer is gone: EOF, not a block.
        assert_eq!(vfs::read(&mut rx, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_after_reader_closes_fails() {
        let (rx, mut tx) = create_pipe();
        drop(rx);
        assert!(vfs::write(&mut tx, b"void").is_err());
    }
}
