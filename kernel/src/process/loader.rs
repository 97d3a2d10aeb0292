//! ELF32 executable loading.
//!
//! Validates the identification bytes (32-bit, little-endian, current
//! version), the machine (ARM) and the type (executable), then maps and
//! copies every `PT_LOAD` segment into the target address space.

use alloc::vec;
use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    fs::{vfs, OpenFlags},
    mm::{
        page_alloc::{self, PageOrder},
        page_table::AccessPermissions,
        round_down, round_up,
        vm::{self, AddressSpace},
        VirtualAddress,
    },
};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_ARM: u16 = 40;
const PT_LOAD: u32 = 1;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// One `PT_LOAD` program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub offset: u32,
    pub vaddr: u32,
    pub file_size: u32,
    pub mem_size: u32,
}

/// The parts of a validated ELF image the loader cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfImage {
    pub entry: u32,
    pub segments: Vec<LoadSegment>,
}

/// Validate `bytes` as an ARM ELF32 executable.
pub fn parse(bytes: &[u8]) -> KernelResult<ElfImage> {
    if bytes.len() < EHDR_SIZE {
        return Err(KernelError::NotExecutable);
    }
    if bytes[0..4] != ELF_MAGIC {
        return Err(KernelError::NotExecutable);
    }
    if bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2LSB || bytes[6] != EV_CURRENT {
        return Err(KernelError::NotSupported {
            operation: "non-ARM32 ELF image",
        });
    }
    if read_u16(bytes, 16) != ET_EXEC {
        return Err(KernelError::NotExecutable);
    }
    if read_u16(bytes, 18) != EM_ARM {
        return Err(KernelError::NotSupported {
            operation: "foreign-machine ELF image",
        });
    }

    let entry = read_u32(bytes, 24);
    let phoff = read_u32(bytes, 28) as usize;
    let phnum = read_u16(bytes, 44) as usize;

    let mut segments = Vec::new();
    for i in 0..phnum {
        let at = phoff + i * PHDR_SIZE;
        if at + PHDR_SIZE > bytes.len() {
            return Err(KernelError::NotExecutable);
        }
        if read_u32(bytes, at) != PT_LOAD {
            continue;
        }
        segments.push(LoadSegment {
            offset: read_u32(bytes, at + 4),
            vaddr: read_u32(bytes, at + 8),
            file_size: read_u32(bytes, at + 16),
            mem_size: read_u32(bytes, at + 20),
        });
    }

    Ok(ElfImage { entry, segments })
}

/// Map and populate every load segment of `bytes` in `space`.
///
/// Each segment gets freshly allocated, zero-filled 4 KiB pages covering
/// `[vaddr, vaddr + mem_size)`, then `file_size` bytes copied from the
/// image. Returns the entry point.
pub fn load_into(space: &AddressSpace, bytes: &[u8], privileged: bool) -> KernelResult<u32> {
    let image = parse(bytes)?;
    let perms = if privileged {
        AccessPermissions::KernelOnly
    } else {
        AccessPermissions::UserFullAccess
    };

    for segment in &image.segments {
        let start = round_down(segment.vaddr, 4096);
        let end = round_up(
            segment
                .vaddr
                .checked_add(segment.mem_size)
                .ok_or(KernelError::NotExecutable)?,
            4096,
        );

        for addr in (start..end).step_by(4096) {
            let page = page_alloc::alloc(PageOrder::FourKib)?;
            vm::map(space, page, VirtualAddress::new(addr), perms)?;
            // The mapping keeps the page alive.
            page_alloc::free(page, PageOrder::FourKib);
            vm::memset_user(space, addr, 0, 4096)?;
        }

        let file_end = segment.offset as usize + segment.file_size as usize;
        if file_end > bytes.len() {
            return Err(KernelError::NotExecutable);
        }
        if segment.file_size != 0 {
            vm::copy_to_user(
                space,
                segment.vaddr,
                &bytes[segment.offset as usize..file_end],
            )?;
        }
    }

    log::debug!("loaded ELF image, entry 0x{:08x}", image.entry);
    Ok(image.entry)
}

/// Load the executable at `path` into `space`.
pub fn load_from_path(path: &str, space: &AddressSpace, privileged: bool) -> KernelResult<u32> {
    let mut custody = vfs::open(path, OpenFlags::READ)?;
    let size = vfs::fstat(&custody).st_size as usize;

    let mut bytes = vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = vfs::read(&mut custody, &mut bytes[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }

    load_into(space, &bytes[..read], privileged)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal ELF32 executable image with one load segment.
    fn sample_elf(machine: u16, class: u8, entry: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; EHDR_SIZE + PHDR_SIZE + 16];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = class;
        bytes[5] = ELFDATA2LSB;
        bytes[6] = EV_CURRENT;
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes[24..28].copy_from_slice(&entry.to_le_bytes());
        bytes[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // phoff
        bytes[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let ph = EHDR_SIZE;
        bytes[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        bytes[ph + 4..ph + 8].copy_from_slice(&((EHDR_SIZE + PHDR_SIZE) as u32).to_le_bytes());
        bytes[ph + 8..ph + 12].copy_from_slice(&0x0010_0000u32.to_le_bytes()); // vaddr
        bytes[ph + 16..ph + 20].copy_from_slice(&16u32.to_le_bytes()); // filesz
        bytes[ph + 20..ph + 24].copy_from_slice(&64u32.to_le_bytes()); // memsz
        bytes
    }

    #[test]
    fn test_parse_accepts_valid_image() {
        let image = parse(&sample_elf(EM_ARM, ELFCLASS32, 0x0010_0000)).unwrap();
        assert_eq!(image.entry, 0x0010_0000);
        assert_eq!(image.segments.len(), 1);
        let seg = image.segments[0];
        assert_eq!(seg.vaddr, 0x0010_0000);
        assert_eq!(seg.file_size, 16);
        assert_eq!(seg.mem_size, 64);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = sample_elf(EM_ARM, ELFCLASS32, 0);
        bytes[0] = 0x7e;
        assert_eq!(parse(&bytes), Err(KernelError::NotExecutable));
    }

    #[test]
    fn test_parse_rejects_wrong_class() {
        let bytes = sample_elf(EM_ARM, 2, 0); // ELFCLASS64
        assert!(matches!(
            parse(&bytes),
            Err(KernelError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_foreign_machine() {
        let bytes = sample_elf(62, ELFCLASS32, 0); // EM_X86_64
        assert!(matches!(
            parse(&bytes),
            Err(KernelError::NotSupported { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_executable() {
        let mut bytes = sample_elf(EM_ARM, ELFCLASS32, 0);
        bytes[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(parse(&bytes), Err(KernelError::NotExecutable));
    }

    #[test]
    fn test_parse_rejects_truncated_image() {
        let bytes = sample_elf(EM_ARM, ELFCLASS32, 0);
        assert_eq!(parse(&bytes[..40]), Err(KernelError::NotExecutable));
        // Program header table past the end.
        let mut bytes = sample_elf(EM_ARM, ELFCLASS32, 0);
        bytes[28..32].copy_from_slice(&0xFFFF_0000u32.to_le_bytes());
        assert_eq!(parse(&bytes), Err(KernelError::NotExecutable));
    }

    #[test]
    fn test_non_load_segments_are_skipped() {
        let mut bytes = sample_elf(EM_ARM, ELFCLASS32, 0);
        let ph = EHDR_SIZE;
        bytes[ph..ph + 4].copy_from_slice(&4u32.to_le_bytes()); // PT_NOTE
        let image = parse(&bytes).unwrap();
        assert!(image.segments.is_empty());
    }
}
