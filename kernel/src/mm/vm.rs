//! Virtual memory: address spaces, mappings and the temporary-mapping
//! window.
//!
//! Every process owns a 16 KiB L1 table. The upper half (from
//! `0xE000_0000`) is shared: the canonical kernel translation table is the
//! single source of truth there, and per-process tables either carry a
//! copy of its entries (taken at creation) or acquire them lazily through
//! the page-fault repair path. The lower half is private to the process.
//!
//! The first 1 MiB of every address space is owned by the kernel: it
//! carries the exception vector table at virtual address 0. User mappings
//! are rejected there.
//!
//! Page tables live in physical pages that are not, in general, mapped
//! anywhere. All table manipulation goes through [`TempMapping`], a scoped
//! window over a reserved 1 MiB of kernel address space backed by one
//! shared L2 table.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch,
    error::{KernelError, KernelResult},
    mm::{
        areas,
        page_alloc::{self, PageHandle, PageOrder},
        page_table::{
            lvl1_index, lvl2_index, AccessPermissions, FirstLevelEntry, SecondLevelEntry,
            LVL1_ENTRIES, LVL1_TABLE_SIZE, LVL2_ENTRIES, LVL2_TABLE_SIZE,
        },
        round_up, PhysicalAddress, VirtualAddress, SECTION_SIZE,
    },
    sync::{IrqGuard, OnceLock},
};

/// Classification of a page fault, decided from the faulting address and
/// the active translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultOutcome {
    /// A missing kernel-half L1 entry was copied from the canonical table;
    /// the faulting instruction can be retried.
    Fixed,
    /// The fault is the process's own doing; terminate it.
    ProcessFatal,
    /// The kernel faulted on something it cannot repair; panic.
    KernelFatal,
}

/// Handle to one process's translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    /// The 16 KiB physical page holding the L1 table.
    pub ttbr0: PageHandle,
}

static KERNEL_SPACE: OnceLock<AddressSpace> = OnceLock::new();
/// Descriptor index of the currently active L1 table page.
static CURRENT_TTBR0_PAGE: AtomicU32 = AtomicU32::new(0);

/// The address space every kernel-half mapping is mirrored into.
pub fn kernel_address_space() -> AddressSpace {
    *KERNEL_SPACE.get().expect("vm not initialized")
}

/// The address space the MMU is walking right now.
pub fn current_address_space() -> AddressSpace {
    AddressSpace {
        ttbr0: PageHandle::from_addr(PhysicalAddress::new(
            CURRENT_TTBR0_PAGE.load(Ordering::Relaxed),
        )),
    }
}

/// Activate `space` on the MMU.
pub fn switch_address_space(space: &AddressSpace) {
    // SAFETY: the kernel half of every address space mirrors the canonical
    // table, so the executing code stays mapped across the switch.
    unsafe { arch::write_ttbr0(space.ttbr0.addr().as_u32()) };
    CURRENT_TTBR0_PAGE.store(space.ttbr0.addr().as_u32(), Ordering::Relaxed);
    arch::invalidate_tlb();
}

// ---------------------------------------------------------------------------
// Temporary mapping window
// ---------------------------------------------------------------------------

#[repr(C, align(1024))]
struct TempTable([SecondLevelEntry; LVL2_ENTRIES]);

struct TempTableCell(core::cell::UnsafeCell<TempTable>);

// SAFETY: all access happens on the single CPU under an IRQ-disabled
// critical section held by TempMapping.
unsafe impl Sync for TempTableCell {}

/// The shared L2 table backing the temporary-mappings area.
static TEMP_TABLE: TempTableCell = TempTableCell(core::cell::UnsafeCell::new(TempTable(
    [SecondLevelEntry::EMPTY; LVL2_ENTRIES],
)));

fn temp_table_entries() -> *mut SecondLevelEntry {
    TEMP_TABLE.0.get() as *mut SecondLevelEntry
}

/// A scoped mapping of physical memory into the temporary window.
///
/// Finds a contiguous run of free slots at construction, releases them on
/// drop. IRQs stay masked for the whole scope so nested acquisitions
/// cannot overlap with an interrupt handler's.
pub struct TempMapping {
    first_slot: usize,
    slot_count: usize,
    virt: VirtualAddress,
    _irq: IrqGuard,
}

impl TempMapping {
    /// Map `size` bytes starting at `phys` (any alignment).
    pub fn new(phys: PhysicalAddress, size: u32) -> Self {
        let irq = IrqGuard::new();

        // 1 KiB objects (L2 tables) are not 4 KiB aligned; cover the
        // containing pages and point into the middle.
        let offset = phys.as_u32() % 4096;
        let base = phys.as_u32() - offset;
        let needed = (round_up(size + offset, 4096) / 4096) as usize;

        let entries = temp_table_entries();
        let first = Self::find_free_run(entries, needed)
            .unwrap_or_else(|| panic!("no room in temporary mapping window for {} pages", needed));

        for i in 0..needed {
            let entry = SecondLevelEntry::small_page(
                base + (i as u32) * 4096,
                AccessPermissions::KernelOnly,
            );
            // SAFETY: slot bounds checked by find_free_run; exclusive
            // access guaranteed by the IRQ guard on this single CPU.
            unsafe { entries.add(first + i).write_volatile(entry) };
            arch::invalidate_tlb_entry(areas::TEMP_MAPPINGS.start + ((first + i) as u32) * 4096);
        }

        Self {
            first_slot: first,
            slot_count: needed,
            virt: VirtualAddress::new(
                areas::TEMP_MAPPINGS.start + (first as u32) * 4096 + offset,
            ),
            _irq: irq,
        }
    }

    fn find_free_run(entries: *const SecondLevelEntry, needed: usize) -> Option<usize> {
        let mut start = 0;
        while start + needed <= LVL2_ENTRIES {
            let mut all_free = true;
            for i in 0..needed {
                // SAFETY: in-bounds read of the static table.
                if !unsafe { entries.add(start + i).read_volatile() }.is_empty() {
                    all_free = false;
                    start += i + 1;
                    break;
                }
            }
            if all_free {
                return Some(start);
            }
        }
        None
    }

    /// The mapped bytes, as a typed pointer.
    pub fn ptr<T>(&self) -> *mut T {
        self.virt.as_mut_ptr()
    }
}

impl Drop for TempMapping {
    fn drop(&mut self) {
        let entries = temp_table_entries();
        for i in self.first_slot..self.first_slot + self.slot_count {
            // SAFETY: releasing slots this mapping installed.
            unsafe { entries.add(i).write_volatile(SecondLevelEntry::EMPTY) };
            arch::invalidate_tlb_entry(areas::TEMP_MAPPINGS.start + (i as u32) * 4096);
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Physical address of a kernel-image static (the image is offset-mapped
/// into the higher half).
fn kernel_static_phys<T>(ptr: *const T) -> u32 {
    (ptr as usize as u32).wrapping_sub(areas::HIGHER_HALF_START)
}

fn canonical_table() -> *mut FirstLevelEntry {
    kernel_address_space().ttbr0.addr().to_virt().as_mut_ptr()
}

/// Adopt the boot-built translation table as the kernel address space and
/// hook the temporary-mappings L2 table into it.
pub fn init() -> KernelResult<()> {
    let ttbr0 = arch::read_ttbr0();
    let space = AddressSpace {
        ttbr0: PageHandle::from_addr(PhysicalAddress::new(ttbr0)),
    };
    KERNEL_SPACE
        .set(space)
        .map_err(|_| KernelError::NotInitialized {
            subsystem: "vm reinitialized",
        })?;
    CURRENT_TTBR0_PAGE.store(ttbr0, Ordering::Relaxed);

    let table = canonical_table();
    let temp_phys = kernel_static_phys(TEMP_TABLE.0.get());
    // SAFETY: the canonical table is mapped through the physical-memory
    // hole; the temp-mappings slot is ours to install.
    unsafe {
        table
            .add(lvl1_index(areas::TEMP_MAPPINGS.start))
            .write_volatile(FirstLevelEntry::coarse_table(temp_phys));
    }
    arch::invalidate_tlb();
    Ok(())
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Peripheral window physical base; board-configured, BCM2835 default.
static PERIPHERAL_PHYS_BASE: AtomicU32 = AtomicU32::new(0x2000_0000);

/// Configure where the peripherals window points in physical space.
pub fn set_peripheral_phys_base(base: u32) {
    PERIPHERAL_PHYS_BASE.store(base, Ordering::Relaxed);
}

/// Translate a kernel virtual address to physical.
///
/// Kernel image and peripherals translate by fixed offsets; anything else
/// walks the canonical table (through the temporary window for L2 reads).
/// `None` when nothing is mapped there.
pub fn virt2phys(virt: VirtualAddress) -> Option<PhysicalAddress> {
    let v = virt.as_u32();
    if areas::KERNEL_IMAGE.contains(v) {
        return Some(PhysicalAddress::new(v - areas::HIGHER_HALF_START));
    }
    if areas::PERIPHERALS.contains(v) {
        let base = PERIPHERAL_PHYS_BASE.load(Ordering::Relaxed);
        return Some(PhysicalAddress::new(v - areas::PERIPHERALS.start + base));
    }

    let table = canonical_table();
    // SAFETY: the canonical table is permanently mapped through the hole.
    let entry = unsafe { table.add(lvl1_index(v)).read_volatile() };
    translate_with_entry(entry, v)
}

/// Translate a virtual address through an arbitrary address space.
pub fn virt2phys_in(space: &AddressSpace, virt: VirtualAddress) -> Option<PhysicalAddress> {
    let v = virt.as_u32();
    let entry = if is_kernel_space(space) || areas::HIGHER_HALF.contains(v) {
        let table = canonical_table();
        // SAFETY: permanently mapped through the hole.
        unsafe { table.add(lvl1_index(v)).read_volatile() }
    } else {
        let l1 = TempMapping::new(space.ttbr0.addr(), LVL1_TABLE_SIZE);
        // SAFETY: the L1 table is mapped for the scope of `l1`.
        unsafe {
            l1.ptr::<FirstLevelEntry>()
                .add(lvl1_index(v))
                .read_volatile()
        }
    };
    translate_with_entry(entry, v)
}

fn translate_with_entry(entry: FirstLevelEntry, v: u32) -> Option<PhysicalAddress> {
    if entry.is_empty() {
        return None;
    }
    if entry.is_section() {
        return Some(PhysicalAddress::new(entry.section_base() | (v & 0x000F_FFFF)));
    }
    let l2 = TempMapping::new(
        PhysicalAddress::new(entry.coarse_table_base()),
        LVL2_TABLE_SIZE,
    );
    // SAFETY: the L2 table is mapped for the scope of `l2`.
    let entry = unsafe { l2.ptr::<SecondLevelEntry>().add(lvl2_index(v)).read_volatile() };
    if entry.is_empty() {
        None
    } else {
        Some(PhysicalAddress::new(entry.page_base() | (v & 0x0000_0FFF)))
    }
}

// ---------------------------------------------------------------------------
// Address space lifecycle
// ---------------------------------------------------------------------------

fn is_kernel_space(space: &AddressSpace) -> bool {
    space.ttbr0 == kernel_address_space().ttbr0
}

/// Create a fresh address space: empty user half, kernel half snapshotted
/// from the canonical table (entries appearing later arrive through the
/// page-fault repair path).
pub fn create_address_space() -> KernelResult<AddressSpace> {
    let ttbr0 = page_alloc::alloc(PageOrder::SixteenKib)?;
    let space = AddressSpace { ttbr0 };

    let mapped = TempMapping::new(ttbr0.addr(), LVL1_TABLE_SIZE);
    let table = mapped.ptr::<FirstLevelEntry>();
    let canonical = canonical_table();
    // SAFETY: `table` is a freshly mapped 16 KiB L1; `canonical` is
    // permanently mapped through the hole.
    unsafe {
        for i in 0..LVL1_ENTRIES {
            table.add(i).write_volatile(FirstLevelEntry::EMPTY);
        }
        for i in lvl1_index(areas::HIGHER_HALF.start)..LVL1_ENTRIES {
            table.add(i).write_volatile(canonical.add(i).read_volatile());
        }
        // The exception vector table at virtual address 0 must be reachable
        // from every address space or the CPU faults recursively trying to
        // fetch the fault vector.
        table.write_volatile(canonical.read_volatile());
    }

    Ok(space)
}

/// Tear down a process's address space: every user mapping is dropped,
/// empty L2 tables and the L1 page itself are returned to the allocator.
pub fn free_address_space(space: AddressSpace) {
    assert!(
        !is_kernel_space(&space),
        "attempted to free the kernel address space"
    );

    let l1 = TempMapping::new(space.ttbr0.addr(), LVL1_TABLE_SIZE);
    let table = l1.ptr::<FirstLevelEntry>();
    // Slot 0 holds the shared vector-table entry, never process memory.
    for idx in 1..lvl1_index(areas::USER.end) {
        // SAFETY: in-bounds read of the mapped L1.
        let entry = unsafe { table.add(idx).read_volatile() };
        if !entry.is_coarse_table() {
            continue;
        }
        let l2_phys = PhysicalAddress::new(entry.coarse_table_base());
        {
            let l2 = TempMapping::new(l2_phys, LVL2_TABLE_SIZE);
            for slot in 0..LVL2_ENTRIES {
                // SAFETY: in-bounds read of the mapped L2.
                let page = unsafe { l2.ptr::<SecondLevelEntry>().add(slot).read_volatile() };
                if !page.is_empty() {
                    page_alloc::free(
                        PageHandle::from_addr(PhysicalAddress::new(page.page_base())),
                        PageOrder::FourKib,
                    );
                }
            }
        }
        page_alloc::free(PageHandle::from_addr(l2_phys), PageOrder::OneKib);
    }
    drop(l1);
    page_alloc::free(space.ttbr0, PageOrder::SixteenKib);
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Install one small-page mapping in the table at `table` (virtual).
///
/// `is_canonical` marks the canonical kernel table, whose kernel-half L1
/// entries must be mirrored when a secondary table grows one.
unsafe fn map_page_in_table(
    table: *mut FirstLevelEntry,
    is_canonical: bool,
    phys: PhysicalAddress,
    virt: VirtualAddress,
    perms: AccessPermissions,
) -> KernelResult<()> {
    let v = virt.as_u32();
    let slot = unsafe { table.add(lvl1_index(v)) };
    let mut entry = unsafe { slot.read_volatile() };
    if entry.is_section() {
        panic!("mapping over a section at 0x{:08x}", v);
    }

    let mut fresh_l2 = false;
    if entry.is_empty() {
        let l2_page = page_alloc::alloc(PageOrder::OneKib)?;
        entry = FirstLevelEntry::coarse_table(l2_page.addr().as_u32());
        unsafe { slot.write_volatile(entry) };

        // The canonical table stays the source of truth for the kernel
        // half; secondary tables may only mirror it, never lead it.
        if areas::HIGHER_HALF.contains(v) && !is_canonical {
            let canonical = canonical_table();
            let canonical_slot = unsafe { canonical.add(lvl1_index(v)) };
            assert!(
                unsafe { canonical_slot.read_volatile() }.is_empty(),
                "secondary table diverging from the canonical kernel table at 0x{:08x}",
                v
            );
            unsafe { canonical_slot.write_volatile(entry) };
        }
        fresh_l2 = true;
    }

    let l2 = TempMapping::new(
        PhysicalAddress::new(entry.coarse_table_base()),
        LVL2_TABLE_SIZE,
    );
    let entries = l2.ptr::<SecondLevelEntry>();
    if fresh_l2 {
        for i in 0..LVL2_ENTRIES {
            unsafe { entries.add(i).write_volatile(SecondLevelEntry::EMPTY) };
        }
    }

    let l2_slot = unsafe { entries.add(lvl2_index(v)) };
    let existing = unsafe { l2_slot.read_volatile() };
    if !existing.is_empty() {
        panic!(
            "mapping already exists at 0x{:08x} (to 0x{:08x})",
            v,
            existing.page_base()
        );
    }
    unsafe { l2_slot.write_volatile(SecondLevelEntry::small_page(phys.as_u32(), perms)) };
    arch::invalidate_tlb_entry(v);
    Ok(())
}

fn map_phys(
    space: &AddressSpace,
    phys: PhysicalAddress,
    virt: VirtualAddress,
    perms: AccessPermissions,
) -> KernelResult<()> {
    if virt.as_u32() < SECTION_SIZE {
        // The first section belongs to the vector table window.
        return Err(KernelError::InvalidAddress { addr: virt.as_u32() });
    }

    if is_kernel_space(space) {
        // Fast path: the canonical table is reachable through the hole.
        // SAFETY: permanently mapped, exclusive under the single CPU.
        return unsafe { map_page_in_table(canonical_table(), true, phys, virt, perms) };
    }

    let l1 = TempMapping::new(space.ttbr0.addr(), LVL1_TABLE_SIZE);
    // SAFETY: the L1 is mapped for the scope of `l1`.
    unsafe { map_page_in_table(l1.ptr(), false, phys, virt, perms) }
}

/// Map a RAM page at `virt`, taking a reference to it.
pub fn map(
    space: &AddressSpace,
    page: PageHandle,
    virt: VirtualAddress,
    perms: AccessPermissions,
) -> KernelResult<()> {
    map_phys(space, page.addr(), virt, perms)?;
    page_alloc::inc_ref(page);
    Ok(())
}

/// Map a device MMIO range (no RAM pages, no refcounting), kernel-only.
pub fn map_mmio(
    space: &AddressSpace,
    phys: PhysicalAddress,
    virt: VirtualAddress,
    size: u32,
) -> KernelResult<()> {
    let pages = round_up(size, 4096) / 4096;
    for i in 0..pages {
        map_phys(
            space,
            PhysicalAddress::new(phys.as_u32() + i * 4096),
            VirtualAddress::new(virt.as_u32() + i * 4096),
            AccessPermissions::KernelOnly,
        )?;
    }
    Ok(())
}

/// Remove the mapping at `virt`, dropping the mapped page's reference.
///
/// An L2 table left empty by the removal is freed, unless the address is
/// in the shared kernel half (other address spaces may hold the entry).
/// Returns the page that was mapped.
pub fn unmap(space: &AddressSpace, virt: VirtualAddress) -> KernelResult<PageHandle> {
    let v = virt.as_u32();
    if areas::TEMP_MAPPINGS.contains(v) {
        panic!("unmap inside the temporary mapping window (0x{:08x})", v);
    }

    let phys = if areas::HIGHER_HALF.contains(v) || is_kernel_space(space) {
        // SAFETY: canonical table is permanently mapped.
        unsafe { unmap_in_table(canonical_table(), v)? }
    } else {
        let l1 = TempMapping::new(space.ttbr0.addr(), LVL1_TABLE_SIZE);
        // SAFETY: mapped for the scope of `l1`.
        unsafe { unmap_in_table(l1.ptr(), v)? }
    };

    let handle = PageHandle::from_addr(phys);
    page_alloc::free(handle, PageOrder::FourKib);
    Ok(handle)
}

unsafe fn unmap_in_table(table: *mut FirstLevelEntry, v: u32) -> KernelResult<PhysicalAddress> {
    let slot = unsafe { table.add(lvl1_index(v)) };
    let entry = unsafe { slot.read_volatile() };
    if entry.is_section() {
        panic!("unmap of a section mapping at 0x{:08x}", v);
    }
    if entry.is_empty() {
        return Err(KernelError::UnmappedMemory { addr: v });
    }

    let l2_phys = PhysicalAddress::new(entry.coarse_table_base());
    let mut table_now_empty = true;
    let phys;
    {
        let l2 = TempMapping::new(l2_phys, LVL2_TABLE_SIZE);
        let entries = l2.ptr::<SecondLevelEntry>();
        let l2_slot = unsafe { entries.add(lvl2_index(v)) };
        let page = unsafe { l2_slot.read_volatile() };
        if page.is_empty() {
            return Err(KernelError::UnmappedMemory { addr: v });
        }
        phys = PhysicalAddress::new(page.page_base());
        unsafe { l2_slot.write_volatile(SecondLevelEntry::EMPTY) };
        arch::invalidate_tlb_entry(v);

        for i in 0..LVL2_ENTRIES {
            if !unsafe { entries.add(i).read_volatile() }.is_empty() {
                table_now_empty = false;
                break;
            }
        }
    }

    // Kernel-half L2 tables are shared across address spaces and are
    // never torn down.
    if table_now_empty && !areas::HIGHER_HALF.contains(v) {
        page_alloc::free(PageHandle::from_addr(l2_phys), PageOrder::OneKib);
        unsafe { slot.write_volatile(FirstLevelEntry::EMPTY) };
    }

    Ok(phys)
}

/// Install the exception vector page at virtual address 0 in the
/// canonical kernel table. The first-section guard in [`map`] exists
/// precisely because this slot is kernel-owned; this is the one mapping
/// that lives there.
pub fn map_vector_page(page: PageHandle) -> KernelResult<()> {
    // SAFETY: the canonical table is permanently mapped through the hole.
    unsafe {
        map_page_in_table(
            canonical_table(),
            true,
            page.addr(),
            VirtualAddress::new(0),
            AccessPermissions::KernelOnly,
        )?;
    }
    page_alloc::inc_ref(page);
    Ok(())
}

/// Map a 1 MiB section directly in the canonical kernel table (heap
/// growth).
pub fn map_kernel_section(phys: PhysicalAddress, virt: VirtualAddress) -> KernelResult<()> {
    debug_assert_eq!(phys.as_u32() % SECTION_SIZE, 0);
    debug_assert_eq!(virt.as_u32() % SECTION_SIZE, 0);
    let table = canonical_table();
    let slot = unsafe { table.add(lvl1_index(virt.as_u32())) };
    // SAFETY: canonical table is permanently mapped.
    if !unsafe { slot.read_volatile() }.is_empty() {
        return Err(KernelError::InvalidAddress { addr: virt.as_u32() });
    }
    unsafe {
        slot.write_volatile(FirstLevelEntry::section(
            phys.as_u32(),
            AccessPermissions::KernelOnly,
        ))
    };
    arch::invalidate_tlb_entry(virt.as_u32());
    Ok(())
}

/// Remove a 1 MiB kernel section mapping; returns its physical base.
pub fn unmap_kernel_section(virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
    let table = canonical_table();
    let slot = unsafe { table.add(lvl1_index(virt.as_u32())) };
    // SAFETY: canonical table is permanently mapped.
    let entry = unsafe { slot.read_volatile() };
    if !entry.is_section() {
        return Err(KernelError::UnmappedMemory { addr: virt.as_u32() });
    }
    unsafe { slot.write_volatile(FirstLevelEntry::EMPTY) };
    arch::invalidate_tlb_entry(virt.as_u32());
    Ok(PhysicalAddress::new(entry.section_base()))
}

// ---------------------------------------------------------------------------
// User memory access
// ---------------------------------------------------------------------------

/// Copy kernel bytes into `space` at `dst`.
pub fn copy_to_user(space: &AddressSpace, dst: u32, src: &[u8]) -> KernelResult<()> {
    if space.ttbr0 == current_address_space().ttbr0 {
        // SAFETY: the destination is mapped in the active address space;
        // the syscall layer has already bounds-checked the user range.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst as usize as *mut u8, src.len())
        };
        return Ok(());
    }
    each_user_chunk(space, dst, src.len(), |chunk_ptr, copied, len| {
        // SAFETY: chunk_ptr covers `len` bytes temp-mapped from the target
        // address space.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(copied), chunk_ptr, len);
        }
    })
}

/// Copy bytes out of `space` at `src`.
pub fn copy_from_user(space: &AddressSpace, src: u32, dst: &mut [u8]) -> KernelResult<()> {
    if space.ttbr0 == current_address_space().ttbr0 {
        // SAFETY: as in copy_to_user.
        unsafe {
            core::ptr::copy_nonoverlapping(src as usize as *const u8, dst.as_mut_ptr(), dst.len())
        };
        return Ok(());
    }
    let dst_ptr = dst.as_mut_ptr();
    each_user_chunk(space, src, dst.len(), |chunk_ptr, copied, len| {
        // SAFETY: chunk_ptr covers `len` temp-mapped bytes; dst is a
        // kernel slice of sufficient length.
        unsafe {
            core::ptr::copy_nonoverlapping(chunk_ptr, dst_ptr.add(copied), len);
        }
    })
}

/// Fill `len` bytes at `dst` inside `space`.
pub fn memset_user(space: &AddressSpace, dst: u32, value: u8, len: usize) -> KernelResult<()> {
    if space.ttbr0 == current_address_space().ttbr0 {
        // SAFETY: as in copy_to_user.
        unsafe { core::ptr::write_bytes(dst as usize as *mut u8, value, len) };
        return Ok(());
    }
    each_user_chunk(space, dst, len, |chunk_ptr, _copied, chunk_len| {
        // SAFETY: chunk_ptr covers `chunk_len` temp-mapped bytes.
        unsafe { core::ptr::write_bytes(chunk_ptr, value, chunk_len) };
    })
}

/// Walk `[va, va + len)` in `space` page by page, temp-mapping each
/// backing frame and handing `f` a pointer to it.
fn each_user_chunk(
    space: &AddressSpace,
    va: u32,
    len: usize,
    mut f: impl FnMut(*mut u8, usize, usize),
) -> KernelResult<()> {
    let mut done = 0usize;
    while done < len {
        let addr = va + done as u32;
        let page_off = addr % 4096;
        let chunk = core::cmp::min(len - done, (4096 - page_off) as usize);
        let phys = virt2phys_in(space, VirtualAddress::new(addr))
            .ok_or(KernelError::UnmappedMemory { addr })?;
        let mapped = TempMapping::new(phys, chunk as u32);
        f(mapped.ptr::<u8>(), done, chunk);
        done += chunk;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// fork support
// ---------------------------------------------------------------------------

/// Duplicate every user-half mapping of `parent` into `child` with
/// freshly copied pages. After return the two address spaces share no
/// writable state.
pub fn fork_copy(parent: &AddressSpace, child: &AddressSpace) -> KernelResult<()> {
    let l1 = TempMapping::new(parent.ttbr0.addr(), LVL1_TABLE_SIZE);
    let table = l1.ptr::<FirstLevelEntry>();

    for idx in 1..lvl1_index(areas::USER.end) {
        // SAFETY: in-bounds read of the mapped parent L1.
        let entry = unsafe { table.add(idx).read_volatile() };
        if !entry.is_coarse_table() {
            continue;
        }

        for slot in 0..LVL2_ENTRIES {
            let page = {
                let l2 = TempMapping::new(
                    PhysicalAddress::new(entry.coarse_table_base()),
                    LVL2_TABLE_SIZE,
                );
                // SAFETY: in-bounds read of the mapped parent L2.
                unsafe { l2.ptr::<SecondLevelEntry>().add(slot).read_volatile() }
            };
            if page.is_empty() {
                continue;
            }

            let va = ((idx as u32) << 20) | ((slot as u32) << 12);
            let copy = page_alloc::alloc(PageOrder::FourKib)?;
            {
                let src = TempMapping::new(PhysicalAddress::new(page.page_base()), 4096);
                let dst = TempMapping::new(copy.addr(), 4096);
                // SAFETY: both sides are freshly temp-mapped 4 KiB frames.
                unsafe {
                    core::ptr::copy_nonoverlapping(src.ptr::<u8>(), dst.ptr::<u8>(), 4096)
                };
            }
            map(child, copy, VirtualAddress::new(va), page.permissions())?;
            // The mapping now holds the page's reference.
            page_alloc::free(copy, PageOrder::FourKib);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Page fault triage
// ---------------------------------------------------------------------------

/// Decide what a data/prefetch abort at `fault_addr` means.
pub fn try_fix_page_fault(fault_addr: u32) -> PageFaultOutcome {
    let active_ttbr0 = arch::read_ttbr0();
    if active_ttbr0 == kernel_address_space().ttbr0.addr().as_u32() {
        // The kernel's own table has no one to lazily inherit from.
        return PageFaultOutcome::KernelFatal;
    }

    // No swap: a user-half fault is the process's bug.
    if !areas::HIGHER_HALF.contains(fault_addr) {
        return PageFaultOutcome::ProcessFatal;
    }

    let canonical = canonical_table();
    // SAFETY: canonical table is permanently mapped.
    let canonical_entry = unsafe { canonical.add(lvl1_index(fault_addr)).read_volatile() };
    if canonical_entry.is_empty() {
        return PageFaultOutcome::KernelFatal;
    }

    let l1 = TempMapping::new(PhysicalAddress::new(active_ttbr0), LVL1_TABLE_SIZE);
    // SAFETY: the active L1 is mapped for the scope of `l1`.
    let slot = unsafe { l1.ptr::<FirstLevelEntry>().add(lvl1_index(fault_addr)) };
    if unsafe { slot.read_volatile() }.is_empty() {
        // The process's table predates this kernel mapping; copy it over.
        unsafe { slot.write_volatile(canonical_entry) };
        arch::invalidate_tlb_entry(fault_addr);
        return PageFaultOutcome::Fixed;
    }

    PageFaultOutcome::KernelFatal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_temp_table() {
        let entries = temp_table_entries();
        for i in 0..LVL2_ENTRIES {
            unsafe { entries.add(i).write_volatile(SecondLevelEntry::EMPTY) };
        }
    }

    // The temp window is a global; exercising it from one test avoids
    // cross-test interference.
    #[test]
    fn test_temp_mapping_slot_accounting() {
        reset_temp_table();

        let occupied = |entries: *const SecondLevelEntry| {
            (0..LVL2_ENTRIES)
                .filter(|&i| !unsafe { entries.add(i).read_volatile() }.is_empty())
                .count()
        };

        let entries = temp_table_entries();

        // A 1 KiB object in the middle of a frame still maps one page and
        // the pointer lands at the right offset.
        {
            let small = TempMapping::new(PhysicalAddress::new(0x0001_2400), LVL2_TABLE_SIZE);
            assert_eq!(occupied(entries), 1);
            assert_eq!(small.ptr::<u8>() as usize as u32 % 4096, 0x400);

            // A 16 KiB table needs four contiguous slots alongside.
            let table = TempMapping::new(PhysicalAddress::new(0x0004_0000), LVL1_TABLE_SIZE);
            assert_eq!(occupied(entries), 5);
            assert_eq!(table.ptr::<u8>() as usize as u32 % 4096, 0);
        }

        // Scope exit released everything.
        assert_eq!(occupied(entries), 0);

        // Released slots are found again.
        let again = TempMapping::new(PhysicalAddress::new(0x0000_8000), 4096);
        assert_eq!(occupied(entries), 1);
        assert!(areas::TEMP_MAPPINGS.contains(again.ptr::<u8>() as usize as u32));
        drop(again);
        assert_eq!(occupied(entries), 0);
    }
}
