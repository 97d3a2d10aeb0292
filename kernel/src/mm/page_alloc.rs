//! Physical page allocator.
//!
//! A buddy allocator over three orders (1 KiB, 4 KiB, 16 KiB). One
//! descriptor exists per 1 KiB of RAM, holding a reference count and an
//! intrusive link used only while the page sits on a free list; the
//! descriptor array lives immediately above the kernel image. 16 KiB is
//! the root order (one L1 table) and never coalesces further.
//!
//! A page is in one of three states: Free (on the free list of its order,
//! refcount 0), InUse (refcount >= 1) or Reserved (kernel image, the
//! descriptor array itself, hardware holes). Descriptors never move, so a
//! [`PageHandle`] stays valid for the lifetime of the page.
//!
//! Free lists are mutated only under IRQ-disabled critical sections; the
//! module-level functions take care of that.

use crate::{
    error::{KernelError, KernelResult},
    mm::{round_down, round_up, PhysicalAddress, KIB},
    sync::{GlobalState, IrqGuard},
};

/// Descriptor granularity: one per 1 KiB of RAM.
pub const PAGE_UNIT: u32 = KIB;

/// Free-list link sentinel.
const NO_PAGE: u32 = u32::MAX;
/// `ref_count` value of a Reserved page.
const RESERVED: i32 = -1;

/// The three buddy orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    /// 1 KiB: L2 tables.
    OneKib,
    /// 4 KiB: small pages, kernel stacks.
    FourKib,
    /// 16 KiB: L1 tables; the root order.
    SixteenKib,
}

impl PageOrder {
    pub const fn size(self) -> u32 {
        match self {
            Self::OneKib => KIB,
            Self::FourKib => 4 * KIB,
            Self::SixteenKib => 16 * KIB,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::OneKib => 0,
            Self::FourKib => 1,
            Self::SixteenKib => 2,
        }
    }

    fn larger(self) -> Option<Self> {
        match self {
            Self::OneKib => Some(Self::FourKib),
            Self::FourKib => Some(Self::SixteenKib),
            Self::SixteenKib => None,
        }
    }

    fn smaller(self) -> Option<Self> {
        match self {
            Self::OneKib => None,
            Self::FourKib => Some(Self::OneKib),
            Self::SixteenKib => Some(Self::FourKib),
        }
    }

    /// Descriptor-index stride between adjacent pages of this order.
    fn stride(self) -> u32 {
        self.size() / PAGE_UNIT
    }
}

/// Per-1 KiB page descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalPage {
    ref_count: i32,
    next: u32,
}

impl PhysicalPage {
    pub const fn unused() -> Self {
        Self {
            ref_count: 0,
            next: NO_PAGE,
        }
    }
}

/// Stable handle to a physical page: its descriptor index, which is also
/// its physical address in 1 KiB units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle(u32);

impl PageHandle {
    pub const fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_UNIT)
    }

    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self(addr.as_u32() / PAGE_UNIT)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Snapshot of allocator health for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStatistics {
    pub free_1k: usize,
    pub free_4k: usize,
    pub free_16k: usize,
    pub total_allocations: u64,
}

pub struct PageAllocator {
    pages: &'static mut [PhysicalPage],
    free_lists: [u32; 3],
    total_allocations: u64,
}

impl PageAllocator {
    /// Build the allocator over a descriptor arena.
    ///
    /// `pages` must have one entry per 1 KiB of managed RAM (the caller
    /// rounds RAM down to 16 KiB first). Everything below
    /// `first_free_addr` is marked Reserved; the rest is enqueued on the
    /// 16 KiB free list.
    pub fn build(pages: &'static mut [PhysicalPage], first_free_addr: u32) -> Self {
        let mut allocator = Self {
            pages,
            free_lists: [NO_PAGE; 3],
            total_allocations: 0,
        };

        let first_free_addr = round_up(first_free_addr, PageOrder::SixteenKib.size());
        let first_free = first_free_addr / PAGE_UNIT;
        for page in allocator.pages.iter_mut() {
            *page = PhysicalPage::unused();
        }
        for idx in 0..first_free.min(allocator.pages.len() as u32) {
            allocator.pages[idx as usize].ref_count = RESERVED;
        }

        // Enqueue from the top down so the list head ends up at the
        // lowest address.
        let stride = PageOrder::SixteenKib.stride();
        let blocks = allocator.pages.len() as u32 / stride;
        for block in (0..blocks).rev() {
            let idx = block * stride;
            if idx >= first_free {
                allocator.push_free(idx, PageOrder::SixteenKib);
            }
        }

        allocator
    }

    fn push_free(&mut self, idx: u32, order: PageOrder) {
        debug_assert_eq!(self.pages[idx as usize].next, NO_PAGE);
        debug_assert_eq!(self.pages[idx as usize].ref_count, 0);
        self.pages[idx as usize].next = self.free_lists[order.index()];
        self.free_lists[order.index()] = idx;
    }

    fn pop_free(&mut self, order: PageOrder) -> u32 {
        let idx = self.free_lists[order.index()];
        debug_assert_ne!(idx, NO_PAGE);
        self.free_lists[order.index()] = self.pages[idx as usize].next;
        self.pages[idx as usize].next = NO_PAGE;
        debug_assert_eq!(self.pages[idx as usize].ref_count, 0);
        idx
    }

    fn is_on_free_list(&self, idx: u32, order: PageOrder) -> bool {
        let mut cursor = self.free_lists[order.index()];
        while cursor != NO_PAGE {
            if cursor == idx {
                return true;
            }
            cursor = self.pages[cursor as usize].next;
        }
        false
    }

    fn remove_from_free_list(&mut self, idx: u32, order: PageOrder) {
        let head = self.free_lists[order.index()];
        if head == idx {
            self.free_lists[order.index()] = self.pages[idx as usize].next;
            self.pages[idx as usize].next = NO_PAGE;
            return;
        }
        let mut prev = head;
        while prev != NO_PAGE {
            let next = self.pages[prev as usize].next;
            if next == idx {
                self.pages[prev as usize].next = self.pages[idx as usize].next;
                self.pages[idx as usize].next = NO_PAGE;
                return;
            }
            prev = next;
        }
        panic!("page {} not on free list of its order", idx);
    }

    /// Split one page of `order` into its four buddies one order down.
    fn split_into_buddies(&mut self, idx: u32, order: PageOrder) {
        let chunk = order.smaller().expect("cannot split the smallest order");
        for i in 0..4 {
            self.push_free(idx + i * chunk.stride(), chunk);
        }
    }

    fn alloc_order(&mut self, order: PageOrder) -> KernelResult<u32> {
        if self.free_lists[order.index()] == NO_PAGE {
            let bigger = order.larger().ok_or(KernelError::OutOfMemory)?;
            let big = self.alloc_order(bigger)?;
            self.split_into_buddies(big, bigger);
        }
        Ok(self.pop_free(order))
    }

    /// Allocate a page of the given order with refcount 1.
    pub fn alloc(&mut self, order: PageOrder) -> KernelResult<PageHandle> {
        let idx = self.alloc_order(order)?;
        self.pages[idx as usize].ref_count = 1;
        self.total_allocations += 1;
        Ok(PageHandle(idx))
    }

    /// Take an extra reference to an InUse page (a new mapping).
    pub fn inc_ref(&mut self, handle: PageHandle) {
        let page = &mut self.pages[handle.index()];
        assert!(page.ref_count >= 1, "inc_ref on a page that is not in use");
        page.ref_count += 1;
    }

    pub fn ref_count(&self, handle: PageHandle) -> i32 {
        self.pages[handle.index()].ref_count
    }

    /// Drop one reference; the last reference releases the page, buddies
    /// permitting coalescing upward.
    pub fn free(&mut self, handle: PageHandle, order: PageOrder) {
        let page = &mut self.pages[handle.index()];
        assert!(page.ref_count >= 1, "free of a page that is not in use");
        page.ref_count -= 1;
        if page.ref_count == 0 {
            self.release(handle.0, order);
        }
    }

    fn release(&mut self, idx: u32, order: PageOrder) {
        let Some(bigger) = order.larger() else {
            // The root order never coalesces.
            self.push_free(idx, order);
            return;
        };

        let stride = order.stride();
        let first = round_down(idx, 4 * stride);

        let mut all_buddies_free = true;
        for i in 0..4 {
            let buddy = first + i * stride;
            if buddy == idx {
                continue;
            }
            if !self.is_on_free_list(buddy, order) {
                all_buddies_free = false;
                break;
            }
        }

        if !all_buddies_free {
            self.push_free(idx, order);
            return;
        }

        for i in 0..4 {
            let buddy = first + i * stride;
            if buddy != idx {
                self.remove_from_free_list(buddy, order);
            }
        }
        self.release(first, bigger);
    }

    /// Mark a physical range Reserved, pulling any covering free blocks
    /// off their lists. Pages already in use cannot be reserved.
    pub fn reserve_range(&mut self, start: PhysicalAddress, end: PhysicalAddress) {
        let first = start.as_u32() / PAGE_UNIT;
        let last = round_up(end.as_u32(), PAGE_UNIT) / PAGE_UNIT;

        let root = PageOrder::SixteenKib;
        let stride = root.stride();
        let mut block = round_down(first, stride);
        while block < last.min(self.pages.len() as u32) {
            if self.is_on_free_list(block, root) {
                self.remove_from_free_list(block, root);
            }
            block += stride;
        }

        for idx in first..last.min(self.pages.len() as u32) {
            let page = &mut self.pages[idx as usize];
            assert!(page.ref_count <= 0, "reserving a page that is in use");
            page.ref_count = RESERVED;
        }
    }

    fn free_count(&self, order: PageOrder) -> usize {
        let mut count = 0;
        let mut cursor = self.free_lists[order.index()];
        while cursor != NO_PAGE {
            count += 1;
            cursor = self.pages[cursor as usize].next;
        }
        count
    }

    pub fn statistics(&self) -> PageStatistics {
        PageStatistics {
            free_1k: self.free_count(PageOrder::OneKib),
            free_4k: self.free_count(PageOrder::FourKib),
            free_16k: self.free_count(PageOrder::SixteenKib),
            total_allocations: self.total_allocations,
        }
    }
}

static PAGE_ALLOCATOR: GlobalState<PageAllocator> = GlobalState::new();

/// Initialize the global allocator over detected RAM.
///
/// Places the descriptor array at `kernel_end_phys` (viewed through the
/// physical-memory hole) and reserves everything up to the end of the
/// array.
///
/// # Safety
/// `kernel_end_phys` must point past all boot-time allocations and the
/// physical-memory hole must already map `total_memory_size` bytes.
pub unsafe fn init(total_memory_size: u32, kernel_end_phys: u32) -> KernelResult<()> {
    let total = round_down(total_memory_size, PageOrder::SixteenKib.size());
    let len = (total / PAGE_UNIT) as usize;

    let descriptors_phys = round_up(kernel_end_phys, 16);
    let base = PhysicalAddress::new(descriptors_phys)
        .to_virt()
        .as_mut_ptr::<PhysicalPage>();
    let pages = unsafe { core::slice::from_raw_parts_mut(base, len) };

    let array_end = descriptors_phys + (len * core::mem::size_of::<PhysicalPage>()) as u32;
    let allocator = PageAllocator::build(pages, array_end);

    PAGE_ALLOCATOR
        .init(allocator)
        .map_err(|_| KernelError::NotInitialized {
            subsystem: "page allocator reinitialized",
        })
}

fn with_allocator<R>(f: impl FnOnce(&mut PageAllocator) -> R) -> KernelResult<R> {
    let _irq = IrqGuard::new();
    PAGE_ALLOCATOR
        .with_mut(f)
        .ok_or(KernelError::NotInitialized {
            subsystem: "page allocator",
        })
}

/// Allocate a physical page of the given order (refcount 1).
pub fn alloc(order: PageOrder) -> KernelResult<PageHandle> {
    with_allocator(|a| a.alloc(order))?
}

/// Drop one reference to a page, releasing it at refcount zero.
pub fn free(handle: PageHandle, order: PageOrder) {
    let _ = with_allocator(|a| a.free(handle, order));
}

/// Take an extra reference to a page (one per mapping).
pub fn inc_ref(handle: PageHandle) {
    let _ = with_allocator(|a| a.inc_ref(handle));
}

/// Current refcount of a page, for assertions and diagnostics.
pub fn ref_count(handle: PageHandle) -> i32 {
    with_allocator(|a| a.ref_count(handle)).unwrap_or(0)
}

/// Mark a physical range Reserved (hardware holes, carved-out pools).
pub fn reserve_range(start: PhysicalAddress, end: PhysicalAddress) {
    let _ = with_allocator(|a| a.reserve_range(start, end));
}

/// Allocator counters for diagnostics.
pub fn statistics() -> PageStatistics {
    with_allocator(|a| a.statistics()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{boxed::Box, vec};

    use super::*;

    /// An allocator over `blocks` 16 KiB blocks, none reserved.
    fn test_allocator(blocks: usize) -> PageAllocator {
        let arena = Box::leak(vec![PhysicalPage::unused(); blocks * 16].into_boxed_slice());
        PageAllocator::build(arena, 0)
    }

    #[test]
    fn test_alloc_sets_refcount() {
        let mut alloc = test_allocator(4);
        let page = alloc.alloc(PageOrder::FourKib).unwrap();
        assert_eq!(alloc.ref_count(page), 1);
    }

    #[test]
    fn test_small_alloc_splits_root() {
        let mut alloc = test_allocator(1);
        let stats = alloc.statistics();
        assert_eq!(stats.free_16k, 1);

        let _page = alloc.alloc(PageOrder::FourKib).unwrap();
        let stats = alloc.statistics();
        assert_eq!(stats.free_16k, 0);
        assert_eq!(stats.free_4k, 3);
    }

    #[test]
    fn test_one_kib_alloc_splits_twice() {
        let mut alloc = test_allocator(1);
        let _page = alloc.alloc(PageOrder::OneKib).unwrap();
        let stats = alloc.statistics();
        assert_eq!(stats.free_4k, 3);
        assert_eq!(stats.free_1k, 3);
    }

    #[test]
    fn test_free_coalesces_back_to_root() {
        // Scenario: split one 16 KiB block into four 4 KiB buddies, free
        // them all, and the next 16 KiB allocation lands on the original
        // physical address.
        let mut alloc = test_allocator(1);
        let original = alloc.alloc(PageOrder::SixteenKib).unwrap();
        alloc.free(original, PageOrder::SixteenKib);

        let mut pages = [None; 4];
        for slot in pages.iter_mut() {
            *slot = Some(alloc.alloc(PageOrder::FourKib).unwrap());
        }
        assert_eq!(alloc.statistics().free_16k, 0);

        for slot in pages.iter().flatten() {
            alloc.free(*slot, PageOrder::FourKib);
        }
        assert_eq!(alloc.statistics().free_16k, 1);
        assert_eq!(alloc.statistics().free_4k, 0);

        let again = alloc.alloc(PageOrder::SixteenKib).unwrap();
        assert_eq!(again.addr(), original.addr());
    }

    #[test]
    fn test_exhaustion_fails_without_panicking() {
        let mut alloc = test_allocator(2);
        assert!(alloc.alloc(PageOrder::SixteenKib).is_ok());
        assert!(alloc.alloc(PageOrder::SixteenKib).is_ok());
        assert_eq!(
            alloc.alloc(PageOrder::SixteenKib),
            Err(KernelError::OutOfMemory)
        );
        // Smaller orders have nothing left to split either.
        assert_eq!(alloc.alloc(PageOrder::OneKib), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn test_shared_page_survives_partial_free() {
        let mut alloc = test_allocator(1);
        let page = alloc.alloc(PageOrder::FourKib).unwrap();
        alloc.inc_ref(page);
        assert_eq!(alloc.ref_count(page), 2);

        alloc.free(page, PageOrder::FourKib);
        assert_eq!(alloc.ref_count(page), 1);
        assert_eq!(alloc.statistics().free_4k, 3);

        alloc.free(page, PageOrder::FourKib);
        assert_eq!(alloc.statistics().free_16k, 1);
    }

    #[test]
    fn test_alloc_free_cycle_does_not_leak() {
        // Repeated alloc/free of the same order keeps succeeding at least
        // as long as it did the first time.
        let mut alloc = test_allocator(2);
        for _ in 0..100 {
            let a = alloc.alloc(PageOrder::FourKib).unwrap();
            let b = alloc.alloc(PageOrder::OneKib).unwrap();
            alloc.free(a, PageOrder::FourKib);
            alloc.free(b, PageOrder::OneKib);
        }
        assert_eq!(alloc.statistics().free_16k, 2);
    }

    #[test]
    fn test_reserved_prefix_is_not_handed_out() {
        let arena = Box::leak(vec![PhysicalPage::unused(); 2 * 16].into_boxed_slice());
        // First 16 KiB reserved for the "kernel image".
        let mut alloc = PageAllocator::build(arena, 16 * KIB);
        assert_eq!(alloc.statistics().free_16k, 1);
        let page = alloc.alloc(PageOrder::SixteenKib).unwrap();
        assert_eq!(page.addr().as_u32(), 16 * KIB);
    }

    #[test]
    fn test_reserve_range_removes_free_block() {
        let mut alloc = test_allocator(2);
        alloc.reserve_range(PhysicalAddress::new(0), PhysicalAddress::new(16 * KIB));
        assert_eq!(alloc.statistics().free_16k, 1);
        let page = alloc.alloc(PageOrder::SixteenKib).unwrap();
        assert_eq!(page.addr().as_u32(), 16 * KIB);
    }

    #[test]
    fn test_handle_addr_roundtrip() {
        let handle = PageHandle::from_addr(PhysicalAddress::new(0x0002_8000));
        assert_eq!(handle.addr().as_u32(), 0x0002_8000);
    }
}
