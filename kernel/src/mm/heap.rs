//! Kernel heap.
//!
//! A contiguous virtual region above the temporary-mappings window, grown
//! (and shrunk) by whole 1 MiB sections mapped directly in the canonical
//! kernel table. A program break tracks the in-use end; [`sbrk`] moves it
//! and maps or unmaps sections when it crosses a section boundary.
//!
//! Backing sections come from a physical pool carved off the top of RAM
//! at init (the three-order buddy cannot mint contiguous megabytes; the
//! pool range is reserved out of the page allocator so the two never
//! hand out the same frame).
//!
//! On top of `sbrk` sits the global allocator: a `linked_list_allocator`
//! heap seeded with the first section and extended as the break grows.

use core::{
    alloc::{GlobalAlloc, Layout},
    sync::atomic::{AtomicBool, Ordering},
};

use linked_list_allocator::LockedHeap;

use crate::{
    error::{KernelError, KernelResult},
    mm::{areas, page_alloc, round_down, round_up, vm, PhysicalAddress, VirtualAddress, MIB,
        SECTION_SIZE},
    sync::GlobalState,
};

/// Upper bound on pool size: 512 sections (512 MiB).
const MAX_SECTIONS: usize = 512;

/// Physical 1 MiB section pool.
struct SectionPool {
    base: u32,
    count: usize,
    in_use: [bool; MAX_SECTIONS],
}

impl SectionPool {
    fn new(base: u32, count: usize) -> Self {
        debug_assert_eq!(base % SECTION_SIZE, 0);
        debug_assert!(count <= MAX_SECTIONS);
        Self {
            base,
            count,
            in_use: [false; MAX_SECTIONS],
        }
    }

    fn alloc(&mut self) -> KernelResult<PhysicalAddress> {
        for (idx, used) in self.in_use.iter_mut().take(self.count).enumerate() {
            if !*used {
                *used = true;
                return Ok(PhysicalAddress::new(self.base + (idx as u32) * SECTION_SIZE));
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn free(&mut self, section: PhysicalAddress) -> KernelResult<()> {
        let offset = section.as_u32().wrapping_sub(self.base);
        let idx = (offset / SECTION_SIZE) as usize;
        if offset % SECTION_SIZE != 0 || idx >= self.count || !self.in_use[idx] {
            return Err(KernelError::InvalidArgument { name: "section" });
        }
        self.in_use[idx] = false;
        Ok(())
    }
}

struct HeapState {
    pool: SectionPool,
    /// Current program break.
    brk: u32,
    /// Virtual address up to which sections are mapped.
    mapped_end: u32,
}

static HEAP_STATE: GlobalState<HeapState> = GlobalState::new();

/// Carve the physical section pool out of RAM and map the first heap
/// section.
///
/// When RAM extends past the physical-memory hole, the pool is exactly
/// that excess (the buddy cannot reach it anyway). On small boards the
/// pool is the top quarter of RAM, reserved out of the buddy.
pub fn init(ram_size: u32) -> KernelResult<()> {
    let hole_covered = crate::mm::areas::KERNEL_IMAGE.len();
    let (pool_base, pool_bytes) = if ram_size > hole_covered {
        let base = hole_covered;
        let bytes =
            round_down(ram_size - base, SECTION_SIZE).min((MAX_SECTIONS as u32) * SECTION_SIZE);
        (base, bytes)
    } else {
        let bytes = round_down(ram_size / 4, SECTION_SIZE).clamp(MIB, hole_covered);
        let base = round_down(ram_size - bytes, SECTION_SIZE);
        page_alloc::reserve_range(
            PhysicalAddress::new(base),
            PhysicalAddress::new(base + bytes),
        );
        (base, bytes)
    };

    HEAP_STATE
        .init(HeapState {
            pool: SectionPool::new(pool_base, (pool_bytes / SECTION_SIZE) as usize),
            brk: areas::HEAP.start,
            mapped_end: areas::HEAP.start,
        })
        .map_err(|_| KernelError::NotInitialized {
            subsystem: "heap reinitialized",
        })?;

    // Seed the allocator with one mapped section.
    let old = sbrk(SECTION_SIZE as i32)?;
    debug_assert_eq!(old.as_u32(), areas::HEAP.start);
    KERNEL_HEAP.seed(areas::HEAP.start, SECTION_SIZE as usize);
    Ok(())
}

/// Move the program break to `new_brk`, mapping or unmapping whole
/// sections as the break crosses section boundaries.
pub fn brk(new_brk: u32) -> KernelResult<()> {
    if !(areas::HEAP.start..=areas::HEAP.end).contains(&new_brk) {
        return Err(KernelError::InvalidArgument { name: "new_brk" });
    }

    HEAP_STATE
        .with_mut(|state| {
            let target = round_up(new_brk, SECTION_SIZE);

            while state.mapped_end < target {
                let section = state.pool.alloc()?;
                if let Err(e) = vm::map_kernel_section(section, VirtualAddress::new(state.mapped_end))
                {
                    let _ = state.pool.free(section);
                    return Err(e);
                }
                state.mapped_end += SECTION_SIZE;
            }

            while state.mapped_end >= target + SECTION_SIZE {
                let last = state.mapped_end - SECTION_SIZE;
                let section = vm::unmap_kernel_section(VirtualAddress::new(last))?;
                state.pool.free(section)?;
                state.mapped_end = last;
            }

            state.brk = new_brk;
            Ok(())
        })
        .unwrap_or(Err(KernelError::NotInitialized { subsystem: "heap" }))
}

/// Grow (or shrink, with a negative `delta`) the break. Returns the old
/// break.
pub fn sbrk(delta: i32) -> KernelResult<VirtualAddress> {
    let old = HEAP_STATE
        .with(|state| state.brk)
        .ok_or(KernelError::NotInitialized { subsystem: "heap" })?;
    let new_brk = if delta >= 0 {
        old.checked_add(delta as u32)
    } else {
        old.checked_sub(delta.unsigned_abs())
    }
    .ok_or(KernelError::InvalidArgument { name: "delta" })?;
    brk(new_brk)?;
    Ok(VirtualAddress::new(old))
}

/// The global allocator: a linked-list heap over the sbrk-grown region.
pub struct KernelHeap {
    inner: LockedHeap,
    seeded: AtomicBool,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: LockedHeap::empty(),
            seeded: AtomicBool::new(false),
        }
    }

    fn seed(&self, bottom: u32, size: usize) {
        // SAFETY: `bottom..bottom+size` was just mapped by init and is
        // used by nothing else.
        unsafe { self.inner.lock().init(bottom as usize as *mut u8, size) };
        self.seeded.store(true, Ordering::Release);
    }

    /// Map more sections and hand them to the inner heap.
    fn grow(&self, at_least: usize) -> KernelResult<()> {
        if !self.seeded.load(Ordering::Acquire) {
            return Err(KernelError::NotInitialized { subsystem: "heap" });
        }
        let bytes = round_up(at_least as u32, SECTION_SIZE);
        sbrk(bytes as i32)?;
        // SAFETY: sbrk mapped `bytes` contiguous bytes right after the
        // inner heap's current top.
        unsafe { self.inner.lock().extend(bytes as usize) };
        Ok(())
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: allocation is delegated to linked_list_allocator, which upholds
// the GlobalAlloc contract; growth only ever appends freshly mapped,
// otherwise unused sections.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if let Ok(block) = self.inner.lock().allocate_first_fit(layout) {
            return block.as_ptr();
        }
        // Out of room: grow by at least the request (plus alignment slack)
        // and retry once.
        if self.grow(layout.size() + layout.align()).is_err() {
            return core::ptr::null_mut();
        }
        match self.inner.lock().allocate_first_fit(layout) {
            Ok(block) => block.as_ptr(),
            Err(()) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = core::ptr::NonNull::new(ptr) {
            // SAFETY: `ptr` came from allocate_first_fit with this layout.
            unsafe { self.inner.lock().deallocate(ptr, layout) };
        }
    }
}

/// The kernel's global allocator instance (bare metal only; the hosted
/// test build uses the system allocator).
#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_HEAP: KernelHeap = KernelHeap::new();
