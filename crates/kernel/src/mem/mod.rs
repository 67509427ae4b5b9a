//! Memory management.
//!
//! Two models, selected by cargo feature: `mmu` routes user mappings
//! through per-process two-level tables; `mpu` runs without translation
//! and only polices a handful of protection regions. Process pages, the
//! SuperPage and the allocator map live at fixed offsets in the kernel's
//! identity window either way.

pub mod layout;
pub mod mmu;
pub mod mpu;
pub mod page_allocator;

pub use page_allocator::{PageAllocator, PageType};

use crate::arch;
use crate::lib::error::Result;
use crate::process::Process;
use crate::superpage::SuperPage;
use layout::{PAGE_SHIFT, PAGE_SIZE};

/// Kernel-window pointer for a physical address.
pub fn phys_to_virt(pa: usize) -> usize {
    arch::ram_base() as usize + (pa - arch::PHYS_RAM_BASE)
}

/// Run `f` with a view of the page allocator over its fixed map,
/// persisting the scan hint across calls.
pub fn with_allocator<R>(f: impl FnOnce(&mut PageAllocator) -> R) -> R {
    let s = unsafe { SuperPage::the() };
    let mut pa = unsafe { PageAllocator::at_fixed_map(s.allocator_pages) };
    pa.set_first_free(s.allocator_first_free);
    let r = f(&mut pa);
    s.allocator_first_free = pa.first_free();
    r
}

/// Boot-time allocator setup: size the map for `num_pages` of RAM and
/// stamp the fixed kernel pages.
pub fn init_allocator(num_pages: usize) {
    // One map byte per page; the map area caps the RAM we can track
    assert!(num_pages <= layout::PAGE_ALLOCATOR_MAX_SIZE);
    let s = unsafe { SuperPage::the() };
    s.allocator_pages = num_pages;
    s.allocator_first_free = 0;
    let mut pa = unsafe { PageAllocator::at_fixed_map(num_pages) };
    pa.init(num_pages);

    // Everything below the reserved line is kernel-fixed: the SuperPage,
    // directory, stacks, then the allocator's own map pages.
    let map_pages = layout::page_round_up(layout::PAGE_ALLOCATOR_OFF + num_pages) >> PAGE_SHIFT;
    let reserved = (layout::KERNEL_RESERVED_END >> PAGE_SHIFT).max(map_pages);
    for idx in 0..layout::PAGE_ALLOCATOR_OFF >> PAGE_SHIFT {
        pa.alloc_at(idx, PageType::Sect0);
    }
    for idx in layout::PAGE_ALLOCATOR_OFF >> PAGE_SHIFT..reserved {
        pa.alloc_at(idx, PageType::Allocator);
    }
    s.allocator_first_free = pa.first_free();
}

/// Claim and zero the process page for slot `idx`.
pub fn new_process_page(idx: u8) -> Result<()> {
    let page_idx = (layout::PROCESSES_OFF >> PAGE_SHIFT) + idx as usize;
    let ok = with_allocator(|pa| pa.alloc_at(page_idx, PageType::Process));
    if !ok {
        return Err(crate::lib::error::KernErr::NoMemory);
    }
    let phys = arch::PHYS_RAM_BASE + (page_idx << PAGE_SHIFT);
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys) as *mut u8, 0, PAGE_SIZE);
    }
    Ok(())
}

fn use_mmu() -> bool {
    cfg!(feature = "mmu") && !cfg!(feature = "mpu")
}

/// Set up the per-process translation state (a fresh page directory in
/// the full model; nothing in the embedded model).
pub fn process_init(p_idx: u8) -> Result<()> {
    if use_mmu() {
        mmu::process_init(p_idx)
    } else {
        mpu::process_init(p_idx)
    }
}

/// Map `num` fresh user pages at `va` in process `p_idx`.
pub fn map_user_pages(p_idx: u8, va: usize, num: usize) -> Result<()> {
    if use_mmu() {
        mmu::map_pages_in_process(p_idx, va, num, PageType::User)
    } else {
        mpu::map_pages_in_process(p_idx, va, num)
    }
}

/// Map the one-page kernel-only SVC stack for a thread.
pub fn map_svc_stack(p_idx: u8, va: usize) -> Result<()> {
    if use_mmu() {
        mmu::map_svc_stack(p_idx, va)
    } else {
        Ok(())
    }
}

/// User address every process will see for shared-page slot `idx`. The
/// full model uses the translated window; the embedded model's window is
/// carved out of RAM itself.
pub fn shared_page_user_addr(idx: usize) -> usize {
    if use_mmu() {
        layout::shared_page_addr(idx)
    } else {
        mpu::shared_page_addr(idx)
    }
}

/// Slot index of a shared-page user address, when it lies in the model's
/// shared window.
pub fn shared_page_index_of(addr: usize) -> Option<usize> {
    if use_mmu() {
        if layout::in_shared_window(addr) {
            Some(layout::shared_page_index(addr))
        } else {
            None
        }
    } else {
        mpu::shared_page_index_of(addr)
    }
}

/// Allocate a shared page and map it at `va`. Returns its physical
/// address so the caller can zero it through the kernel window.
pub fn map_shared_page(p_idx: u8, va: usize) -> Result<usize> {
    if use_mmu() {
        mmu::map_shared_page(p_idx, va)
    } else {
        mpu::map_shared_page(va)
    }
}

/// Release the shared page mapped at `va` in its owner `p_idx`.
pub fn free_shared_page(p_idx: u8, va: usize) {
    if use_mmu() {
        mmu::unmap_pages_in_process(p_idx, va, 1);
    } else {
        mpu::free_shared_page(va);
    }
}

/// Duplicate the mapping at `va` in `src` into `dst`, same address, no
/// new allocation.
pub fn share_page(src_idx: u8, dst_idx: u8, va: usize) -> Result<()> {
    if use_mmu() {
        mmu::share_page(src_idx, dst_idx, va)
    } else {
        Ok(())
    }
}

/// Unmap `num` pages at `va`, freeing the underlying physical pages and
/// any second-level table that drains empty.
pub fn unmap_user_pages(p_idx: u8, va: usize, num: usize) {
    if use_mmu() {
        mmu::unmap_pages_in_process(p_idx, va, num);
    }
}

/// Drop a peer's view of a shared page without freeing the page itself.
pub fn unshare_page(p_idx: u8, va: usize) {
    if use_mmu() {
        mmu::unshare(p_idx, va);
    }
}

/// Physical address backing `va` in process `p_idx`, if mapped.
pub fn user_to_phys(p_idx: u8, va: usize) -> Option<usize> {
    if use_mmu() {
        mmu::lookup(p_idx, va)
    } else {
        mpu::lookup(va)
    }
}

/// Final address-space teardown once a process is dead.
pub fn process_exited(p_idx: u8) {
    if use_mmu() {
        mmu::process_exited(p_idx);
    }
}

/// Heap growth policy: table capacity bounds the full model, the next
/// thread stack bounds the embedded model.
pub fn grow_heap_allowed(p: &Process, amount: usize) -> bool {
    if use_mmu() {
        mmu::grow_heap_allowed(p, amount)
    } else {
        mpu::grow_heap_allowed(p, amount)
    }
}

/// Switch the user address space. Returns the previously current process
/// when it changed, None otherwise, so a temporary switch can be undone
/// with a second call.
pub fn switch_process(p_idx: Option<u8>) -> Option<u8> {
    let Some(p_idx) = p_idx else { return None };
    let s = unsafe { SuperPage::the() };
    if s.current_process == Some(p_idx) {
        return None;
    }
    let old = s.current_process;
    if use_mmu() {
        let p = unsafe { crate::process::get_process(p_idx) };
        arch::set_user_page_directory(p.pde_physical, p_idx);
    }
    s.current_process = Some(p_idx);
    old
}

/// Barrier after a batch of table updates.
pub fn finished_updating_page_tables() {
    arch::mem_barrier();
}
