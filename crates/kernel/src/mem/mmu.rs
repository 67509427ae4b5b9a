//! Full memory model: per-process two-level translation tables.
//!
//! The top level is a directory of 1 MB sections (one page, 1024 entries,
//! covering the 1 GB user space — the hardware never walks past the user
//! limit). Each second-level table is one page describing the 256 4 kB
//! pages of its section. Table words are written through the kernel
//! window; the allocator address in each descriptor is physical.
//!
//! Invariants: a `UserPt` page is pointed to by exactly one directory
//! entry; a `User` page is reachable from exactly one process's tables
//! unless its entry carries the shared-page descriptor type.

use super::layout::{self, PAGE_SHIFT, PAGE_SIZE, SECTION_SHIFT};
use super::page_allocator::PageType;
use super::{phys_to_virt, with_allocator};
use crate::lib::error::{KernErr, Result};
use crate::process::{get_process, Process};

/// Directory entries: 1024 sections of 1 MB.
pub const NUM_USER_PDES: usize = 1024;
/// Second-level entries per section: 256 pages.
pub const PTES_PER_SECTION: usize = 256;

// Descriptor words. Bits 1:0 are the type; the table/page address sits in
// the top bits.
pub const DESC_TYPE_MASK: u32 = 0x3;
pub const DESC_NONE: u32 = 0x0;
/// Directory entry pointing at a second-level table.
pub const PDE_PAGE_TABLE: u32 = 0x1;
/// Second-level entry: user-accessible page.
pub const PTE_USER: u32 = 0x3;
/// Second-level entry: kernel-only page (thread SVC stacks).
pub const PTE_KERNEL: u32 = 0x1;
/// Marks a page mapped into more than one process by design.
pub const PTE_SHARED: u32 = 1 << 2;

pub const DESC_ADDR_MASK: u32 = !0xFFF;

fn pde_index(va: usize) -> usize {
    va >> SECTION_SHIFT
}

fn pte_index(va: usize) -> usize {
    (va & (layout::SECTION_SIZE - 1)) >> PAGE_SHIFT
}

/// The directory of a process, as a kernel-window slice.
fn directory(p: &Process) -> &'static mut [u32] {
    unsafe {
        core::slice::from_raw_parts_mut(phys_to_virt(p.pde_physical) as *mut u32, NUM_USER_PDES)
    }
}

fn table_at(pt_phys: usize) -> &'static mut [u32] {
    unsafe {
        core::slice::from_raw_parts_mut(phys_to_virt(pt_phys) as *mut u32, PTES_PER_SECTION)
    }
}

fn zero_phys_page(phys: usize) {
    unsafe {
        core::ptr::write_bytes(phys_to_virt(phys) as *mut u8, 0, PAGE_SIZE);
    }
}

/// Allocate and zero the user page directory for a fresh process.
pub fn process_init(p_idx: u8) -> Result<()> {
    let pde_phys = with_allocator(|pa| pa.alloc(PageType::UserPde, 1)).ok_or(KernErr::NoMemory)?;
    zero_phys_page(pde_phys);
    unsafe { get_process(p_idx) }.pde_physical = pde_phys;
    Ok(())
}

/// Second-level table for `va`, creating it when `create` is set.
fn table_for(p: &Process, va: usize, create: bool) -> Result<&'static mut [u32]> {
    let dir = directory(p);
    let pde = dir[pde_index(va)];
    if pde & DESC_TYPE_MASK == PDE_PAGE_TABLE {
        return Ok(table_at((pde & DESC_ADDR_MASK) as usize));
    }
    if !create {
        return Err(KernErr::NotFound);
    }
    let pt_phys = with_allocator(|pa| pa.alloc(PageType::UserPt, 1)).ok_or(KernErr::NoMemory)?;
    zero_phys_page(pt_phys);
    dir[pde_index(va)] = pt_phys as u32 | PDE_PAGE_TABLE;
    Ok(table_at(pt_phys))
}

fn map_one(p: &Process, va: usize, phys: usize, desc: u32) -> Result<()> {
    let pt = table_for(p, va, true)?;
    debug_assert_eq!(pt[pte_index(va)], DESC_NONE);
    pt[pte_index(va)] = phys as u32 | desc;
    Ok(())
}

/// Map `num` freshly allocated pages of `page_type` at `va`. On failure
/// everything mapped so far is rolled back.
pub fn map_pages_in_process(p_idx: u8, va: usize, num: usize, page_type: PageType) -> Result<()> {
    let p = unsafe { get_process(p_idx) };
    for i in 0..num {
        let addr = va + (i << PAGE_SHIFT);
        let phys = match with_allocator(|pa| pa.alloc(page_type, 1)) {
            Some(phys) => phys,
            None => {
                unmap_pages_in_process(p_idx, va, i);
                return Err(KernErr::NoMemory);
            }
        };
        if let Err(e) = map_one(p, addr, phys, PTE_USER) {
            with_allocator(|pa| pa.free_phys(phys, 1));
            unmap_pages_in_process(p_idx, va, i);
            return Err(e);
        }
    }
    Ok(())
}

/// One kernel-only page for a thread's SVC stack.
pub fn map_svc_stack(p_idx: u8, va: usize) -> Result<()> {
    let p = unsafe { get_process(p_idx) };
    let phys =
        with_allocator(|pa| pa.alloc(PageType::ThreadSvcStack, 1)).ok_or(KernErr::NoMemory)?;
    if let Err(e) = map_one(p, va, phys, PTE_KERNEL) {
        with_allocator(|pa| pa.free_phys(phys, 1));
        return Err(e);
    }
    Ok(())
}

/// Allocate a shared page and map it at `va` with the shared descriptor.
/// Returns the physical address.
pub fn map_shared_page(p_idx: u8, va: usize) -> Result<usize> {
    let p = unsafe { get_process(p_idx) };
    let phys = with_allocator(|pa| pa.alloc(PageType::SharedPage, 1)).ok_or(KernErr::NoMemory)?;
    if let Err(e) = map_one(p, va, phys, PTE_USER | PTE_SHARED) {
        with_allocator(|pa| pa.free_phys(phys, 1));
        return Err(e);
    }
    Ok(phys)
}

/// Duplicate the mapping at `va` in `src` into `dst` at the same address.
/// The page itself is not reallocated; both processes now reach the same
/// physical page.
pub fn share_page(src_idx: u8, dst_idx: u8, va: usize) -> Result<()> {
    let src = unsafe { get_process(src_idx) };
    let pte = table_for(src, va, false)?[pte_index(va)];
    if pte & DESC_TYPE_MASK == DESC_NONE {
        return Err(KernErr::NotFound);
    }
    let dst = unsafe { get_process(dst_idx) };
    let pt = table_for(dst, va, true)?;
    if pt[pte_index(va)] != DESC_NONE {
        return Err(KernErr::AlreadyExists);
    }
    pt[pte_index(va)] = pte | PTE_SHARED;
    Ok(())
}

/// Clear `num` mappings from `va`, freeing the physical pages, and free
/// each second-level table that ends up empty.
pub fn unmap_pages_in_process(p_idx: u8, va: usize, num: usize) {
    let p = unsafe { get_process(p_idx) };
    for i in 0..num {
        let addr = va + (i << PAGE_SHIFT);
        let Ok(pt) = table_for(p, addr, false) else {
            continue;
        };
        let pte = pt[pte_index(addr)];
        if pte & DESC_TYPE_MASK == DESC_NONE {
            continue;
        }
        with_allocator(|pa| pa.free_phys((pte & DESC_ADDR_MASK) as usize, 1));
        pt[pte_index(addr)] = DESC_NONE;

        if pt.iter().all(|&e| e == DESC_NONE) {
            let dir = directory(p);
            let pde = dir[pde_index(addr)];
            dir[pde_index(addr)] = DESC_NONE;
            with_allocator(|pa| pa.free_phys((pde & DESC_ADDR_MASK) as usize, 1));
        }
    }
}

/// Drop a shared mapping without freeing the physical page (the owner's
/// unmap does that). Frees the second-level table if it drains empty.
pub fn unshare(p_idx: u8, va: usize) {
    let p = unsafe { get_process(p_idx) };
    let Ok(pt) = table_for(p, va, false) else {
        return;
    };
    pt[pte_index(va)] = DESC_NONE;
    if pt.iter().all(|&e| e == DESC_NONE) {
        let dir = directory(p);
        let pde = dir[pde_index(va)];
        dir[pde_index(va)] = DESC_NONE;
        with_allocator(|pa| pa.free_phys((pde & DESC_ADDR_MASK) as usize, 1));
    }
}

/// Walk the tables for `va`. None when unmapped.
pub fn lookup(p_idx: u8, va: usize) -> Option<usize> {
    if va >= layout::USER_MEM_LIMIT {
        return None;
    }
    let p = unsafe { get_process(p_idx) };
    let pt = table_for(p, va, false).ok()?;
    let pte = pt[pte_index(va)];
    if pte & DESC_TYPE_MASK == DESC_NONE {
        None
    } else {
        Some((pte & DESC_ADDR_MASK) as usize + (va & (PAGE_SIZE - 1)))
    }
}

/// Is the mapping at `va` a shared-page mapping?
pub fn is_shared(p_idx: u8, va: usize) -> bool {
    let p = unsafe { get_process(p_idx) };
    table_for(p, va, false)
        .map(|pt| pt[pte_index(va)] & PTE_SHARED != 0)
        .unwrap_or(false)
}

pub fn grow_heap_allowed(p: &Process, amount: usize) -> bool {
    // The heap may not run into the shared-page window
    p.heap_limit + amount <= layout::SHARED_PAGES_BASE
}

/// Free whatever translation state is left: straggler pages, the
/// second-level tables, and the directory itself.
pub fn process_exited(p_idx: u8) {
    let p = unsafe { get_process(p_idx) };
    if p.pde_physical == 0 {
        return;
    }
    let dir = directory(p);
    for pde in dir.iter_mut() {
        if *pde & DESC_TYPE_MASK != PDE_PAGE_TABLE {
            continue;
        }
        let pt_phys = (*pde & DESC_ADDR_MASK) as usize;
        for pte in table_at(pt_phys).iter_mut() {
            if *pte & DESC_TYPE_MASK != DESC_NONE {
                // A shared page is owned by its mapping words, not the
                // tables; ipc teardown has already decided its fate.
                if *pte & PTE_SHARED == 0 {
                    with_allocator(|pa| pa.free_phys((*pte & DESC_ADDR_MASK) as usize, 1));
                }
                *pte = DESC_NONE;
            }
        }
        with_allocator(|pa| pa.free_phys(pt_phys, 1));
        *pde = DESC_NONE;
    }
    with_allocator(|pa| pa.free_phys(p.pde_physical, 1));
    p.pde_physical = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{kernel_fixture, spawn_test_process};

    #[test]
    fn test_map_creates_tables_on_demand() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let p = unsafe { get_process(tid.proc_idx) };
        let va = layout::USER_HEAP_BASE;

        let in_use_before = with_allocator(|pa| pa.pages_in_use());
        map_pages_in_process(tid.proc_idx, va, 3, PageType::User).unwrap();
        // 3 user pages plus one new second-level table
        assert_eq!(with_allocator(|pa| pa.pages_in_use()), in_use_before + 4);

        let dir = directory(p);
        assert_eq!(dir[pde_index(va)] & DESC_TYPE_MASK, PDE_PAGE_TABLE);
        for i in 0..3 {
            assert!(lookup(tid.proc_idx, va + i * PAGE_SIZE).is_some());
        }
        assert!(lookup(tid.proc_idx, va + 3 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_unmap_frees_pages_and_empty_table() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let va = layout::USER_HEAP_BASE;

        let before = with_allocator(|pa| pa.pages_in_use());
        map_pages_in_process(tid.proc_idx, va, 2, PageType::User).unwrap();
        unmap_pages_in_process(tid.proc_idx, va, 2);
        assert_eq!(with_allocator(|pa| pa.pages_in_use()), before);
        assert!(lookup(tid.proc_idx, va).is_none());
    }

    #[test]
    fn test_share_page_duplicates_mapping() {
        let _g = kernel_fixture();
        let a = spawn_test_process("init");
        let b = spawn_test_process("interp");
        let va = layout::shared_page_addr(0);

        let phys = map_shared_page(a.proc_idx, va).unwrap();
        share_page(a.proc_idx, b.proc_idx, va).unwrap();
        assert_eq!(lookup(a.proc_idx, va), Some(phys));
        assert_eq!(lookup(b.proc_idx, va), Some(phys));
        assert!(is_shared(a.proc_idx, va));
        assert!(is_shared(b.proc_idx, va));
    }

    #[test]
    fn test_partial_map_rolls_back() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let before = with_allocator(|pa| pa.pages_in_use());
        let free = with_allocator(|pa| pa.num_pages() - pa.pages_in_use());
        // More pages than exist: must fail and leave accounting untouched
        let r = map_pages_in_process(
            tid.proc_idx,
            layout::USER_HEAP_BASE,
            free + 1,
            PageType::User,
        );
        assert_eq!(r, Err(KernErr::NoMemory));
        assert_eq!(with_allocator(|pa| pa.pages_in_use()), before);
    }
}
