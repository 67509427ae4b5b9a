//! Embedded memory model: no per-process translation.
//!
//! Physical RAM is the user address space. Protection comes from a
//! single static table of 1 MB section descriptors built once at boot
//! from the region set below and installed through
//! `arch::load_protection_table`: kernel image, data and the process
//! pages are privileged-only, while user RAM, the shared-page window,
//! the peripheral window and the system-control window are open to user
//! mode. Address-space switching reduces to updating the
//! current-process pointer, and per-page mapping calls succeed without
//! doing anything; the remaining page-level policy is that the heap may
//! not grow into the next thread's stack, and that shared pages are
//! claimed at their fixed window address so the address a user touches
//! is the page the kernel populated.

use super::layout::{self, PAGE_SHIFT};
use super::page_allocator::PageType;
use crate::arch;
use crate::lib::error::{KernErr, Result};
use crate::process::{get_process, Process};
use crate::superpage::SuperPage;

/// One protection-region descriptor: base, size and whether user mode may
/// touch it. Programmed once at boot, never changed afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: usize,
    pub size: usize,
    pub user_accessible: bool,
}

/// System-control window (interrupt and timer control blocks).
pub const SYSTEM_CONTROL_BASE: usize = 0xE000_0000;
pub const SYSTEM_CONTROL_SIZE: usize = 0x0100_0000;

/// Section descriptors in the protection table. Bits 1:0 carry the
/// descriptor type, bits 11:10 the access permission; the section base
/// sits in the top bits. An all-zero entry means no access at all.
pub const SECTION_DESC: u32 = 0x2;
pub const SECTION_KERNEL_ONLY: u32 = 0x1 << 10;
pub const SECTION_USER_RW: u32 = 0x3 << 10;
pub const NUM_SECTIONS: usize = 4096;

/// The boot region set: kernel pages and pool locked away, everything
/// the user workload legitimately touches opened up.
pub fn boot_regions() -> [Region; 6] {
    let total_ram = unsafe { SuperPage::the() }.total_ram as usize;
    let user_ram_off = layout::SHARED_PAGES_PHYS_OFF + layout::SHARED_PAGES_SIZE;
    [
        // Kernel fixed pages plus the kernel allocation pool
        Region {
            base: arch::PHYS_RAM_BASE,
            size: layout::PROCESSES_OFF,
            user_accessible: false,
        },
        Region {
            base: arch::PHYS_RAM_BASE + layout::PROCESSES_OFF,
            size: layout::PROCESSES_SIZE,
            user_accessible: false,
        },
        Region {
            base: arch::PHYS_RAM_BASE + layout::SHARED_PAGES_PHYS_OFF,
            size: layout::SHARED_PAGES_SIZE,
            user_accessible: true,
        },
        Region {
            base: arch::PHYS_RAM_BASE + user_ram_off,
            size: total_ram.saturating_sub(user_ram_off),
            user_accessible: true,
        },
        Region {
            base: arch::PERIPHERAL_BASE,
            size: arch::PERIPHERAL_SIZE,
            user_accessible: true,
        },
        Region {
            base: SYSTEM_CONTROL_BASE,
            size: SYSTEM_CONTROL_SIZE,
            user_accessible: true,
        },
    ]
}

/// Fill `table` with section descriptors for the region set. Untouched
/// sections stay zero, which means no access from any mode.
pub fn build_region_table(regions: &[Region], table: &mut [u32]) {
    for entry in table.iter_mut() {
        *entry = 0;
    }
    for r in regions {
        if r.size == 0 {
            continue;
        }
        let perm = if r.user_accessible {
            SECTION_USER_RW
        } else {
            SECTION_KERNEL_ONLY
        };
        let first = r.base >> layout::SECTION_SHIFT;
        let last = ((r.base + r.size - 1) >> layout::SECTION_SHIFT).min(NUM_SECTIONS - 1);
        for sec in first..=last {
            table[sec] = (sec << layout::SECTION_SHIFT) as u32 | SECTION_DESC | perm;
        }
    }
}

fn protection_table() -> &'static mut [u32] {
    let base = layout::kern_addr(layout::KERNEL_PDE_OFF);
    unsafe { core::slice::from_raw_parts_mut(base as *mut u32, NUM_SECTIONS) }
}

pub fn protection_table_phys() -> usize {
    arch::PHYS_RAM_BASE + layout::KERNEL_PDE_OFF
}

/// Build the boot region table in the kernel directory pages and install
/// it. Called once from the boot path; the table never changes again.
pub fn program_boot_regions() {
    let regions = boot_regions();
    build_region_table(&regions, protection_table());
    super::finished_updating_page_tables();
    arch::load_protection_table(protection_table_phys());
}

pub fn process_init(p_idx: u8) -> Result<()> {
    unsafe { get_process(p_idx) }.pde_physical = 0;
    Ok(())
}

/// Without translation there is nothing to map; growth policy is applied
/// by `grow_heap_allowed`.
pub fn map_pages_in_process(_p_idx: u8, _va: usize, _num: usize) -> Result<()> {
    Ok(())
}

/// User address of a shared-page slot. The window is real RAM here, so
/// the slot address doubles as the physical address and is trivially the
/// same in every process.
pub fn shared_page_addr(idx: usize) -> usize {
    arch::PHYS_RAM_BASE + layout::SHARED_PAGES_PHYS_OFF + (idx << PAGE_SHIFT)
}

/// Slot index of a shared-window address, if it is one.
pub fn shared_page_index_of(addr: usize) -> Option<usize> {
    let base = arch::PHYS_RAM_BASE + layout::SHARED_PAGES_PHYS_OFF;
    if addr >= base && addr < base + layout::SHARED_PAGES_SIZE {
        Some((addr - base) >> PAGE_SHIFT)
    } else {
        None
    }
}

/// Claim the physical page at the fixed window address `va`. Identity
/// addressing means the page handed back is exactly the one user code
/// will touch.
pub fn map_shared_page(va: usize) -> Result<usize> {
    shared_page_index_of(va).ok_or(KernErr::Argument)?;
    let page_idx = (va - arch::PHYS_RAM_BASE) >> PAGE_SHIFT;
    if !super::with_allocator(|pa| pa.alloc_at(page_idx, PageType::SharedPage)) {
        return Err(KernErr::NoMemory);
    }
    Ok(va)
}

/// Release a shared-window page back to its slot.
pub fn free_shared_page(va: usize) {
    if shared_page_index_of(va).is_none() {
        return;
    }
    let page_idx = (va - arch::PHYS_RAM_BASE) >> PAGE_SHIFT;
    super::with_allocator(|pa| pa.free(page_idx, 1));
}

/// Identity: user addresses are physical addresses.
pub fn lookup(va: usize) -> Option<usize> {
    Some(va)
}

/// The heap grows until it would hit the base of the last thread's stack.
pub fn grow_heap_allowed(p: &Process, amount: usize) -> bool {
    if p.num_threads == 0 {
        return true;
    }
    let last = &p.threads[p.num_threads as usize - 1];
    p.heap_limit + amount <= layout::user_stack_base(last.index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::with_allocator;
    use crate::test_support::kernel_fixture;

    fn section_of(addr: usize) -> usize {
        addr >> layout::SECTION_SHIFT
    }

    #[test]
    fn test_boot_regions_lock_kernel_and_open_user_ram() {
        let _g = kernel_fixture();
        program_boot_regions();
        let table = protection_table();

        // Kernel pages, pool and process pages: privileged only
        let kernel_sec = table[section_of(arch::PHYS_RAM_BASE)];
        assert_eq!(kernel_sec & 0xC00, SECTION_KERNEL_ONLY);
        assert_eq!(kernel_sec & 0x3, SECTION_DESC);
        let proc_sec = table[section_of(arch::PHYS_RAM_BASE + layout::PROCESSES_OFF)];
        assert_eq!(proc_sec & 0xC00, SECTION_KERNEL_ONLY);

        // Shared window and user RAM: open to user mode
        let shared_sec = table[section_of(shared_page_addr(0))];
        assert_eq!(shared_sec & 0xC00, SECTION_USER_RW);
        let user_sec = table[section_of(
            arch::PHYS_RAM_BASE + layout::SHARED_PAGES_PHYS_OFF + layout::SHARED_PAGES_SIZE,
        )];
        assert_eq!(user_sec & 0xC00, SECTION_USER_RW);

        // Peripheral and system-control windows: open; everything else
        // is no-access
        assert_eq!(table[section_of(arch::PERIPHERAL_BASE)] & 0xC00, SECTION_USER_RW);
        assert_eq!(table[section_of(SYSTEM_CONTROL_BASE)] & 0xC00, SECTION_USER_RW);
        assert_eq!(table[0], 0);

        // Each descriptor identity-maps its own section
        assert_eq!(
            kernel_sec & 0xFFF0_0000,
            (arch::PHYS_RAM_BASE & 0xFFF0_0000) as u32
        );
    }

    #[test]
    fn test_program_boot_regions_installs_the_table() {
        let _g = kernel_fixture();
        program_boot_regions();
        assert_eq!(
            crate::arch::loaded_protection_table(),
            protection_table_phys()
        );
    }

    #[test]
    fn test_shared_page_claim_is_identity() {
        let _g = kernel_fixture();
        let va = shared_page_addr(5);
        let phys = map_shared_page(va).unwrap();
        // The page the kernel owns is the page user code addresses
        assert_eq!(phys, va);
        let page_idx = (va - arch::PHYS_RAM_BASE) >> PAGE_SHIFT;
        assert_eq!(
            with_allocator(|pa| pa.page_type(page_idx)),
            PageType::SharedPage as u8
        );

        // The slot is exclusive until released
        assert_eq!(map_shared_page(va), Err(KernErr::NoMemory));
        free_shared_page(va);
        assert_eq!(map_shared_page(va), Ok(va));
        free_shared_page(va);
    }

    #[test]
    fn test_shared_window_bounds() {
        assert_eq!(shared_page_index_of(shared_page_addr(0)), Some(0));
        assert_eq!(shared_page_index_of(shared_page_addr(255)), Some(255));
        assert_eq!(
            shared_page_index_of(arch::PHYS_RAM_BASE + layout::SHARED_PAGES_PHYS_OFF - 4),
            None
        );
        assert_eq!(map_shared_page(arch::PHYS_RAM_BASE), Err(KernErr::Argument));
    }
}
