//! Boot sequence and boot menu.
//!
//! The board entry hands over the ATAGS pointer; from there: console up,
//! banner, page accounting, SuperPage, interrupts, boot menu, then the
//! first process. On the hosted shim the same sequence runs against the
//! simulated RAM, minus the pieces that need real privilege.

use crate::mem::{self, layout, PageType};
use crate::process::{self, image};
use crate::superpage::SuperPage;
use crate::syscall::VERSION_STRING;
use crate::{arch, uart};

/// ATAG tag ids we care about.
const ATAG_MEM: u32 = 0x5441_0002;
const ATAG_REVISION: u32 = 0x5441_0007;
const ATAG_NONE: u32 = 0;

pub struct AtagsParams {
    pub total_ram: u32,
    pub board_rev: u32,
}

/// Walk the bootloader's parameter block: (size-in-words, tag) headers
/// followed by payload words.
///
/// # Safety
/// `ptr` must point at a readable, terminated ATAGS block.
pub unsafe fn parse_atags(ptr: *const u32) -> AtagsParams {
    let mut params = AtagsParams {
        total_ram: 64 * 1024 * 1024,
        board_rev: 0,
    };
    let mut p = ptr;
    loop {
        let size = p.read() as usize;
        let tag = p.add(1).read();
        match tag {
            ATAG_NONE => break,
            ATAG_MEM => params.total_ram = p.add(2).read(),
            ATAG_REVISION => params.board_rev = p.add(2).read(),
            _ => {}
        }
        if size == 0 {
            break;
        }
        p = p.add(size);
    }
    params
}

/// Boot modes selectable from the menu. Anything else the menu returns
/// is handed to user code through GetInt(BootMode).
pub mod boot_mode {
    pub const INTERPRETER: u32 = 0;
    pub const DEBUGGER: u32 = 1;
    pub const MENU: u32 = 2;
}

/// Set up every kernel table: SuperPage, page accounting, the fixed
/// kernel pages. Common to hardware and hosted boots.
pub fn init_kernel(total_ram: u32, board_rev: u32, boot_mode: u32) {
    let s = unsafe { SuperPage::the() };
    s.init(total_ram, board_rev, boot_mode);
    mem::init_allocator((total_ram as usize) >> layout::PAGE_SHIFT);
    if !cfg!(feature = "mmu") || cfg!(feature = "mpu") {
        mem::mpu::program_boot_regions();
    }
}

/// Full hardware boot. Does not return: ends up in the first process or
/// in the idle loop.
pub fn boot(atags_phys: usize) -> ! {
    arch::install_vectors();
    crate::kprint!("\n\n{}", VERSION_STRING);

    let atags = unsafe { parse_atags(mem::phys_to_virt(atags_phys) as *const u32) };
    crate::kprint!(
        " (RAM = {} MB, board = {:#x})\n",
        atags.total_ram >> 20,
        atags.board_rev
    );

    init_kernel(atags.total_ram, atags.board_rev, boot_mode::MENU);

    arch::irq_init();
    arch::enable_irqs();

    let mode = check_boot_mode(boot_mode::MENU);
    unsafe { SuperPage::the() }.boot_mode = mode;

    image::register("init");

    let first = match process::process_new("init") {
        Ok(idx) => idx,
        Err(e) => {
            crate::error!("failed to start init: {}", e);
            crate::lib::panic::hang()
        }
    };
    process::process_start(first)
}

fn display_boot_menu() -> u32 {
    crate::kprint!(
        "\
Boot menu:\n\
 Enter, 0: Start interpreter\n\
        1: Start debugger\n\
        3: Password manager (console UI)\n\
        4: Password manager (GUI)\n\
        5: Tetris\n\
Test func:\n\
        a: Run atomics unit tests\n\
        b: Run bitmap tests\n\
        m: Run memory usage tests\n\
    ^X, r: Reboot\n\
        t: Run test/init.lua tests\n\
        y: Run yield scheduling tests\n\
"
    );
    loop {
        let ch = uart::getch();
        match ch {
            // Ctrl-D terminates hosted mode, treat like Enter
            b'\r' | b'\n' | 0x04 => return 0,
            b'0'..=b'9' => return (ch - b'0') as u32,
            b'r' | 0x18 => return b'r' as u32, // Ctrl-X
            b'a' | b'b' | b'm' | b't' | b'y' => return ch as u32,
            _ => {}
        }
    }
}

/// Resolve the configured boot mode, running the menu and any selected
/// self-test. Returns the mode user code should see.
pub fn check_boot_mode(mode: u32) -> u32 {
    let mut mode = mode;
    if mode == boot_mode::MENU {
        mode = display_boot_menu();
    }
    match mode {
        boot_mode::DEBUGGER => {
            prepare_debugger_heap();
        }
        m if m == b'a' as u32 => test_atomics(),
        m if m == b'm' as u32 => test_mem(),
        m if m == b'r' as u32 => arch::reboot(),
        _ => {}
    }
    mode
}

/// Debugger-heap pages for the external debug overlay, plus marvin mode
/// so subsequent SVCs run on the debugger stack with interrupts masked.
pub fn prepare_debugger_heap() {
    const DEBUGGER_HEAP_PAGES: usize = 64;
    let got = mem::with_allocator(|pa| pa.alloc(PageType::DebuggerHeap, DEBUGGER_HEAP_PAGES));
    if got.is_none() {
        crate::error!("no memory for debugger heap");
        return;
    }
    unsafe { SuperPage::the() }.marvin = true;
}

/// Menu self-test: the atomic primitives the kernel leans on.
fn test_atomics() {
    use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
    let word = AtomicU32::new(5);
    assert_eq!(word.swap(9, Ordering::SeqCst), 5);
    assert_eq!(word.fetch_add(1, Ordering::SeqCst), 9);
    assert_eq!(
        word.compare_exchange(10, 11, Ordering::SeqCst, Ordering::SeqCst),
        Ok(10)
    );
    assert!(word
        .compare_exchange(10, 12, Ordering::SeqCst, Ordering::SeqCst)
        .is_err());
    let byte = AtomicU8::new(0xFE);
    assert_eq!(byte.fetch_add(1, Ordering::SeqCst), 0xFE);
    assert_eq!(byte.swap(0, Ordering::SeqCst), 0xFF);
    crate::kprint!("atomics ok\n");
}

/// Menu self-test: page accounting snapshot.
fn test_mem() {
    let (used, total) = mem::with_allocator(|pa| (pa.pages_in_use(), pa.num_pages()));
    crate::kprint!("{} of {} pages in use\n", used, total);
    let probe = mem::with_allocator(|pa| pa.alloc(PageType::User, 1));
    match probe {
        Some(pa_addr) => {
            mem::with_allocator(|pa| pa.free_phys(pa_addr, 1));
            crate::kprint!("alloc/free probe ok\n");
        }
        None => crate::kprint!("allocator exhausted!\n"),
    }
}

/// Idle bring-up used by the hosted demo binary: boot the tables, run
/// the menu against the host console, report, and return.
#[cfg(not(target_arch = "aarch64"))]
pub fn hosted_boot(boot_mode: u32) {
    crate::kprint!("\n\n{} (hosted)\n", VERSION_STRING);
    init_kernel(crate::arch::HOST_RAM_BYTES as u32, 0, boot_mode);
    image::register("init");
    let mode = check_boot_mode(boot_mode);
    unsafe { SuperPage::the() }.boot_mode = mode;
    match process::process_new("init") {
        Ok(idx) => {
            let p = unsafe { process::get_process(idx) };
            crate::kprint!("created process {} pid {}\n", p.name_str(), p.pid);
            crate::kprint!(
                "ready thread: {:?}\n",
                crate::sched::find_next_ready_thread().is_some()
            );
        }
        Err(e) => crate::error!("process creation failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel_fixture;

    #[test]
    fn test_parse_atags_block() {
        // (size, tag, payload...) triplets, terminated by ATAG_NONE
        let block: [u32; 9] = [
            3,
            ATAG_MEM,
            128 * 1024 * 1024,
            3,
            ATAG_REVISION,
            0xA21042,
            0,
            ATAG_NONE,
            0,
        ];
        let params = unsafe { parse_atags(block.as_ptr()) };
        assert_eq!(params.total_ram, 128 * 1024 * 1024);
        assert_eq!(params.board_rev, 0xA21042);
    }

    #[test]
    fn test_init_kernel_reserves_fixed_pages() {
        let _g = kernel_fixture();
        let used = mem::with_allocator(|pa| pa.pages_in_use());
        // Everything below the reserved line is stamped
        assert!(used >= layout::KERNEL_RESERVED_END >> layout::PAGE_SHIFT);
        assert_eq!(
            mem::with_allocator(|pa| pa.page_type(0)),
            PageType::Sect0 as u8
        );
        assert_eq!(
            mem::with_allocator(|pa| pa.page_type(layout::PAGE_ALLOCATOR_OFF >> layout::PAGE_SHIFT)),
            PageType::Allocator as u8
        );
    }

    #[test]
    fn test_debugger_mode_sets_marvin() {
        let _g = kernel_fixture();
        assert_eq!(check_boot_mode(boot_mode::DEBUGGER), boot_mode::DEBUGGER);
        assert!(crate::superpage::with(|s| s.marvin));
    }
}
