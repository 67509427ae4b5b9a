//! Hosted shim backend.
//!
//! Stands in for the hardware on every non-aarch64 target: a static array
//! plays the part of physical RAM, an atomic flag plays the interrupt
//! mask, and the console is process stdout. This keeps the portable
//! kernel — allocator, scheduler state machine, DFC queue, IPC tables,
//! page-table arithmetic — buildable and unit-testable on a development
//! machine.
//!
//! What the shim cannot do is resume a saved register file; tests
//! exercise the state machines up to (but not through) the actual context
//! load.

use super::{CpuMode, SavedRegs, TrapFrame};
use crate::lib::ringbuf::RingBuf;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

/// Same value as the hardware backend so physical addresses look alike in
/// tests and on the wire.
pub const PHYS_RAM_BASE: usize = 0x4000_0000;

/// Pretend MMIO window, mirroring the hardware backend.
pub const PERIPHERAL_BASE: usize = 0x0800_0000;
pub const PERIPHERAL_SIZE: usize = 0x0200_0000;

/// 4 MB of simulated RAM: enough for the full kernel map plus the
/// process-page window.
pub const HOST_RAM_BYTES: usize = 4 * 1024 * 1024;

#[repr(C, align(4096))]
struct HostRam([u8; HOST_RAM_BYTES]);

static mut HOST_RAM: HostRam = HostRam([0; HOST_RAM_BYTES]);

pub fn ram_base() -> *mut u8 {
    unsafe { (&raw mut HOST_RAM) as *mut u8 }
}

/// Re-zero the simulated RAM. Test-harness hook, used between boots.
pub fn reset_ram() {
    unsafe {
        ptr::write_bytes(ram_base(), 0, HOST_RAM_BYTES);
    }
}

// ---------------------------------------------------------------------------
// Program status words: a two-value pretend PSR
// ---------------------------------------------------------------------------

const PSR_MODE_MASK: usize = 0xF;
const PSR_MODE_USER: usize = 0x0;
const PSR_MODE_SVC: usize = 0x5;
const PSR_IRQ_MASKED: usize = 1 << 7;

pub fn psr_mode(psr: usize) -> CpuMode {
    match psr & PSR_MODE_MASK {
        PSR_MODE_USER => CpuMode::User,
        _ => CpuMode::Svc,
    }
}

pub fn user_psr() -> usize {
    PSR_MODE_USER
}

pub fn kern_thread_psr() -> usize {
    PSR_MODE_SVC | PSR_IRQ_MASKED
}

static INTERRUPTED_PSR: AtomicUsize = AtomicUsize::new(PSR_MODE_USER);

pub fn interrupted_psr() -> usize {
    INTERRUPTED_PSR.load(Ordering::Relaxed)
}

/// Test hook: pretend the last interrupt arrived in the given mode.
pub fn set_interrupted_psr(psr: usize) {
    INTERRUPTED_PSR.store(psr, Ordering::Relaxed);
}

/// Status word of a context stuck inside the kernel, for tests that
/// exercise the mid-SVC tick path.
pub fn svc_psr() -> usize {
    PSR_MODE_SVC
}

// ---------------------------------------------------------------------------
// Interrupt masking
// ---------------------------------------------------------------------------

static IRQS_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn irqs_enabled() -> bool {
    IRQS_ENABLED.load(Ordering::Relaxed)
}

pub fn disable_irqs() {
    IRQS_ENABLED.store(false, Ordering::Relaxed);
}

pub fn enable_irqs() {
    IRQS_ENABLED.store(true, Ordering::Relaxed);
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn mem_barrier() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// User-memory access: no privilege distinction on the shim
// ---------------------------------------------------------------------------

pub unsafe fn user_write(addr: usize, value: usize) {
    ptr::write_volatile(addr as *mut usize, value);
}

pub unsafe fn user_write_u32(addr: usize, value: u32) {
    ptr::write_volatile(addr as *mut u32, value);
}

pub unsafe fn user_read_u64(addr: usize) -> u64 {
    ptr::read_volatile(addr as *const u64)
}

/// The shim runs without translation, so user windows are not backed by
/// host memory; zeroing them is the mapping layer's concern on hardware
/// and a no-op here.
pub unsafe fn zero_user_pages(_addr: usize, _num: usize) {}

pub fn set_user_page_directory(_pde_phys: usize, _asid: u8) {}

static PROTECTION_TABLE: AtomicUsize = AtomicUsize::new(0);

/// Embedded model: the shim cannot enforce anything, but it records the
/// installed table so tests can assert the boot path really loaded one.
pub fn load_protection_table(table_phys: usize) {
    PROTECTION_TABLE.store(table_phys, Ordering::Release);
}

pub fn loaded_protection_table() -> usize {
    PROTECTION_TABLE.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Console: stdout out, injected ring in
// ---------------------------------------------------------------------------

pub fn console_write(bytes: &[u8]) {
    #[cfg(not(target_arch = "aarch64"))]
    {
        use std::io::Write;
        let _ = std::io::stdout().write_all(bytes);
        let _ = std::io::stdout().flush();
    }
}

static RX_QUEUE: Mutex<RingBuf<64>> = Mutex::new(RingBuf::new());

/// Feed a byte to the simulated UART receive line.
pub fn inject_rx_byte(b: u8) {
    let mut q = RX_QUEUE.lock();
    if !q.is_full() {
        q.push(b);
    }
}

pub fn uart_rx_ready() -> bool {
    !RX_QUEUE.lock().is_empty()
}

pub fn uart_rx() -> u8 {
    let mut q = RX_QUEUE.lock();
    if q.is_empty() {
        0
    } else {
        q.pop()
    }
}

pub fn uart_tx(b: u8) {
    console_write(&[b]);
}

pub fn irq_init() {}

pub fn install_vectors() {}

pub fn restore_frame(_regs: &SavedRegs, _kstack_top: usize) -> ! {
    panic!("context resume is not supported on the hosted shim");
}

pub fn reboot() -> ! {
    super::REBOOT_REQUESTED.store(1, Ordering::Relaxed);
    panic!("reboot requested");
}

/// Hosted stand-in for the IRQ entry path: deliver a timer tick as if
/// the 1 ms interrupt had fired while the given frame was executing.
pub fn simulate_tick(frame: &TrapFrame) -> bool {
    INTERRUPTED_PSR.store(frame.psr, Ordering::Relaxed);
    crate::sched::tick()
}
