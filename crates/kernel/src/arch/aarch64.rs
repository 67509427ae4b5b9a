//! AArch64 backend: exception vectors, register file save/restore, PL011
//! console, generic-timer tick and the privileged odds and ends the
//! portable kernel calls through `arch`.
//!
//! The kernel runs identity-mapped at EL1. User threads run at EL0 on
//! SP_EL0; kernel threads (the DFC thread) run at EL1t, also on SP_EL0, so
//! the EL1h exception stack is never borrowed by a schedulable context.

use super::{CpuMode, SavedRegs, TrapFrame};
use core::arch::{asm, global_asm};
use core::ptr;

/// Base of physical RAM (qemu virt / Pi-class boards load us here).
pub const PHYS_RAM_BASE: usize = 0x4000_0000;

/// MMIO window holding the interrupt controller and the UART.
pub const PERIPHERAL_BASE: usize = 0x0800_0000;
pub const PERIPHERAL_SIZE: usize = 0x0200_0000;

/// The kernel window over RAM is the identity map.
pub fn ram_base() -> *mut u8 {
    PHYS_RAM_BASE as *mut u8
}

// ---------------------------------------------------------------------------
// Program status words
// ---------------------------------------------------------------------------

const PSR_MODE_MASK: usize = 0xF;
const PSR_MODE_EL0T: usize = 0b0000;
const PSR_MODE_EL1T: usize = 0b0100;
const PSR_MODE_EL1H: usize = 0b0101;
const PSR_IRQ_MASKED: usize = 1 << 7;

pub fn psr_mode(psr: usize) -> CpuMode {
    match psr & PSR_MODE_MASK {
        PSR_MODE_EL0T => CpuMode::User,
        _ => CpuMode::Svc,
    }
}

/// Status word for a fresh user thread: EL0, interrupts enabled.
pub fn user_psr() -> usize {
    PSR_MODE_EL0T
}

/// Status word for a kernel thread: EL1t on SP_EL0, interrupts masked until
/// the drain loop opens them itself.
pub fn kern_thread_psr() -> usize {
    PSR_MODE_EL1T | PSR_IRQ_MASKED
}

/// Status word of a context executing inside the kernel proper (EL1h).
pub fn svc_psr() -> usize {
    PSR_MODE_EL1H
}

/// Saved status of the context the current exception interrupted.
pub fn interrupted_psr() -> usize {
    let spsr: usize;
    unsafe {
        asm!("mrs {}, spsr_el1", out(reg) spsr);
    }
    spsr
}

// ---------------------------------------------------------------------------
// Interrupt masking
// ---------------------------------------------------------------------------

pub fn irqs_enabled() -> bool {
    let daif: usize;
    unsafe {
        asm!("mrs {}, daif", out(reg) daif);
    }
    daif & (1 << 7) == 0
}

pub fn disable_irqs() {
    unsafe {
        asm!("msr daifset, #2");
    }
}

pub fn enable_irqs() {
    unsafe {
        asm!("msr daifclr, #2");
    }
}

/// Sleep the core until an interrupt fires. Entered and left with
/// interrupts masked; the interrupt is taken after the caller unmasks.
pub fn wait_for_interrupt() {
    unsafe {
        asm!("dsb sy", "wfi");
    }
}

pub fn mem_barrier() {
    unsafe {
        asm!("dsb ish", "isb");
    }
}

// ---------------------------------------------------------------------------
// User-memory access with user privilege
// ---------------------------------------------------------------------------

/// Store a word into user memory as if from EL0, so the access obeys the
/// user page permissions rather than the kernel's.
pub unsafe fn user_write(addr: usize, value: usize) {
    asm!("sttr {val}, [{addr}]", val = in(reg) value, addr = in(reg) addr);
}

pub unsafe fn user_write_u32(addr: usize, value: u32) {
    asm!("sttr {val:w}, [{addr}]", val = in(reg) value, addr = in(reg) addr);
}

pub unsafe fn user_read_u64(addr: usize) -> u64 {
    let value: u64;
    asm!("ldtr {val}, [{addr}]", val = out(reg) value, addr = in(reg) addr);
    value
}

pub unsafe fn zero_user_pages(addr: usize, num: usize) {
    ptr::write_bytes(addr as *mut u8, 0, num << crate::mem::layout::PAGE_SHIFT);
}

// ---------------------------------------------------------------------------
// Address space switch
// ---------------------------------------------------------------------------

/// Point translation at the given page directory with the given ASID.
pub fn set_user_page_directory(pde_phys: usize, asid: u8) {
    let ttbr0 = (asid as usize) << 48 | pde_phys;
    unsafe {
        asm!(
            "msr ttbr0_el1, {v}",
            "isb",
            v = in(reg) ttbr0,
        );
    }
}

/// Embedded model: install the boot-time protection table. The table is
/// static for the life of the system, so a single load with ASID 0 and a
/// barrier is the whole job.
pub fn load_protection_table(table_phys: usize) {
    set_user_page_directory(table_phys, 0);
    mem_barrier();
}

// ---------------------------------------------------------------------------
// Console (PL011 at the board's fixed base, identity-mapped)
// ---------------------------------------------------------------------------

const UART_BASE: usize = 0x0900_0000;
const UART_DR: usize = UART_BASE;
const UART_FR: usize = UART_BASE + 0x18;
const UART_IMSC: usize = UART_BASE + 0x38;
const UART_ICR: usize = UART_BASE + 0x44;
const UART_FR_TXFF: u32 = 1 << 5;
const UART_FR_RXFE: u32 = 1 << 4;
const UART_IMSC_RXIM: u32 = 1 << 4;

pub fn uart_tx(b: u8) {
    unsafe {
        while ptr::read_volatile(UART_FR as *const u32) & UART_FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        ptr::write_volatile(UART_DR as *mut u32, b as u32);
    }
}

pub fn uart_rx_ready() -> bool {
    unsafe { ptr::read_volatile(UART_FR as *const u32) & UART_FR_RXFE == 0 }
}

pub fn uart_rx() -> u8 {
    unsafe { (ptr::read_volatile(UART_DR as *const u32) & 0xFF) as u8 }
}

pub fn console_write(bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            uart_tx(b'\r');
        }
        uart_tx(b);
    }
}

// ---------------------------------------------------------------------------
// Interrupt controller and timer tick
// ---------------------------------------------------------------------------

const GICD_BASE: usize = 0x0800_0000;
const GICD_CTLR: usize = GICD_BASE;
const GICD_ISENABLER: usize = GICD_BASE + 0x100;
const IRQ_TIMER: u32 = 30; // EL1 physical timer PPI
const IRQ_UART: u32 = 33; // PL011 SPI on the virt board

fn timer_ticks_per_ms() -> u64 {
    let freq: u64;
    unsafe {
        asm!("mrs {}, cntfrq_el0", out(reg) freq);
    }
    freq / 1000
}

fn timer_rearm() {
    let tval = timer_ticks_per_ms();
    unsafe {
        asm!("msr cntp_tval_el0, {}", in(reg) tval);
    }
}

/// Program the 1 ms tick and unmask the tick and UART receive interrupts.
pub fn irq_init() {
    unsafe {
        // Distributor + CPU interface on, priority mask wide open
        ptr::write_volatile(GICD_CTLR as *mut u32, 1);
        for irq in [IRQ_TIMER, IRQ_UART] {
            let reg = GICD_ISENABLER + 4 * (irq as usize / 32);
            ptr::write_volatile(reg as *mut u32, 1 << (irq % 32));
        }
        asm!(
            "msr icc_pmr_el1, {pmr}",
            "msr icc_igrpen1_el1, {en}",
            pmr = in(reg) 0xFFusize,
            en = in(reg) 1usize,
        );

        // UART receive interrupt
        ptr::write_volatile(UART_IMSC as *mut u32, UART_IMSC_RXIM);

        // 1 ms tick
        timer_rearm();
        asm!("msr cntp_ctl_el0, {}", in(reg) 1usize);
    }
}

fn irq_acknowledge() -> u32 {
    let iar: usize;
    unsafe {
        asm!("mrs {}, icc_iar1_el1", out(reg) iar);
    }
    (iar & 0xFFFFFF) as u32
}

fn irq_end(iar: u32) {
    unsafe {
        asm!("msr icc_eoir1_el1, {}", in(reg) iar as usize);
    }
}

pub fn reboot() -> ! {
    // PSCI SYSTEM_RESET via SMC
    unsafe {
        asm!(
            "mov w0, #0x0009",
            "movk w0, #0x8400, lsl #16",
            "smc #0",
            options(noreturn),
        );
    }
}

// ---------------------------------------------------------------------------
// Exception vectors
// ---------------------------------------------------------------------------

// Boot stub: the loader drops us here with the ATAGS pointer in x0.
// Park secondary cores, raise the boot stack and enter the kernel.
global_asm!(
    r#"
    .section .text.boot
    .global _start
_start:
    mrs     x9, mpidr_el1
    and     x9, x9, #3
    cbnz    x9, 1f
    ldr     x9, =__boot_stack_top
    mov     sp, x9
    b       kmain
1:
    wfe
    b       1b
    "#
);

// The vector stubs push a full `TrapFrame` (34 words, 272 bytes) onto the
// EL1h stack and hand its address to the Rust handlers below. The sync and
// IRQ handlers may not return (reschedule); when they do return, the stub
// unwinds the frame and erets back into the interrupted context.
global_asm!(
    r#"
    .macro SAVE_FRAME
    sub     sp, sp, #272
    stp     x0, x1, [sp, #0]
    stp     x2, x3, [sp, #16]
    stp     x4, x5, [sp, #32]
    stp     x6, x7, [sp, #48]
    stp     x8, x9, [sp, #64]
    stp     x10, x11, [sp, #80]
    stp     x12, x13, [sp, #96]
    stp     x14, x15, [sp, #112]
    stp     x16, x17, [sp, #128]
    stp     x18, x19, [sp, #144]
    stp     x20, x21, [sp, #160]
    stp     x22, x23, [sp, #176]
    stp     x24, x25, [sp, #192]
    stp     x26, x27, [sp, #208]
    stp     x28, x29, [sp, #224]
    str     x30, [sp, #240]
    mrs     x9, sp_el0
    str     x9, [sp, #248]
    mrs     x9, elr_el1
    str     x9, [sp, #256]
    mrs     x9, spsr_el1
    str     x9, [sp, #264]
    .endm

    .macro RESTORE_FRAME_ERET
    ldr     x9, [sp, #248]
    msr     sp_el0, x9
    ldr     x9, [sp, #256]
    msr     elr_el1, x9
    ldr     x9, [sp, #264]
    msr     spsr_el1, x9
    ldp     x0, x1, [sp, #0]
    ldp     x2, x3, [sp, #16]
    ldp     x4, x5, [sp, #32]
    ldp     x6, x7, [sp, #48]
    ldp     x8, x9, [sp, #64]
    ldp     x10, x11, [sp, #80]
    ldp     x12, x13, [sp, #96]
    ldp     x14, x15, [sp, #112]
    ldp     x16, x17, [sp, #128]
    ldp     x18, x19, [sp, #144]
    ldp     x20, x21, [sp, #160]
    ldp     x22, x23, [sp, #176]
    ldp     x24, x25, [sp, #192]
    ldp     x26, x27, [sp, #208]
    ldp     x28, x29, [sp, #224]
    ldr     x30, [sp, #240]
    add     sp, sp, #272
    eret
    .endm

    .section .text
    .global lupi_vector_table
    .balign 2048
lupi_vector_table:
    // Current EL with SP_EL0: not used, treat as fatal
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal

    // Current EL with SP_ELx: kernel-mode sync faults and IRQs
    .balign 128
    b       lupi_vec_sync
    .balign 128
    b       lupi_vec_irq
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal

    // Lower EL, AArch64: SVCs, user faults and IRQs
    .balign 128
    b       lupi_vec_sync
    .balign 128
    b       lupi_vec_irq
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal

    // Lower EL, AArch32: unsupported
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal
    .balign 128
    b       lupi_vec_fatal

lupi_vec_sync:
    SAVE_FRAME
    mov     x0, sp
    bl      aarch64_sync_entry
    RESTORE_FRAME_ERET

lupi_vec_irq:
    SAVE_FRAME
    mov     x0, sp
    bl      aarch64_irq_entry
    RESTORE_FRAME_ERET

lupi_vec_fatal:
    SAVE_FRAME
    mov     x0, sp
    bl      aarch64_fatal_entry
    b       .

    .global aarch64_restore_frame
aarch64_restore_frame:
    // x0 = &SavedRegs, x1 = exception stack top for the incoming thread.
    // The outgoing context's kernel frames are dead once we get here, so
    // point SP_EL1 at the incoming thread's own SVC stack before loading
    // user sp / pc / psr and the register file, x0 itself last.
    mov     sp, x1
    ldr     x1, [x0, #248]
    msr     sp_el0, x1
    ldr     x1, [x0, #256]
    msr     elr_el1, x1
    ldr     x1, [x0, #264]
    msr     spsr_el1, x1
    ldp     x2, x3, [x0, #16]
    ldp     x4, x5, [x0, #32]
    ldp     x6, x7, [x0, #48]
    ldp     x8, x9, [x0, #64]
    ldp     x10, x11, [x0, #80]
    ldp     x12, x13, [x0, #96]
    ldp     x14, x15, [x0, #112]
    ldp     x16, x17, [x0, #128]
    ldp     x18, x19, [x0, #144]
    ldp     x20, x21, [x0, #160]
    ldp     x22, x23, [x0, #176]
    ldp     x24, x25, [x0, #192]
    ldp     x26, x27, [x0, #208]
    ldp     x28, x29, [x0, #224]
    ldr     x30, [x0, #240]
    ldp     x0, x1, [x0, #0]
    clrex
    eret
    "#
);

extern "C" {
    fn aarch64_restore_frame(regs: *const SavedRegs, kstack_top: usize) -> !;
}

/// Load a thread's saved register file and return into it, leaving the
/// exception stack pointer at `kstack_top` (the incoming thread's SVC
/// stack). Does not return.
pub fn restore_frame(regs: &SavedRegs, kstack_top: usize) -> ! {
    unsafe { aarch64_restore_frame(regs as *const SavedRegs, kstack_top) }
}

pub fn install_vectors() {
    extern "C" {
        static lupi_vector_table: u8;
    }
    unsafe {
        let vbar = &lupi_vector_table as *const u8 as usize;
        asm!("msr vbar_el1, {}", "isb", in(reg) vbar);
    }
}

const ESR_EC_SHIFT: usize = 26;
const ESR_EC_SVC64: usize = 0x15;

fn read_esr() -> usize {
    let esr: usize;
    unsafe {
        asm!("mrs {}, esr_el1", out(reg) esr);
    }
    esr
}

fn read_far() -> usize {
    let far: usize;
    unsafe {
        asm!("mrs {}, far_el1", out(reg) far);
    }
    far
}

#[no_mangle]
extern "C" fn aarch64_sync_entry(frame: &mut TrapFrame) {
    let esr = read_esr();
    match esr >> ESR_EC_SHIFT {
        ESR_EC_SVC64 => {
            let result =
                crate::syscall::handle_svc(frame.gpr[0], frame.gpr[1], frame.gpr[2], frame);
            frame.gpr[0] = result as usize;
        }
        _ => {
            crate::error!(
                "unhandled sync exception: esr={:#x} far={:#x} pc={:#x}",
                esr,
                read_far(),
                frame.pc
            );
            crate::lib::panic::fatal_exception(frame);
        }
    }
}

#[no_mangle]
extern "C" fn aarch64_irq_entry(frame: &mut TrapFrame) {
    let iar = irq_acknowledge();
    let reschedule = match iar {
        IRQ_TIMER => {
            timer_rearm();
            crate::sched::tick()
        }
        IRQ_UART => {
            while uart_rx_ready() {
                crate::uart::got_char(uart_rx());
            }
            unsafe {
                ptr::write_volatile(UART_ICR as *mut u32, UART_IMSC_RXIM);
            }
            false
        }
        _ => false,
    };
    irq_end(iar);

    let reschedule = crate::sched::dfc::irq_check() || reschedule;
    if reschedule {
        match frame.mode() {
            CpuMode::User => {
                crate::sched::save_current_registers(frame);
                crate::sched::reschedule();
            }
            _ => {
                // Mid-SVC: defer to the syscall exit path
                crate::superpage::with(|s| {
                    s.reschedule_needed_on_svc_exit
                        .store(true, core::sync::atomic::Ordering::Release)
                });
            }
        }
    }
}

#[no_mangle]
extern "C" fn aarch64_fatal_entry(frame: &mut TrapFrame) {
    crate::error!(
        "fatal exception: esr={:#x} far={:#x} pc={:#x}",
        read_esr(),
        read_far(),
        frame.pc
    );
    crate::lib::panic::fatal_exception(frame);
}
