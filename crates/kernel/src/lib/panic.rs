// Crash path.
//
// Fatal conditions capture the register state into the SuperPage, dump
// it on the console, and either hang in wait-for-interrupt or hand over
// to the external debug overlay when one is configured (marvin mode).
// The primary kernel state is considered poisoned from then on.

use crate::arch::{self, SavedRegs, TrapFrame, REGISTER_NOT_SAVED};
use crate::superpage::SuperPage;

/// Dead stop: interrupts off, wait-for-interrupt forever.
pub fn hang() -> ! {
    arch::disable_irqs();
    loop {
        arch::wait_for_interrupt();
    }
}

fn dump(regs: &SavedRegs) {
    for (i, chunk) in regs.gpr.chunks(4).enumerate() {
        crate::kprint!("x{:<2}:", i * 4);
        for r in chunk {
            crate::kprint!(" {:016x}", r);
        }
        crate::kprint!("\n");
    }
    crate::kprint!(
        "sp:  {:016x} pc: {:016x} psr: {:08x}\n",
        regs.sp,
        regs.pc,
        regs.psr
    );
}

fn enter_crashed_state(regs: &SavedRegs) -> ! {
    let s = unsafe { SuperPage::the() };
    if !s.marvin {
        // First crash: preserve the register file for the overlay
        s.crash_registers = *regs;
        s.marvin = true;
    }
    dump(regs);
    // The debug overlay, when present, takes over on its own stack and
    // reads (never writes) ordinary kernel structures. Without one we
    // stop here.
    hang()
}

/// Unhandled exception with a full trap frame.
pub fn fatal_exception(frame: &TrapFrame) -> ! {
    let regs = SavedRegs {
        gpr: frame.gpr,
        sp: frame.sp,
        pc: frame.pc,
        psr: frame.psr,
    };
    enter_crashed_state(&regs)
}

/// Kernel assertion failure without a frame: the register file is gone,
/// record the poison pattern so the dump says so.
pub fn kabort() -> ! {
    let regs = SavedRegs {
        gpr: [REGISTER_NOT_SAVED; arch::NUM_GPRS],
        sp: 0,
        pc: 0,
        psr: 0,
    };
    enter_crashed_state(&regs)
}

#[cfg(all(not(test), target_arch = "aarch64"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::kprint!("kernel panic: {}\n", info);
    kabort()
}
