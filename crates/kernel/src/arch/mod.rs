//! Architecture layer.
//!
//! Everything privileged lives behind this module: exception-frame
//! save/restore, interrupt masking, the wait-for-interrupt idle, user-mode
//! stores, address-space switching and the console byte pipes. Scheduling
//! code only ever sees `SavedRegs` and `TrapFrame` opaquely.
//!
//! Two backends exist: `aarch64` for hardware, and a flat-RAM `host` shim
//! used by every other target (the hosted build configuration, which also
//! carries the unit tests).

use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(not(target_arch = "aarch64"))]
mod host;
#[cfg(not(target_arch = "aarch64"))]
pub use host::*;

pub const NUM_GPRS: usize = 31;

/// Execution mode of an interrupted context, as recorded in its saved
/// program status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    User,
    Svc,
    Irq,
}

/// Register file snapshot of a thread that is not running.
///
/// `gpr[0]` doubles as the syscall result slot: whatever is here when the
/// thread is next scheduled lands in its first argument register.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SavedRegs {
    pub gpr: [usize; NUM_GPRS],
    pub sp: usize,
    pub pc: usize,
    pub psr: usize,
}

/// Poison value stored in registers that were never saved, so register
/// dumps make the fact obvious.
pub const REGISTER_NOT_SAVED: usize = 0xA11F_ADE5;

impl SavedRegs {
    pub const fn new() -> Self {
        Self {
            gpr: [REGISTER_NOT_SAVED; NUM_GPRS],
            sp: 0,
            pc: 0,
            psr: 0,
        }
    }
}

impl Default for SavedRegs {
    fn default() -> Self {
        Self::new()
    }
}

/// Register state captured on kernel entry (SVC or IRQ).
///
/// On the SVC path only the argument registers and return state are
/// meaningful; the IRQ path captures the full file.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TrapFrame {
    pub gpr: [usize; NUM_GPRS],
    pub sp: usize,
    pub pc: usize,
    pub psr: usize,
}

impl TrapFrame {
    pub const fn new_zeroed() -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            psr: 0,
        }
    }

    /// Mode the trap came from, decoded from the saved status word.
    pub fn mode(&self) -> CpuMode {
        psr_mode(self.psr)
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Interrupt-disable guard. Constructing it masks interrupts; dropping it
/// restores the previous mask state. Nesting is fine.
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let was_enabled = irqs_enabled();
        disable_irqs();
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_irqs();
        }
    }
}

/// Reboot marker set by the host shim before it bails out; on hardware
/// `reboot` is a firmware call and never returns.
pub static REBOOT_REQUESTED: AtomicU8 = AtomicU8::new(0);

pub fn reboot_requested() -> bool {
    REBOOT_REQUESTED.load(Ordering::Relaxed) != 0
}
