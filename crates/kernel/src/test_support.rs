//! Shared fixtures for the hosted unit tests.
//!
//! Kernel state is a single flat-RAM image, so tests that touch it are
//! serialised behind one lock and each starts from a freshly booted
//! kernel.

use crate::arch::{self, TrapFrame};
use crate::process::{self, image, ThreadId};
use crate::{boot, sched};
use spin::{Mutex, MutexGuard};

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Take the kernel for this test: exclusive access, zeroed RAM, booted
/// tables, and the standard pair of test images registered.
pub fn kernel_fixture() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK.lock();
    arch::reset_ram();
    boot::init_kernel(arch::HOST_RAM_BYTES as u32, 0, boot::boot_mode::INTERPRETER);
    image::reset_for_tests();
    image::register("init");
    image::register("interp");
    arch::set_interrupted_psr(arch::user_psr());
    guard
}

/// Create a process from the named image and return its first thread,
/// which the fixture leaves Ready.
pub fn spawn_test_process(name: &str) -> ThreadId {
    let idx = process::process_new(name).expect("test process creation failed");
    ThreadId::new(idx, 0)
}

/// Add a Ready thread to the process.
pub fn spawn_test_thread(p_idx: u8) -> ThreadId {
    process::thread_new(p_idx, 0).expect("test thread creation failed")
}

/// Issue a syscall the way the SVC vector would: from user mode, with a
/// zeroed frame, and with the first spawned process current.
pub fn svc(cmd: usize, arg1: usize, arg2: usize) -> i64 {
    let mut frame = TrapFrame::new_zeroed();
    frame.psr = arch::user_psr();
    frame.gpr[0] = cmd;
    frame.gpr[1] = arg1;
    frame.gpr[2] = arg2;
    // Make sure a current thread exists the way the dispatcher expects
    crate::superpage::with(|s| {
        if s.current_thread.is_none() {
            s.current_thread = sched::find_next_ready_thread();
            if let Some(tid) = s.current_thread {
                s.current_process = tid.process();
            }
        }
    });
    crate::syscall::handle_svc(cmd, arg1, arg2, &frame)
}
