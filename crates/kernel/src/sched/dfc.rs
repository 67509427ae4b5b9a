//! Deferred function calls.
//!
//! Interrupt handlers queue work here instead of doing it in interrupt
//! context; the queue drains with interrupts enabled on its own stack. In
//! the full memory model the drain runs on a dedicated kernel thread that
//! blocks between batches; the embedded model drains in the
//! PendSV-equivalent slot on the way out of an interrupt.
//!
//! The ring is bounded and queueing past capacity is a kernel bug, not a
//! recoverable error.

use super::{reschedule, set_blocked_reason, set_state};
use crate::process::{BlockedReason, ThreadId, ThreadState};
use crate::request::KAsyncRequest;
use crate::superpage::{Dfc, DfcFn, SuperPage, MAX_DFCS};
use crate::{arch, mem};
use core::sync::atomic::Ordering;

/// Queue `func(a1, a2, a3)` for the next drain. Interrupt-safe.
pub fn queue(func: DfcFn, a1: usize, a2: usize, a3: usize) {
    let s = unsafe { SuperPage::the() };
    let n = s.num_dfcs_pending.fetch_add(1, Ordering::AcqRel) + 1;
    assert!(n as usize <= MAX_DFCS, "dfc ring overflow");
    let slot = &mut s.dfcs[n as usize - 1];
    slot.func = Some(func);
    slot.args = [a1, a2, a3];
}

fn do_request_complete(a1: usize, a2: usize, a3: usize) {
    let tid = ThreadId::from_word(a1 as u32).expect("bad thread id in completion dfc");
    assert!(a2 != 0);
    crate::request::complete_at(tid, a2, a3 as isize);
}

/// Complete an async request from interrupt context: take ownership of
/// the user pointer now (atomic swap, as if it had completed) and do the
/// user-memory write later on the drain stack.
pub fn request_complete(req: &mut KAsyncRequest, result: isize) {
    let Some(thread) = req.thread else { return };
    let Some(ptr) = req.take() else {
        // Lost the swap: the owner cancelled, drop the completion
        return;
    };
    queue(do_request_complete, thread.to_word() as usize, ptr, result as usize);
}

/// Snapshot and reset the pending ring. Returns the number of entries
/// copied into `buf`.
fn snapshot(buf: &mut [Dfc; MAX_DFCS]) -> usize {
    let s = unsafe { SuperPage::the() };
    let n = s.num_dfcs_pending.swap(0, Ordering::AcqRel) as usize;
    buf[..n].copy_from_slice(&s.dfcs[..n]);
    n
}

fn run(n: usize, dfcs: &[Dfc]) {
    for dfc in &dfcs[..n] {
        if let Some(f) = dfc.func {
            f(dfc.args[0], dfc.args[1], dfc.args[2]);
        }
    }
}

/// Body of the DFC kernel thread: run the batch that was staged on our
/// stack, then block until the next interrupt readies us again.
extern "C" fn dfc_thread_body() -> ! {
    loop {
        let mut batch = [Dfc::empty(); MAX_DFCS];
        let n = snapshot(&mut batch);
        arch::enable_irqs();
        run(n, &batch);
        // State changes on ourselves need the interrupts off
        arch::disable_irqs();
        set_state(ThreadId::DFC, ThreadState::BlockedFromSvc);
        set_blocked_reason(ThreadId::DFC, BlockedReason::WaitingForDfcs);
        reschedule();
    }
}

/// End-of-interrupt check: if DFCs are pending and the drain thread is
/// not already scheduled, ready it. Returns true when a reschedule is
/// needed to let it run.
pub fn irq_check() -> bool {
    let s = unsafe { SuperPage::the() };
    if s.dfc_thread.state == ThreadState::Ready {
        // Already scheduled or running; it will pick the new work up
        return false;
    }
    if s.num_dfcs_pending.load(Ordering::Acquire) == 0 {
        return false;
    }
    // First ever wake finds the thread Dead; set up its frame so the
    // scheduler drops it straight into the drain loop on the DFC stack.
    let t = &mut s.dfc_thread;
    t.saved.pc = dfc_thread_body as usize;
    t.saved.sp = mem::layout::kern_addr(mem::layout::DFC_STACK_OFF) + mem::layout::PAGE_SIZE;
    t.saved.psr = arch::kern_thread_psr();
    set_state(ThreadId::DFC, ThreadState::Ready);
    true
}

/// Synchronous drain used by the embedded build's PendSV slot and by the
/// hosted tests: snapshot, run with interrupts enabled, restore.
pub fn drain_inline() {
    let mut batch = [Dfc::empty(); MAX_DFCS];
    arch::disable_irqs();
    let n = snapshot(&mut batch);
    arch::enable_irqs();
    run(n, &batch);
}

#[cfg(test)]
pub fn drain_for_test() {
    drain_inline();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superpage;
    use crate::test_support::kernel_fixture;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn bump(a1: usize, _a2: usize, _a3: usize) {
        CALLS.fetch_add(a1, Ordering::Relaxed);
    }

    #[test]
    fn test_queue_and_drain_runs_in_order() {
        let _g = kernel_fixture();
        CALLS.store(0, Ordering::Relaxed);
        queue(bump, 1, 0, 0);
        queue(bump, 10, 0, 0);
        queue(bump, 100, 0, 0);
        assert_eq!(
            superpage::with(|s| s.num_dfcs_pending.load(Ordering::Relaxed)),
            3
        );
        drain_inline();
        assert_eq!(CALLS.load(Ordering::Relaxed), 111);
        assert_eq!(
            superpage::with(|s| s.num_dfcs_pending.load(Ordering::Relaxed)),
            0
        );
    }

    #[test]
    #[should_panic(expected = "dfc ring overflow")]
    fn test_ring_overflow_is_fatal() {
        let _g = kernel_fixture();
        for _ in 0..=MAX_DFCS {
            queue(bump, 0, 0, 0);
        }
    }

    #[test]
    fn test_irq_check_readies_drain_thread_once() {
        let _g = kernel_fixture();
        queue(bump, 0, 0, 0);
        assert!(irq_check());
        let s = unsafe { SuperPage::the() };
        assert_eq!(s.dfc_thread.state, ThreadState::Ready);
        // Second check while scheduled: nothing more to do
        assert!(!irq_check());
        drain_inline();
    }

    #[test]
    fn test_request_complete_takes_ownership() {
        let _g = kernel_fixture();
        let tid = crate::test_support::spawn_test_process("init");
        let rec = [0usize; 2];
        let mut req = KAsyncRequest::new();
        req.set(tid, &rec as *const _ as usize);

        request_complete(&mut req, 0x5A);
        // Slot already disarmed even though the write is still queued
        assert!(!req.is_armed());
        request_complete(&mut req, 0x77); // lost swap: silently dropped

        drain_inline();
        assert_eq!(rec[0], 0x5A);
        assert_eq!(
            superpage::with(|s| s.num_dfcs_pending.load(Ordering::Relaxed)),
            0
        );
    }
}
