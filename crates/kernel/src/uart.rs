//! Console byte flow between the UART interrupt and consuming threads.
//!
//! The receive interrupt hands each byte to `got_char`, which delivers it
//! to the most eager consumer: a thread parked in a synchronous Getch, an
//! armed async request, or the SuperPage ring. A full ring drops the byte
//! and counts it. The wire format is 115200-8-N-1; the MMIO itself lives
//! behind `arch`.

use crate::process::ThreadState;
use crate::sched;
use crate::superpage::{self, SuperPage};
use crate::{arch, lib::printk};
use core::sync::atomic::Ordering;

pub fn putbyte(b: u8) {
    arch::uart_tx(b);
}

/// A byte is available without blocking.
pub fn byte_ready() -> bool {
    let buffered = superpage::with(|s| !s.uart_ring.is_empty());
    buffered || arch::uart_rx_ready()
}

/// Blocking read: drain the ring first, then poll the receiver. Warns
/// once about overrun unless the console is quieted.
pub fn getch() -> u8 {
    let s = unsafe { SuperPage::the() };
    if !printk::quiet() {
        let dropped = s.uart_dropped_chars.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            crate::warn!("{} dropped chars", dropped);
        }
    }
    if !s.uart_ring.is_empty() {
        return s.uart_ring.pop();
    }
    loop {
        if arch::uart_rx_ready() {
            return arch::uart_rx();
        }
        core::hint::spin_loop();
    }
}

/// Receive path, interrupt context. Delivery order: the Getch-blocked
/// thread, the armed async request, the ring, the bit bucket.
pub fn got_char(b: u8) {
    if let Some(tid) = superpage::take_blocked_getch() {
        // The byte becomes the blocked thread's syscall result; the
        // wait-for-interrupt in the idle loop takes care of the rest.
        sched::write_svc_result(tid, b as usize);
        sched::set_state(tid, ThreadState::Ready);
        return;
    }
    let s = unsafe { SuperPage::the() };
    if s.uart_request.is_armed() {
        sched::dfc::request_complete(&mut s.uart_request, b as isize);
    } else if !s.uart_ring.is_full() {
        s.uart_ring.push(b);
    } else {
        s.uart_dropped_chars.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::BlockedReason;
    use crate::superpage::UART_RING_SIZE;
    use crate::test_support::{kernel_fixture, spawn_test_process};

    #[test]
    fn test_blocked_getch_thread_wins_the_byte() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        sched::set_state(tid, ThreadState::BlockedFromSvc);
        sched::set_blocked_reason(tid, BlockedReason::OnGetch);
        superpage::set_blocked_getch(tid);

        got_char(0x41);
        let t = unsafe { tid.get() };
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(t.saved.gpr[0], 0x41);
        // Claimed exactly once; the ring saw nothing
        assert!(superpage::with(|s| s.uart_ring.is_empty()));
        assert!(superpage::take_blocked_getch().is_none());
    }

    #[test]
    fn test_armed_async_request_completes_via_dfc() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let rec = [0usize; 2];
        superpage::with(|s| s.uart_request.set(tid, rec.as_ptr() as usize));

        got_char(0x42);
        assert!(superpage::with(|s| !s.uart_request.is_armed()));
        crate::sched::dfc::drain_for_test();
        assert_eq!(rec[0], 0x42);
        assert_eq!(unsafe { tid.get() }.completed_requests, 1);
        // Follow-up bytes fall through to the ring
        got_char(0x43);
        assert_eq!(superpage::with(|s| s.uart_ring.pop()), 0x43);
    }

    #[test]
    fn test_async_byte_wakes_wait_for_any_request() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let rec = [0usize; 2];
        superpage::with(|s| s.uart_request.set(tid, rec.as_ptr() as usize));
        // Thread goes to sleep waiting for the completion
        sched::set_state(tid, ThreadState::WaitForRequest);

        got_char(0x41);
        crate::sched::dfc::drain_for_test();

        let t = unsafe { tid.get() };
        assert_eq!(t.state, ThreadState::Ready);
        // WaitForAnyRequest returns the completion count...
        assert_eq!(t.saved.gpr[0], 1);
        assert_eq!(t.completed_requests, 0);
        // ...and the user record carries the byte and the completion flags
        assert_eq!(rec[0], 0x41);
        let flags = crate::request::AsyncFlags::from_bits_truncate(rec[1] as u32);
        assert!(flags.contains(crate::request::AsyncFlags::COMPLETED));
    }

    #[test]
    fn test_buffered_bytes_come_back_fifo() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        for b in [1u8, 2, 3] {
            got_char(b);
        }
        assert!(byte_ready());
        assert_eq!(getch(), 1);
        assert_eq!(getch(), 2);
        assert_eq!(getch(), 3);
        assert!(!byte_ready());
    }

    #[test]
    fn test_overrun_counts_dropped_chars() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        for b in 0..=UART_RING_SIZE as u8 + 1 {
            got_char(b);
        }
        assert_eq!(
            superpage::with(|s| s.uart_dropped_chars.load(Ordering::Relaxed)),
            2
        );
        // Ring still intact underneath
        assert_eq!(getch(), 0);
        assert_eq!(
            superpage::with(|s| s.uart_dropped_chars.load(Ordering::Relaxed)),
            0
        );
    }
}
