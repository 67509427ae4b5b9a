//! Thread-owned completion records.
//!
//! User code hands the kernel the address of a two-word `AsyncRequest`
//! (`result`, `flags`). The kernel keeps the owning thread and that
//! address in a `KAsyncRequest` slot; whoever completes the request writes
//! the result into user memory with user privilege and then signals the
//! owning thread. Ownership of a slot is taken with an atomic swap of the
//! user address, so an IRQ and a cancelling owner can race safely: whoever
//! swaps a non-zero address out is the one that delivers.

use crate::process::{ThreadId, ThreadState};
use crate::sched;
use crate::syscall::uaccess;
use core::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
    /// Flag word of the user-side `AsyncRequest`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AsyncFlags: u32 {
        /// Tracked by the user-side run loop.
        const PENDING = 1;
        /// Handed to the kernel.
        const ACCEPTED = 2;
        /// Completed by the kernel.
        const COMPLETED = 4;
        /// The result word is an integer. The only kind this kernel
        /// produces; anything else is an error surface, not a contract.
        const INT_RESULT = 8;
    }
}

/// Byte offset of the flags word within the user struct.
pub const ASYNC_FLAGS_OFFSET: usize = core::mem::size_of::<usize>();

/// Kernel-side view of one outstanding request.
#[repr(C)]
pub struct KAsyncRequest {
    pub thread: Option<ThreadId>,
    user_ptr: AtomicUsize,
}

impl KAsyncRequest {
    pub const fn new() -> Self {
        Self {
            thread: None,
            user_ptr: AtomicUsize::new(0),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.user_ptr.load(Ordering::Acquire) != 0
    }

    pub fn set(&mut self, thread: ThreadId, user_ptr: usize) {
        self.thread = Some(thread);
        self.user_ptr.store(user_ptr, Ordering::Release);
    }

    /// Take exclusive ownership of the pending address, zeroing the slot.
    /// Returns None if someone else (completer or canceller) already won.
    pub fn take(&self) -> Option<usize> {
        let ptr = self.user_ptr.swap(0, Ordering::AcqRel);
        if ptr == 0 {
            None
        } else {
            Some(ptr)
        }
    }

    /// Complete in kernel-thread context: write the user record and wake
    /// the owner. No-op if the request is not armed.
    pub fn complete(&mut self, result: isize) {
        let Some(thread) = self.thread else { return };
        let Some(ptr) = self.take() else { return };
        complete_at(thread, ptr, result);
    }
}

/// Write `result` + completion flags into the user record at `user_ptr`
/// (owned by `thread`), then signal the thread. The write happens in the
/// owner's address space with user privilege so protection still applies.
pub fn complete_at(thread: ThreadId, user_ptr: usize, result: isize) {
    let old = crate::mem::switch_process(thread.process());
    uaccess::write_user_word(thread.process(), user_ptr, result as usize);
    uaccess::write_user_u32(
        thread.process(),
        user_ptr + ASYNC_FLAGS_OFFSET,
        (AsyncFlags::PENDING | AsyncFlags::COMPLETED | AsyncFlags::INT_RESULT).bits(),
    );
    crate::mem::switch_process(old);
    signal(thread);
}

/// Count one completion against the owning thread; if it is parked in
/// WaitForRequest the count becomes its syscall result and it goes Ready.
pub fn signal(tid: ThreadId) {
    let t = unsafe { tid.get() };
    t.completed_requests += 1;
    if t.state == ThreadState::WaitForRequest {
        sched::write_svc_result(tid, t.completed_requests as usize);
        t.completed_requests = 0;
        sched::set_state(tid, ThreadState::Ready);
        // The next reschedule runs it
    }
}
