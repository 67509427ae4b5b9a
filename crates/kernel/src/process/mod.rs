//! Processes and threads.
//!
//! A `Process` is exactly one page, living at a fixed slot in the
//! process-page window; everything a process owns kernel-side has to fit
//! in it, including its inline thread array. Threads are addressed by
//! `ThreadId` (process slot, thread slot) rather than by pointer, which is
//! also what the intrusive scheduler lists link through.

pub mod image;

use crate::arch::{self, SavedRegs};
use crate::lib::error::{KernErr, Result};
use crate::mem::layout::{
    self, PAGE_SHIFT, PAGE_SIZE, USER_HEAP_BASE, USER_STACK_SIZE,
};
use crate::superpage::SuperPage;
use crate::{mem, sched};

pub const MAX_PROCESSES: usize = 256;
/// Bounded by the one-page process invariant: the 64-bit register file
/// makes threads fat enough that only 12 fit alongside the header.
pub const MAX_THREADS: usize = 12;
pub const MAX_PROCESS_NAME: usize = 32;

/// Timeslice quantum in milliseconds.
pub const THREAD_TIMESLICE: u8 = 25;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready = 0,
    /// Reason lives in `exit_reason`.
    BlockedFromSvc = 1,
    Dying = 2,
    Dead = 3,
    WaitForRequest = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BlockedReason {
    OnGetch = 1,
    WaitingForServerConnect = 2,
    InServerConnect = 3,
    WaitingForDfcs = 4,
}

/// Compact thread handle: process slot plus thread slot. The DFC kernel
/// thread has no process and uses the reserved slot 0xFF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId {
    pub proc_idx: u8,
    pub thread_idx: u8,
}

impl ThreadId {
    pub const DFC: ThreadId = ThreadId {
        proc_idx: 0xFF,
        thread_idx: 0,
    };

    pub fn new(proc_idx: u8, thread_idx: u8) -> Self {
        Self {
            proc_idx,
            thread_idx,
        }
    }

    pub fn is_kernel(self) -> bool {
        self.proc_idx == 0xFF
    }

    /// Resolve to the thread record.
    ///
    /// # Safety
    /// Single-core kernel context; the caller owns the resulting exclusive
    /// reference for the duration of the current critical section only.
    pub unsafe fn get(self) -> &'static mut Thread {
        if self.is_kernel() {
            &mut SuperPage::the().dfc_thread
        } else {
            &mut get_process(self.proc_idx).threads[self.thread_idx as usize]
        }
    }

    /// Owning process; None for the DFC thread.
    pub fn process(self) -> Option<u8> {
        if self.is_kernel() {
            None
        } else {
            Some(self.proc_idx)
        }
    }

    /// Packed non-zero word, for atomic slots where 0 means "none".
    pub fn to_word(self) -> u32 {
        ((self.proc_idx as u32) << 8 | self.thread_idx as u32) + 1
    }

    pub fn from_word(w: u32) -> Option<Self> {
        let w = w.checked_sub(1)?;
        Some(Self {
            proc_idx: (w >> 8) as u8,
            thread_idx: (w & 0xFF) as u8,
        })
    }
}

#[repr(C)]
pub struct Thread {
    /// Intrusive list links; also reused by the server blocked-client
    /// list, which is why dequeue nulls them.
    pub prev: Option<ThreadId>,
    pub next: Option<ThreadId>,
    pub index: u8,
    pub state: ThreadState,
    pub timeslice: u8,
    pub completed_requests: u8,
    /// Exit reason, or the `BlockedReason` while state is BlockedFromSvc.
    pub exit_reason: i32,
    pub saved: SavedRegs,
}

impl Thread {
    pub const fn new_dead(index: u8) -> Self {
        Self {
            prev: None,
            next: None,
            index,
            state: ThreadState::Dead,
            timeslice: 0,
            completed_requests: 0,
            exit_reason: 0,
            saved: SavedRegs::new(),
        }
    }

    /// Top of this thread's kernel (SVC) stack.
    pub fn svc_stack_top(&self) -> usize {
        layout::svc_stack_base(self.index as usize) + layout::SVC_STACK_SIZE
    }
}

/// One page, one process. The page is the slot: a process's index is
/// derived from its address in the window and vice versa.
#[repr(C, align(4096))]
pub struct Process {
    /// 0 means the slot is free.
    pub pid: u32,
    pub num_threads: u8,
    /// Physical address of the user page directory (full memory model).
    pub pde_physical: usize,
    pub heap_limit: usize,
    pub name: [u8; MAX_PROCESS_NAME],
    pub threads: [Thread; MAX_THREADS],
}

const _: () = assert!(core::mem::size_of::<Process>() == PAGE_SIZE);

impl Process {
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; MAX_PROCESS_NAME];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    /// True once every thread slot is Dead.
    pub fn all_threads_dead(&self) -> bool {
        self.threads[..self.num_threads as usize]
            .iter()
            .all(|t| t.state == ThreadState::Dead)
    }
}

/// Resolve a process slot to its page in the window.
///
/// # Safety
/// As for `ThreadId::get`.
pub unsafe fn get_process(idx: u8) -> &'static mut Process {
    let phys = arch::PHYS_RAM_BASE + layout::PROCESSES_OFF + ((idx as usize) << PAGE_SHIFT);
    &mut *(mem::phys_to_virt(phys) as *mut Process)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= MAX_PROCESS_NAME {
        return Err(KernErr::BadName);
    }
    Ok(())
}

fn init_thread(p_idx: u8, t: &mut Thread, context: usize) -> Result<()> {
    t.prev = None;
    t.next = None;
    t.state = ThreadState::Dead;
    t.timeslice = THREAD_TIMESLICE;
    t.completed_requests = 0;
    t.exit_reason = 0;

    let stack_base = layout::user_stack_base(t.index as usize);
    mem::map_user_pages(p_idx, stack_base, USER_STACK_SIZE >> PAGE_SHIFT)?;
    if let Err(e) = mem::map_svc_stack(p_idx, layout::svc_stack_base(t.index as usize)) {
        mem::unmap_user_pages(p_idx, stack_base, USER_STACK_SIZE >> PAGE_SHIFT);
        return Err(e);
    }

    t.saved = SavedRegs::new();
    t.saved.sp = stack_base + USER_STACK_SIZE;
    t.saved.psr = arch::user_psr();
    let entry = if t.index == 0 {
        image::process_entry_point()
    } else {
        image::thread_entry_point()
    };
    t.saved.pc = entry;
    t.saved.gpr[0] = context;
    Ok(())
}

fn init_process(p_idx: u8, name: &str) -> Result<()> {
    validate_name(name)?;
    // Fail before touching the slot if there is no such image to run
    image::find(name).ok_or(KernErr::NotFound)?;

    let s = unsafe { SuperPage::the() };
    let p = unsafe { get_process(p_idx) };
    p.pid = s.next_pid;
    s.next_pid += 1;

    mem::process_init(p_idx)?;
    p.heap_limit = USER_HEAP_BASE;

    p.num_threads = 1;
    p.threads[0] = Thread::new_dead(0);
    init_thread(p_idx, &mut p.threads[0], 0).map_err(|_| KernErr::NoMemory)?;
    p.set_name(name);

    sched::set_state(ThreadId::new(p_idx, 0), ThreadState::Ready);
    Ok(())
}

/// Create a process running the named image. Reuses a free slot if one
/// exists, otherwise claims the next page in the window.
pub fn process_new(name: &str) -> Result<u8> {
    let s = unsafe { SuperPage::the() };
    let mut slot: Option<u8> = None;
    for i in 0..s.num_valid_process_pages {
        if unsafe { get_process(i as u8) }.pid == 0 {
            slot = Some(i as u8);
            break;
        }
    }
    if slot.is_none() && (s.num_valid_process_pages as usize) < MAX_PROCESSES {
        let idx = s.num_valid_process_pages as u8;
        mem::new_process_page(idx)?;
        s.num_valid_process_pages += 1;
        slot = Some(idx);
    }
    let idx = slot.ok_or(KernErr::ResourceLimit)?;
    init_process(idx, name)?;
    Ok(idx)
}

/// Switch to the new process and run its first thread. Does not return.
pub fn process_start(p_idx: u8) -> ! {
    mem::switch_process(Some(p_idx));
    mem::finished_updating_page_tables();
    let s = unsafe { SuperPage::the() };
    let tid = ThreadId::new(p_idx, 0);
    s.current_thread = Some(tid);
    // Fresh address space: clear BSS and the initial stack
    unsafe {
        arch::zero_user_pages(layout::USER_BSS, 1);
        arch::zero_user_pages(layout::user_stack_base(0), USER_STACK_SIZE >> PAGE_SHIFT);
    }
    sched::schedule_thread(tid)
}

/// Grow or shrink the heap. Returns false when out of memory or when a
/// shrink would go below the heap base.
pub fn process_grow_heap(p_idx: u8, incr: isize) -> bool {
    let p = unsafe { get_process(p_idx) };
    if incr < 0 {
        // Only whole pages come back, and never below the heap base
        let mut amount = ((-incr) as usize) & !(PAGE_SIZE - 1);
        if amount > p.heap_limit - USER_HEAP_BASE {
            amount = p.heap_limit - USER_HEAP_BASE;
        }
        p.heap_limit -= amount;
        mem::unmap_user_pages(p_idx, p.heap_limit, amount >> PAGE_SHIFT);
        mem::finished_updating_page_tables();
        return true;
    }

    let amount = layout::page_round_up(incr as usize);
    let npages = amount >> PAGE_SHIFT;
    if !mem::grow_heap_allowed(p, amount) {
        return false;
    }
    if mem::map_user_pages(p_idx, p.heap_limit, npages).is_err() {
        return false;
    }
    mem::finished_updating_page_tables();
    unsafe {
        arch::zero_user_pages(p.heap_limit, npages);
    }
    p.heap_limit += amount;
    true
}

/// Add a thread to a process, reusing a Dead slot when one exists.
pub fn thread_new(p_idx: u8, context: usize) -> Result<ThreadId> {
    let p = unsafe { get_process(p_idx) };
    let mut slot: Option<u8> = None;
    for i in 0..p.num_threads {
        if p.threads[i as usize].state == ThreadState::Dead {
            slot = Some(i);
            break;
        }
    }
    if slot.is_none() {
        if (p.num_threads as usize) >= MAX_THREADS {
            return Err(KernErr::ResourceLimit);
        }
        let idx = p.num_threads;
        if p.heap_limit > layout::user_stack_base(idx as usize) {
            // The heap has already grown over this thread's stack area
            return Err(KernErr::ResourceLimit);
        }
        p.threads[idx as usize] = Thread::new_dead(idx);
        p.num_threads += 1;
        slot = Some(idx);
    }
    let idx = slot.ok_or(KernErr::ResourceLimit)?;
    init_thread(p_idx, &mut p.threads[idx as usize], context).map_err(|_| KernErr::NoMemory)?;
    let tid = ThreadId::new(p_idx, idx);
    sched::set_state(tid, ThreadState::Ready);
    Ok(tid)
}

fn free_thread_stacks(p_idx: u8, t_idx: u8) {
    mem::unmap_user_pages(
        p_idx,
        layout::user_stack_base(t_idx as usize),
        USER_STACK_SIZE >> PAGE_SHIFT,
    );
    mem::unmap_user_pages(p_idx, layout::svc_stack_base(t_idx as usize), 1);
}

fn process_exit(p_idx: u8, reason: i32) {
    crate::ipc::process_exited(p_idx);

    let p = unsafe { get_process(p_idx) };
    // Reclaim BSS + heap
    let heap_pages = (p.heap_limit - USER_HEAP_BASE) >> PAGE_SHIFT;
    mem::unmap_user_pages(p_idx, layout::USER_BSS, 1 + heap_pages);

    for i in 0..p.num_threads {
        let t = &mut p.threads[i as usize];
        if t.state != ThreadState::Dead {
            sched::set_state(ThreadId::new(p_idx, i), ThreadState::Dead);
            free_thread_stacks(p_idx, i);
        }
    }

    mem::process_exited(p_idx);

    let s = unsafe { SuperPage::the() };
    if s.current_process == Some(p_idx) {
        s.current_process = None;
    }
    let p = unsafe { get_process(p_idx) };
    crate::debug!("process {} exited with {}", p.name_str(), reason);
    p.pid = 0;
}

/// DFC body: free the dead thread's stacks and, if it was the last live
/// thread, run process teardown. Runs on the DFC stack, not the thread's.
pub fn thread_exit_dfc(arg1: usize, _arg2: usize, _arg3: usize) {
    let tid = ThreadId::from_word(arg1 as u32).expect("bad thread id in exit dfc");
    mem::switch_process(tid.process());
    let (p_idx, t_idx) = (tid.proc_idx, tid.thread_idx);
    free_thread_stacks(p_idx, t_idx);
    sched::set_state(tid, ThreadState::Dead);

    let p = unsafe { get_process(p_idx) };
    // Shrink num_threads over a trailing run of dead slots so the stack
    // area above the heap comes back.
    if t_idx == p.num_threads - 1 {
        while p.num_threads > 0 && p.threads[p.num_threads as usize - 1].state == ThreadState::Dead
        {
            p.num_threads -= 1;
        }
    }
    if p.all_threads_dead() {
        let reason = unsafe { tid.get() }.exit_reason;
        process_exit(p_idx, reason);
    }
}

/// Exit the calling thread. The stacks are freed by a DFC because the
/// thread is still standing on its SVC stack here. Does not return.
pub fn thread_exit(tid: ThreadId, reason: i32) -> ! {
    let s = unsafe { SuperPage::the() };
    assert_eq!(s.current_thread, Some(tid));
    let t = unsafe { tid.get() };
    t.exit_reason = reason;
    sched::set_state(tid, ThreadState::Dying);
    crate::sched::dfc::queue(thread_exit_dfc, tid.to_word() as usize, 0, 0);
    sched::reschedule()
}

/// Tear the current process down and re-initialise it from a different
/// image, keeping the thread identity. Only meaningful in the embedded
/// memory model; with full translation there is no point supporting it.
pub fn process_reset(tid: ThreadId, name: &str) -> Result<()> {
    if cfg!(feature = "mmu") {
        return Err(KernErr::NotSupported);
    }
    let p_idx = tid.proc_idx;
    let p = unsafe { get_process(p_idx) };
    assert_eq!(tid.thread_idx, 0);
    assert_eq!(p.num_threads, 1);
    process_exit(p_idx, 0);
    init_process(p_idx, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel_fixture;

    #[test]
    fn test_process_new_assigns_pid_and_name() {
        let _g = kernel_fixture();
        let idx = process_new("init").unwrap();
        let p = unsafe { get_process(idx) };
        assert_eq!(p.pid, 1);
        assert_eq!(p.name_str(), "init");
        assert_eq!(p.num_threads, 1);
        assert_eq!(p.heap_limit, USER_HEAP_BASE);
        assert_eq!(p.threads[0].state, ThreadState::Ready);
    }

    #[test]
    fn test_process_new_unknown_image_fails_cleanly() {
        let _g = kernel_fixture();
        assert_eq!(process_new("no-such-image"), Err(KernErr::NotFound));
        // Slot is reusable afterwards
        let idx = process_new("init").unwrap();
        assert!(unsafe { get_process(idx) }.pid != 0);
    }

    #[test]
    fn test_bad_names_are_rejected() {
        let _g = kernel_fixture();
        assert_eq!(process_new(""), Err(KernErr::BadName));
        let long = core::str::from_utf8(&[b'x'; MAX_PROCESS_NAME]).unwrap();
        assert_eq!(process_new(long), Err(KernErr::BadName));
    }

    #[test]
    fn test_sbrk_round_trip_restores_limit() {
        let _g = kernel_fixture();
        let idx = process_new("init").unwrap();
        let p = unsafe { get_process(idx) };
        let before = p.heap_limit;
        assert!(process_grow_heap(idx, 3 * PAGE_SIZE as isize));
        assert_eq!(p.heap_limit, before + 3 * PAGE_SIZE);
        assert!(process_grow_heap(idx, -(3 * PAGE_SIZE as isize)));
        assert_eq!(p.heap_limit, before);
    }

    #[test]
    fn test_heap_shrink_clamps_at_base() {
        let _g = kernel_fixture();
        let idx = process_new("init").unwrap();
        assert!(process_grow_heap(idx, PAGE_SIZE as isize));
        assert!(process_grow_heap(idx, -(64 * PAGE_SIZE as isize)));
        assert_eq!(unsafe { get_process(idx) }.heap_limit, USER_HEAP_BASE);
    }

    #[test]
    fn test_thread_slots_are_reused() {
        let _g = kernel_fixture();
        let p_idx = process_new("init").unwrap();
        let t1 = thread_new(p_idx, 0xAA).unwrap();
        assert_eq!(t1.thread_idx, 1);
        assert_eq!(unsafe { t1.get() }.saved.gpr[0], 0xAA);

        // Kill it the bookkeeping way and watch the slot come back
        sched::set_state(t1, ThreadState::Dead);
        let t2 = thread_new(p_idx, 0xBB).unwrap();
        assert_eq!(t2.thread_idx, 1);
    }

    #[test]
    fn test_last_thread_death_reclaims_process() {
        let _g = kernel_fixture();
        let idx = process_new("init").unwrap();
        crate::superpage::with(|s| s.current_process = Some(idx));
        let page = crate::ipc::new_shared_page();
        assert_ne!(page, 0);
        let tid = ThreadId::new(idx, 0);
        unsafe { tid.get() }.exit_reason = 7;
        sched::set_state(tid, ThreadState::Dying);

        // Run the exit DFC body the way the drain thread would
        thread_exit_dfc(tid.to_word() as usize, 0, 0);

        let p = unsafe { get_process(idx) };
        assert_eq!(p.pid, 0);
        assert_eq!(unsafe { tid.get() }.state, ThreadState::Dead);
        // Shared-page ownership went away with the process
        assert_eq!(
            crate::superpage::with(|s| s.shared_page_mappings[0]),
            0
        );
        // The slot is immediately reusable
        let again = process_new("interp").unwrap();
        assert_eq!(again, idx);
        assert_eq!(unsafe { get_process(again) }.pid, 2);
    }

    #[test]
    fn test_thread_limit() {
        let _g = kernel_fixture();
        let p_idx = process_new("init").unwrap();
        for _ in 1..MAX_THREADS {
            thread_new(p_idx, 0).unwrap();
        }
        assert_eq!(thread_new(p_idx, 0), Err(KernErr::ResourceLimit));
    }
}
