//! Syscall dispatch.
//!
//! Entered from the SVC exception with the call number and two argument
//! words in the first three registers. Calls either return a result word
//! synchronously (negative = error) or park the calling thread and
//! reschedule; a parked thread's result is materialised into its saved
//! `gpr[0]` before it next runs.
//!
//! On the way out, with interrupts disabled, the dispatcher honours
//! `reschedule_needed_on_svc_exit`: a timeslice that expired while we
//! were in here forces the switch now rather than mid-syscall.

pub mod uaccess;

use crate::arch::{self, TrapFrame};
use crate::lib::error::KernErr;
use crate::process::{self, BlockedReason, ThreadId, ThreadState};
use crate::superpage::{self, SuperPage};
use crate::{driver, ipc, sched, uart};
use core::sync::atomic::Ordering;

/// Marker bit for calls that never block; decode just strips it.
pub const FAST_EXEC: usize = 0x0080_0000;
/// Calls with this bit set route to the driver whose handle is in the low
/// byte.
pub const DRIVER_HANDLE: usize = 0x0040_0000;

pub mod numbers {
    pub const SBRK: usize = 1;
    pub const PRINT_STRING: usize = 2;
    pub const PUTCH: usize = 3;
    pub const GETCH: usize = 4;
    pub const CREATE_PROCESS: usize = 5;
    pub const GET_UPTIME: usize = 6;
    pub const THREAD_EXIT: usize = 7;
    pub const WAIT_FOR_ANY_REQUEST: usize = 8;
    pub const GETCH_ASYNC: usize = 9;
    pub const ABORT: usize = 10;
    pub const NEW_SHARED_PAGE: usize = 11;
    pub const CREATE_SERVER: usize = 13;
    pub const CONNECT_TO_SERVER: usize = 14;
    pub const COMPLETE_IPC_REQUEST: usize = 15;
    pub const REQUEST_SERVER_MSG: usize = 16;
    pub const SET_TIMER: usize = 17;
    pub const REBOOT: usize = 18;
    pub const GET_INT: usize = 19;
    pub const THREAD_YIELD: usize = 20;
    pub const THREAD_CREATE: usize = 21;
    pub const DRIVER_CONNECT: usize = 22;
    pub const STFU: usize = 23;
    pub const REPLACE_PROCESS: usize = 24;
    pub const GET_STRING: usize = 25;
}

/// Values readable through GetInt.
pub mod values {
    pub const TOTAL_RAM: usize = 0;
    pub const BOOT_MODE: usize = 1;
    pub const SCREEN_WIDTH: usize = 2;
    pub const SCREEN_HEIGHT: usize = 3;
    pub const SCREEN_FORMAT: usize = 4;
    pub const VERSION: usize = 0;
}

pub const VERSION_STRING: &str = "LuPi 0.17";
/// NUL-terminated copy handed out by GetString; kernel text is readable
/// (not writable) from user mode.
static VERSION_CSTR: &[u8] = b"LuPi 0.17\0";

fn err(e: KernErr) -> i64 {
    e.as_isize() as i64
}

/// The syscall entry point. `frame` is the trap frame of the caller, used
/// when the call blocks and the registers need saving.
pub fn handle_svc(cmd: usize, arg1: usize, arg2: usize, frame: &TrapFrame) -> i64 {
    let cmd = cmd & !FAST_EXEC;
    #[cfg(feature = "syscall-verbose")]
    crate::debug!("svc {:#x}({:#x}, {:#x})", cmd, arg1, arg2);

    let s = unsafe { SuperPage::the() };
    let current = s.current_thread;

    let result: i64 = match cmd {
        numbers::SBRK => {
            let p_idx = s.current_process.expect("sbrk with no process");
            let p = unsafe { process::get_process(p_idx) };
            if arg1 == 0 {
                p.heap_limit as i64
            } else {
                let old = p.heap_limit;
                if process::process_grow_heap(p_idx, arg1 as isize) {
                    old as i64
                } else {
                    -1
                }
            }
        }

        numbers::PRINT_STRING => {
            let mut buf = [0u8; uaccess::MAX_USER_STR];
            match uaccess::str_from_user(s.current_process, arg1, &mut buf) {
                Ok(text) => {
                    crate::kprint!("{}", text);
                    0
                }
                Err(e) => err(e),
            }
        }

        numbers::PUTCH => {
            uart::putbyte(arg1 as u8);
            0
        }

        numbers::GETCH => {
            if uart::byte_ready() {
                uart::getch() as i64
            } else {
                let tid = current.expect("getch with no thread");
                sched::save_current_registers(frame);
                sched::set_state(tid, ThreadState::BlockedFromSvc);
                sched::set_blocked_reason(tid, BlockedReason::OnGetch);
                superpage::set_blocked_getch(tid);
                // The UART interrupt fills in our result register and
                // readies us; we come back to life in user mode with the
                // byte already in place.
                sched::reschedule()
            }
        }

        numbers::GETCH_ASYNC => {
            let tid = current.expect("getch_async with no thread");
            match uaccess::check_word(arg1) {
                Err(e) => err(e),
                Ok(ptr) => {
                    if uart::byte_ready() {
                        crate::request::complete_at(tid, ptr, uart::getch() as isize);
                    } else {
                        s.uart_request.set(tid, ptr);
                    }
                    0
                }
            }
        }

        numbers::CREATE_PROCESS => {
            let mut buf = [0u8; process::MAX_PROCESS_NAME];
            match uaccess::str_from_user(s.current_process, arg1, &mut buf) {
                Err(e) => err(e),
                Ok(name) => match process::process_new(name) {
                    Err(e) => err(e),
                    Ok(new_idx) => {
                        let tid = current.expect("create_process with no thread");
                        let pid = unsafe { process::get_process(new_idx) }.pid;
                        sched::save_current_registers(frame);
                        sched::write_svc_result(tid, pid as usize);
                        // Runs the new process now; we resume later with
                        // the pid already staged as our result.
                        process::process_start(new_idx)
                    }
                },
            }
        }

        numbers::THREAD_CREATE => {
            let p_idx = s.current_process.expect("thread_create with no process");
            match process::thread_new(p_idx, arg1) {
                Ok(_) => 0,
                Err(e) => err(e),
            }
        }

        numbers::THREAD_EXIT => {
            let tid = current.expect("thread_exit with no thread");
            process::thread_exit(tid, arg1 as i32)
        }

        numbers::THREAD_YIELD => {
            let tid = current.expect("yield with no thread");
            sched::save_current_registers(frame);
            sched::yield_to_tail(tid);
            sched::reschedule()
        }

        numbers::WAIT_FOR_ANY_REQUEST => {
            let tid = current.expect("wfar with no thread");
            let t = unsafe { tid.get() };
            if t.completed_requests > 0 {
                let n = t.completed_requests as i64;
                t.completed_requests = 0;
                n
            } else {
                sched::save_current_registers(frame);
                sched::set_state(tid, ThreadState::WaitForRequest);
                sched::reschedule()
            }
        }

        numbers::GET_UPTIME => s.uptime_ms() as i64,

        numbers::NEW_SHARED_PAGE => ipc::new_shared_page() as i64,

        numbers::CREATE_SERVER => {
            let tid = current.expect("create_server with no thread");
            match ipc::create_server(arg1 as u32, tid) {
                Ok(idx) => idx as i64,
                Err(e) => err(e),
            }
        }

        numbers::CONNECT_TO_SERVER => {
            let tid = current.expect("connect with no thread");
            // Always save: delivery (or blocking) hands the result back
            // through the saved registers.
            sched::save_current_registers(frame);
            match ipc::connect_to_server(arg1 as u32, arg2, tid) {
                Err(e) => err(e),
                Ok(never) => match never {},
            }
        }

        numbers::REQUEST_SERVER_MSG => {
            let tid = current.expect("server msg with no thread");
            match ipc::request_server_msg(tid, arg1) {
                Ok(()) => 0,
                Err(e) => err(e),
            }
        }

        numbers::COMPLETE_IPC_REQUEST => match ipc::complete_request(arg1, arg2 != 0) {
            Ok(v) => v as i64,
            Err(e) => err(e),
        },

        numbers::SET_TIMER => {
            let tid = current.expect("set_timer with no thread");
            set_timer(s, tid, arg1, arg2)
        }

        numbers::GET_INT => match arg1 {
            values::TOTAL_RAM => s.total_ram as i64,
            values::BOOT_MODE => s.boot_mode as i64,
            values::SCREEN_WIDTH => s.screen_width as i64,
            values::SCREEN_HEIGHT => s.screen_height as i64,
            values::SCREEN_FORMAT => s.screen_format as i64,
            _ => err(KernErr::Argument),
        },

        numbers::GET_STRING => match arg1 {
            values::VERSION => VERSION_CSTR.as_ptr() as i64,
            _ => 0,
        },

        numbers::DRIVER_CONNECT => driver::connect(arg1 as u32),

        numbers::STFU => {
            crate::lib::printk::set_quiet(arg1 != 0);
            0
        }

        numbers::REBOOT => arch::reboot(),

        numbers::REPLACE_PROCESS => {
            let tid = current.expect("replace with no thread");
            let mut buf = [0u8; process::MAX_PROCESS_NAME];
            match uaccess::str_from_user(s.current_process, arg1, &mut buf) {
                Err(e) => err(e),
                Ok(name) => match process::process_reset(tid, name) {
                    Err(e) => err(e),
                    Ok(()) => process::process_start(tid.proc_idx),
                },
            }
        }

        numbers::ABORT => {
            if current.is_some() {
                sched::save_current_registers(frame);
                let p_idx = s.current_process.expect("abort with no process");
                crate::error!(
                    "abort called by process {}",
                    unsafe { process::get_process(p_idx) }.name_str()
                );
            } else {
                crate::error!("abort called during boot");
            }
            crate::lib::panic::kabort()
        }

        _ if cmd & DRIVER_HANDLE != 0 => driver::exec(cmd, arg1, arg2),

        _ => {
            crate::warn!("unrecognised syscall {:#x}", cmd);
            err(KernErr::NotSupported)
        }
    };

    svc_exit_check(frame, result);
    result
}

fn set_timer(s: &mut SuperPage, tid: ThreadId, req_ptr: usize, time_ptr: usize) -> i64 {
    if let Some(owner) = s.timer_request.thread {
        if owner != tid {
            crate::warn!("timer slot already owned by another thread");
            return err(KernErr::AlreadyExists);
        }
    }
    let req_ptr = match uaccess::check_word(req_ptr) {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    let due = match uaccess::read_user_u64(s.current_process, time_ptr) {
        Ok(v) => v,
        Err(e) => return err(e),
    };
    s.timer_request.set(tid, req_ptr);
    if due <= s.uptime_ms() {
        // Already due: complete before returning, not on a later tick
        s.timer_completion_time = u64::MAX;
        s.timer_request.complete(0);
    } else {
        s.timer_completion_time = due;
    }
    0
}

/// Syscall epilogue: with interrupts off, honour a reschedule request
/// posted by the tick while we were servicing the call.
fn svc_exit_check(frame: &TrapFrame, result: i64) {
    arch::disable_irqs();
    let s = unsafe { SuperPage::the() };
    if s.reschedule_needed_on_svc_exit.swap(false, Ordering::AcqRel) {
        if let Some(tid) = s.current_thread {
            sched::save_current_registers(frame);
            sched::write_svc_result(tid, result as usize);
            sched::reschedule();
        }
    }
    // The exception return re-enables interrupts via the restored status
    // word.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{kernel_fixture, svc, spawn_test_process};
    use crate::mem::layout;

    #[test]
    fn test_get_uptime_and_get_int() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        superpage::with(|s| s.uptime.store(1234, Ordering::Relaxed));
        assert_eq!(svc(numbers::GET_UPTIME, 0, 0), 1234);
        assert_eq!(
            svc(numbers::GET_INT, values::TOTAL_RAM, 0),
            superpage::with(|s| s.total_ram) as i64
        );
        assert_eq!(svc(numbers::GET_INT, 99, 0), KernErr::Argument.as_isize() as i64);
    }

    #[test]
    fn test_sbrk_returns_old_limit() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        let base = svc(numbers::SBRK, 0, 0);
        assert_eq!(base, layout::USER_HEAP_BASE as i64);
        assert_eq!(svc(numbers::SBRK, layout::PAGE_SIZE, 0), base);
        assert_eq!(svc(numbers::SBRK, 0, 0), base + layout::PAGE_SIZE as i64);
    }

    #[test]
    fn test_wfar_returns_pending_count_immediately() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        unsafe { tid.get() }.completed_requests = 3;
        assert_eq!(svc(numbers::WAIT_FOR_ANY_REQUEST, 0, 0), 3);
        assert_eq!(unsafe { tid.get() }.completed_requests, 0);
    }

    #[test]
    fn test_driver_connect_unknown_is_not_found() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        assert_eq!(
            svc(numbers::DRIVER_CONNECT, u32::from_be_bytes(*b"NOPE") as usize, 0),
            KernErr::NotFound.as_isize() as i64
        );
    }

    #[test]
    fn test_unknown_syscall_is_not_supported() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        assert_eq!(svc(0x7F, 0, 0), KernErr::NotSupported.as_isize() as i64);
    }

    #[test]
    fn test_fast_exec_bit_is_stripped() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        superpage::with(|s| s.uptime.store(77, Ordering::Relaxed));
        assert_eq!(svc(FAST_EXEC | numbers::GET_UPTIME, 0, 0), 77);
    }

    #[test]
    fn test_set_timer_immediate_completion() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        superpage::with(|s| s.uptime.store(500, Ordering::Relaxed));

        // User-side records live in fake user memory the shim writes
        // straight through.
        let req = [0usize; 2];
        let due_time: u64 = 100; // already in the past
        let r = set_timer(
            unsafe { SuperPage::the() },
            tid,
            req.as_ptr() as usize,
            &due_time as *const _ as usize,
        );
        assert_eq!(r, 0);
        assert_eq!(superpage::with(|s| s.timer_completion_time), u64::MAX);
        assert_ne!(req[1], 0); // completed synchronously
        assert_eq!(unsafe { tid.get() }.completed_requests, 1);
    }

    #[test]
    fn test_set_timer_future_records_due_time() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let req = [0usize; 2];
        let due_time: u64 = 10_000;
        let r = set_timer(
            unsafe { SuperPage::the() },
            tid,
            req.as_ptr() as usize,
            &due_time as *const _ as usize,
        );
        assert_eq!(r, 0);
        assert_eq!(superpage::with(|s| s.timer_completion_time), 10_000);
        assert_eq!(req[1], 0); // nothing completed yet
    }

    #[test]
    fn test_set_timer_foreign_rearm_rejected() {
        let _g = kernel_fixture();
        let t1 = spawn_test_process("init");
        let t2 = spawn_test_process("interp");
        let req = [0usize; 2];
        let due: u64 = 10_000;
        assert_eq!(
            set_timer(unsafe { SuperPage::the() }, t1, req.as_ptr() as usize, &due as *const _ as usize),
            0
        );
        let req2 = [0usize; 2];
        assert_eq!(
            set_timer(unsafe { SuperPage::the() }, t2, req2.as_ptr() as usize, &due as *const _ as usize),
            KernErr::AlreadyExists.as_isize() as i64
        );
        // The owner re-arming is fine
        assert_eq!(
            set_timer(unsafe { SuperPage::the() }, t1, req.as_ptr() as usize, &due as *const _ as usize),
            0
        );
    }
}
