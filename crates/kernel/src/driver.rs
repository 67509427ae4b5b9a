//! Driver registry.
//!
//! Drivers register a fourcc tag and a handler in the SuperPage table.
//! `DriverConnect` turns the tag into an opaque handle; syscalls with the
//! handle bit set route straight to the handler with two argument words.
//! Drivers complete async requests on behalf of callers (input, audio,
//! flash); the kernel itself only owns the input-request plumbing below.

use crate::lib::error::{KernErr, Result};
use crate::superpage::{self, DriverFn, SuperPage, MAX_DRIVERS};
use crate::syscall::{uaccess, DRIVER_HANDLE};

/// Well-known driver command numbers.
pub mod cmds {
    pub const SCREEN_BLIT: usize = 0;
    pub const INPUT_REQUEST: usize = 1;
    pub const FLASH_ERASE: usize = 1;
    pub const FLASH_STATUS: usize = 2;
    pub const FLASH_READ: usize = 3;
    pub const FLASH_WRITE: usize = 4;
    pub const AUDIO_PLAY: usize = 1;
    pub const AUDIO_PLAY_LOOP: usize = 2;
}

/// Input sample types delivered through an input request buffer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    TouchUp = 0,
    TouchDown = 1,
    Buttons = 2,
}

/// The eight-word packet a screen blit hands to the display driver.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BlitParams {
    pub data_ptr: usize,
    pub bitmap_width: usize,
    pub screen_x: usize,
    pub screen_y: usize,
    pub src_x: usize,
    pub src_y: usize,
    pub width: usize,
    pub height: usize,
}

/// Register `func` as the handler for driver `id`. A full table is a
/// misconfigured board, not a runtime condition.
pub fn register_driver(id: u32, func: DriverFn) {
    let s = unsafe { SuperPage::the() };
    let slot = s
        .drivers
        .iter_mut()
        .find(|d| d.id == 0)
        .expect("driver table full");
    slot.id = id;
    slot.exec = Some(func);
}

/// DriverConnect: fourcc to opaque handle.
pub fn connect(id: u32) -> i64 {
    let s = unsafe { SuperPage::the() };
    for (i, d) in s.drivers.iter().enumerate() {
        if d.id == id && d.id != 0 {
            return (DRIVER_HANDLE | i) as i64;
        }
    }
    KernErr::NotFound.as_isize() as i64
}

/// Route a handle-bit syscall to its driver: the syscall number is the
/// handle, arg1 is the driver command, arg2 its argument.
pub fn exec(cmd: usize, arg1: usize, arg2: usize) -> i64 {
    let idx = cmd & 0xFF;
    if idx >= MAX_DRIVERS {
        return KernErr::BadHandle.as_isize() as i64;
    }
    let d = superpage::with(|s| s.drivers[idx]);
    match d.exec {
        Some(f) if d.id != 0 => f(arg1, arg2) as i64,
        _ => KernErr::BadHandle.as_isize() as i64,
    }
}

/// Arm the input request. The user buffer starts with a max-sample count
/// word, followed by that many (type, payload) pairs. Only one request
/// may be armed, and the first thread to arm one owns input from then on.
pub fn set_input_request(request_ptr: usize) -> Result<()> {
    let s = unsafe { SuperPage::the() };
    if s.input_request.is_armed() {
        return Err(KernErr::AlreadyExists);
    }
    let tid = s.current_thread.ok_or(KernErr::NotSupported)?;
    if let Some(owner) = s.input_request.thread {
        // No-one else gets to steal being the input handler
        if owner != tid {
            return Err(KernErr::AlreadyExists);
        }
    }
    uaccess::check_word(request_ptr)?;
    let buf_ptr = uaccess::read_user_word(s.current_process, request_ptr)?;
    uaccess::check_u32(buf_ptr)?;
    let max_samples = uaccess::read_user_word(s.current_process, buf_ptr)? as usize;
    s.input_buffer = buf_ptr + core::mem::size_of::<u32>();
    s.input_buffer_size = max_samples;
    s.input_request.set(tid, request_ptr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{kernel_fixture, spawn_test_process, svc};
    use crate::syscall::numbers;

    fn fourcc(tag: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*tag)
    }

    fn echo_driver(cmd: usize, arg: usize) -> isize {
        (cmd + arg) as isize
    }

    #[test]
    fn test_connect_and_dispatch_round_trip() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        register_driver(fourcc(b"TEST"), echo_driver);

        let handle = svc(numbers::DRIVER_CONNECT, fourcc(b"TEST") as usize, 0);
        assert!(handle > 0);
        assert_eq!(handle as usize & DRIVER_HANDLE, DRIVER_HANDLE);

        // The handle becomes the syscall number; arg1 is the command
        let r = svc(handle as usize, cmds::FLASH_READ, 7);
        assert_eq!(r, (cmds::FLASH_READ + 7) as i64);
    }

    #[test]
    fn test_bad_handle_is_rejected() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        let r = svc(DRIVER_HANDLE | 3, 0, 0);
        assert_eq!(r, KernErr::BadHandle.as_isize() as i64);
    }

    #[test]
    fn test_double_input_arm_is_already_exists() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        crate::superpage::with(|s| {
            s.current_thread = Some(tid);
            s.input_request.set(tid, 0x9000);
        });
        assert_eq!(set_input_request(0x9000), Err(KernErr::AlreadyExists));
    }
}
