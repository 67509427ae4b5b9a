//! User-pointer validation and user-memory access.
//!
//! Every user pointer is alignment- and window-checked before the kernel
//! dereferences anything. Reads go through the translation walk so they
//! work identically on hardware and on the hosted shim; writes use the
//! privileged-as-user store on hardware so page permissions still apply.
//!
//! The hosted shim has no translation for addresses outside the user
//! window; those are treated as plain host pointers, which is what the
//! unit tests hand in.

use crate::lib::error::{KernErr, Result};
use crate::mem::{self, layout};

/// Longest string the kernel will pull out of user memory.
pub const MAX_USER_STR: usize = 1024;

/// True when `addr` lies in the mapped user address range.
pub fn in_user_window(addr: usize) -> bool {
    addr >= layout::USER_BSS && addr < layout::USER_MEM_LIMIT
}

/// Alignment- and window-check a user pointer. The embedded model's
/// shared-page window sits above the translated range and is equally
/// legitimate. The hosted shim lets addresses above the window through:
/// those are host test pointers.
pub fn check(addr: usize, align: usize) -> Result<usize> {
    if addr == 0 || addr & (align - 1) != 0 {
        return Err(KernErr::Argument);
    }
    if addr < layout::USER_BSS {
        return Err(KernErr::Argument);
    }
    #[cfg(target_arch = "aarch64")]
    if addr >= layout::USER_MEM_LIMIT && mem::shared_page_index_of(addr).is_none() {
        return Err(KernErr::Argument);
    }
    Ok(addr)
}

pub fn check_word(addr: usize) -> Result<usize> {
    check(addr, core::mem::size_of::<usize>())
}

pub fn check_u32(addr: usize) -> Result<usize> {
    check(addr, 4)
}

/// Kernel-window pointer for a user address, when one exists.
fn translate(proc: Option<u8>, addr: usize) -> Option<usize> {
    let translated = (addr >= layout::USER_BSS && addr < layout::USER_MEM_LIMIT)
        || mem::shared_page_index_of(addr).is_some();
    if translated {
        let p = proc?;
        Some(mem::phys_to_virt(mem::user_to_phys(p, addr)?))
    } else if cfg!(target_arch = "aarch64") {
        None
    } else {
        // Hosted shim: out-of-window addresses are host test pointers
        Some(addr)
    }
}

/// Store a word into the user record at `addr` with user privilege.
pub fn write_user_word(proc: Option<u8>, addr: usize, value: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        let _ = proc;
        unsafe { crate::arch::user_write(addr, value) };
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        if let Some(dst) = translate(proc, addr) {
            unsafe { crate::arch::user_write(dst, value) };
        }
    }
}

pub fn write_user_u32(proc: Option<u8>, addr: usize, value: u32) {
    #[cfg(target_arch = "aarch64")]
    {
        let _ = proc;
        unsafe { crate::arch::user_write_u32(addr, value) };
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        if let Some(dst) = translate(proc, addr) {
            unsafe { crate::arch::user_write_u32(dst, value) };
        }
    }
}

pub fn read_user_u64(proc: Option<u8>, addr: usize) -> Result<u64> {
    check(addr, 8)?;
    #[cfg(target_arch = "aarch64")]
    {
        let _ = proc;
        Ok(unsafe { crate::arch::user_read_u64(addr) })
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let src = translate(proc, addr).ok_or(KernErr::Argument)?;
        Ok(unsafe { crate::arch::user_read_u64(src) })
    }
}

pub fn read_user_word(proc: Option<u8>, addr: usize) -> Result<usize> {
    Ok(read_user_u64(proc, addr)? as usize)
}

fn read_user_byte(proc: Option<u8>, addr: usize) -> Result<u8> {
    let src = translate(proc, addr).ok_or(KernErr::Argument)?;
    Ok(unsafe { core::ptr::read_volatile(src as *const u8) })
}

/// Copy a NUL-terminated user string into the caller's buffer and return
/// it as `&str`. Fails on unmapped memory, overlong strings and non-UTF8.
pub fn str_from_user<'a>(
    proc: Option<u8>,
    addr: usize,
    buf: &'a mut [u8],
) -> Result<&'a str> {
    check(addr, 1)?;
    let cap = buf.len().min(MAX_USER_STR);
    for i in 0..cap {
        let b = read_user_byte(proc, addr + i)?;
        if b == 0 {
            return core::str::from_utf8(&buf[..i]).map_err(|_| KernErr::Argument);
        }
        buf[i] = b;
    }
    Err(KernErr::Argument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_rejects_null_and_misaligned() {
        assert_eq!(check(0, 4), Err(KernErr::Argument));
        assert_eq!(check_word(layout::USER_HEAP_BASE + 2), Err(KernErr::Argument));
        assert!(check_word(layout::USER_HEAP_BASE).is_ok());
        assert!(check(layout::USER_HEAP_BASE + 1, 1).is_ok());
    }

    #[test]
    fn test_check_rejects_below_window() {
        assert_eq!(check(0x1000, 4), Err(KernErr::Argument));
        assert!(check(layout::USER_MEM_LIMIT - 4, 4).is_ok());
        assert!(check(layout::SHARED_PAGES_BASE, 4).is_ok());
    }

    #[test]
    fn test_user_window_bounds() {
        assert!(!in_user_window(layout::USER_BSS - 4));
        assert!(in_user_window(layout::USER_BSS));
        assert!(in_user_window(layout::USER_MEM_LIMIT - 1));
        assert!(!in_user_window(layout::USER_MEM_LIMIT));
    }
}
