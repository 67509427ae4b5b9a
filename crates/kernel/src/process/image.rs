//! Registry of runnable process images.
//!
//! The scripting runtime and the other user-side workloads are opaque
//! blobs linked into the user side of the build; all of them enter
//! through a common user-mode entry point (the user runtime's crt), which
//! reads the process name back out of its BSS and dispatches. The kernel
//! only needs to know which names exist and where the two entry points
//! are.

use spin::Mutex;

pub const MAX_IMAGES: usize = 8;

static IMAGES: Mutex<heapless::Vec<&'static str, MAX_IMAGES>> = Mutex::new(heapless::Vec::new());

use core::sync::atomic::{AtomicUsize, Ordering};

static PROCESS_ENTRY: AtomicUsize = AtomicUsize::new(0);
static THREAD_ENTRY: AtomicUsize = AtomicUsize::new(0);

/// Record the user-mode entry points of the linked-in runtime. Called
/// once at boot by the board glue.
pub fn set_entry_points(process_entry: usize, thread_entry: usize) {
    PROCESS_ENTRY.store(process_entry, Ordering::Relaxed);
    THREAD_ENTRY.store(thread_entry, Ordering::Relaxed);
}

/// Entry point for a process's first thread.
pub fn process_entry_point() -> usize {
    PROCESS_ENTRY.load(Ordering::Relaxed)
}

/// Entry point for secondary threads; the context word rides in the
/// first argument register.
pub fn thread_entry_point() -> usize {
    THREAD_ENTRY.load(Ordering::Relaxed)
}

/// Register a runnable image name. Boot-time only.
pub fn register(name: &'static str) {
    IMAGES.lock().push(name).expect("image table full");
}

pub fn find(name: &str) -> Option<usize> {
    IMAGES.lock().iter().position(|&n| n == name)
}

#[cfg(test)]
pub fn reset_for_tests() {
    IMAGES.lock().clear();
}
