//! The kernel's single pinned page of global state.
//!
//! Everything mutable and global lives here, at a fixed page in the
//! kernel window: scheduler heads, the driver and server tables, the DFC
//! ring, the async-request slots and the crash registers. Writers of
//! non-atomic multi-word state run with interrupts disabled (`IrqGuard`);
//! the handful of fields touched from interrupt context are hardware
//! atomics.

use crate::arch::SavedRegs;
use crate::lib::ringbuf::RingBuf;
use crate::mem::layout;
use crate::process::{Thread, ThreadId};
use crate::request::KAsyncRequest;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicU64, Ordering};

pub const MAX_SERVERS: usize = 32;
pub const MAX_DRIVERS: usize = 8;
pub const MAX_DFCS: usize = 16;
pub const MAX_SHARED_PAGES: usize = 256;
/// Data capacity of the UART receive ring.
pub const UART_RING_SIZE: usize = 64;

pub type DfcFn = fn(usize, usize, usize);

/// One deferred function call: a function and three argument words.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Dfc {
    pub func: Option<DfcFn>,
    pub args: [usize; 3],
}

impl Dfc {
    pub const fn empty() -> Self {
        Self {
            func: None,
            args: [0; 3],
        }
    }
}

/// IPC server slot: fourcc id, the armed receive request, and the list of
/// clients blocked waiting to connect.
#[repr(C)]
pub struct Server {
    pub id: u32,
    pub request: KAsyncRequest,
    pub blocked_client_head: Option<ThreadId>,
}

impl Server {
    pub const fn empty() -> Self {
        Self {
            id: 0,
            request: KAsyncRequest::new(),
            blocked_client_head: None,
        }
    }
}

/// Driver handler: (command, argument) -> result word.
pub type DriverFn = fn(usize, usize) -> isize;

/// Driver dispatch slot: fourcc id and handler.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DriverSlot {
    pub id: u32,
    pub exec: Option<DriverFn>,
}

impl DriverSlot {
    pub const fn empty() -> Self {
        Self { id: 0, exec: None }
    }
}

#[repr(C)]
pub struct SuperPage {
    pub total_ram: u32,
    pub board_rev: u32,
    pub next_pid: u32,
    pub boot_mode: u32,
    pub num_valid_process_pages: u32,
    /// Page-allocator geometry and scan hint; the map bytes themselves
    /// live at their fixed kernel offset.
    pub allocator_pages: usize,
    pub allocator_first_free: usize,
    pub current_process: Option<u8>,
    pub current_thread: Option<ThreadId>,
    pub ready_list: Option<ThreadId>,

    /// Milliseconds since boot; incremented by the tick interrupt.
    pub uptime: AtomicU64,

    /// Crashed-debugger mode: the kernel state is poisoned and SVCs run
    /// on the debugger stack with interrupts masked.
    pub marvin: bool,
    pub trap_abort: bool,
    pub exception: bool,

    pub reschedule_needed_on_svc_exit: AtomicBool,

    /// Thread parked in a synchronous Getch, if any. Packed `ThreadId`
    /// word; taken by the UART interrupt with an atomic swap.
    pub blocked_uart_receive: AtomicU32,
    pub uart_request: KAsyncRequest,
    pub uart_dropped_chars: AtomicU8,
    pub uart_ring: RingBuf<UART_RING_SIZE>,

    pub timer_request: KAsyncRequest,
    pub timer_completion_time: u64,

    pub input_request: KAsyncRequest,
    pub input_buffer: usize,
    pub input_buffer_size: usize,
    pub touch_up_pending: bool,

    pub screen_width: u32,
    pub screen_height: u32,
    pub screen_format: u32,

    pub crash_registers: SavedRegs,

    pub num_dfcs_pending: AtomicU32,
    pub dfcs: [Dfc; MAX_DFCS],
    /// The kernel thread the DFC queue drains on (full memory model).
    pub dfc_thread: Thread,

    pub servers: [Server; MAX_SERVERS],
    pub drivers: [DriverSlot; MAX_DRIVERS],

    /// Shared-page mapping words, indexed by shared-page slot. See
    /// `ipc::Mapping` for the encoding.
    pub shared_page_mappings: [u32; MAX_SHARED_PAGES],
}

const _: () = assert!(core::mem::size_of::<SuperPage>() <= layout::PAGE_SIZE);

impl SuperPage {
    /// The pinned instance.
    ///
    /// # Safety
    /// Single core; callers hold the reference only across a critical
    /// section (interrupts disabled or IRQ-safe fields only).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn the() -> &'static mut SuperPage {
        &mut *(layout::kern_addr(layout::SUPER_PAGE_OFF) as *mut SuperPage)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.uptime.load(Ordering::Relaxed)
    }

    /// Reset to boot state.
    pub fn init(&mut self, total_ram: u32, board_rev: u32, boot_mode: u32) {
        *self = SuperPage {
            total_ram,
            board_rev,
            next_pid: 1,
            boot_mode,
            num_valid_process_pages: 0,
            allocator_pages: 0,
            allocator_first_free: 0,
            current_process: None,
            current_thread: None,
            ready_list: None,
            uptime: AtomicU64::new(0),
            marvin: false,
            trap_abort: false,
            exception: false,
            reschedule_needed_on_svc_exit: AtomicBool::new(false),
            blocked_uart_receive: AtomicU32::new(0),
            uart_request: KAsyncRequest::new(),
            uart_dropped_chars: AtomicU8::new(0),
            uart_ring: RingBuf::new(),
            timer_request: KAsyncRequest::new(),
            timer_completion_time: u64::MAX,
            input_request: KAsyncRequest::new(),
            input_buffer: 0,
            input_buffer_size: 0,
            touch_up_pending: false,
            screen_width: 0,
            screen_height: 0,
            screen_format: 0,
            crash_registers: SavedRegs::new(),
            num_dfcs_pending: AtomicU32::new(0),
            dfcs: [Dfc::empty(); MAX_DFCS],
            dfc_thread: Thread::new_dead(0),
            servers: core::array::from_fn(|_| Server::empty()),
            drivers: [DriverSlot::empty(); MAX_DRIVERS],
            shared_page_mappings: [0; MAX_SHARED_PAGES],
        };
    }
}

/// Run `f` against the SuperPage. The narrow accessor used by code that
/// only needs a field or two; longer critical sections take an `IrqGuard`
/// and hold the reference directly.
pub fn with<R>(f: impl FnOnce(&mut SuperPage) -> R) -> R {
    f(unsafe { SuperPage::the() })
}

/// Record a thread blocked in synchronous Getch. At most one at a time.
pub fn set_blocked_getch(tid: ThreadId) {
    with(|s| s.blocked_uart_receive.store(tid.to_word(), Ordering::Release));
}

/// Atomically claim the Getch-blocked thread, if any.
pub fn take_blocked_getch() -> Option<ThreadId> {
    let w = with(|s| s.blocked_uart_receive.swap(0, Ordering::AcqRel));
    ThreadId::from_word(w)
}
