//! Shared-page IPC.
//!
//! A client allocates a shared page (mapped at the same user address in
//! every participating process), connects it to a server named by a
//! fourcc, and from then on messages travel by flag writes inside the
//! page — the kernel routes wakeups and never copies payload bytes.
//!
//! Kernel state is small: the server table in the SuperPage, and one
//! mapping word per shared-page slot recording the owner process, the
//! connected server and the client thread to signal for replies.

use crate::lib::error::{KernErr, Result};
use crate::mem::{self, layout};
use crate::process::{BlockedReason, ThreadId, ThreadState};
use crate::superpage::{SuperPage, MAX_SERVERS, MAX_SHARED_PAGES};
use crate::syscall::uaccess;
use crate::{request, sched};
use core::convert::Infallible;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MappingFlags: u32 {
        const PAGE_OWNED = 0x40;
        const SERVER_SET = 0x80;
    }
}

/// Per-slot mapping word: flags in the low byte, then the owner process
/// index, the server index, and the client thread index to signal for
/// replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping(pub u32);

impl Mapping {
    pub const FREE: Mapping = Mapping(0);

    fn flags(self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.0 & 0xFF)
    }

    pub fn is_free(self) -> bool {
        self.0 == 0
    }

    pub fn owner(self) -> Option<u8> {
        if self.flags().contains(MappingFlags::PAGE_OWNED) {
            Some((self.0 >> 8) as u8)
        } else {
            None
        }
    }

    pub fn server(self) -> Option<u8> {
        if self.flags().contains(MappingFlags::SERVER_SET) {
            Some((self.0 >> 16) as u8)
        } else {
            None
        }
    }

    pub fn client_thread(self) -> Option<ThreadId> {
        let owner = self.owner()?;
        self.server()?;
        Some(ThreadId::new(owner, (self.0 >> 24) as u8))
    }

    pub fn owned(owner: u8) -> Mapping {
        Mapping(MappingFlags::PAGE_OWNED.bits() | (owner as u32) << 8)
    }

    pub fn connect(self, server_idx: u8, client_thread: u8) -> Mapping {
        Mapping(
            self.0 & 0xFF00
                | MappingFlags::PAGE_OWNED.bits()
                | MappingFlags::SERVER_SET.bits()
                | (server_idx as u32) << 16
                | (client_thread as u32) << 24,
        )
    }

    pub fn disconnect(self) -> Mapping {
        Mapping(self.0 & !(MappingFlags::SERVER_SET.bits() | 0xFFFF_0000))
    }
}

fn mapping(idx: usize) -> Mapping {
    Mapping(unsafe { SuperPage::the() }.shared_page_mappings[idx])
}

fn set_mapping(idx: usize, m: Mapping) {
    unsafe { SuperPage::the() }.shared_page_mappings[idx] = m.0;
}

/// Allocate a shared page and map it into the current process. Returns
/// the user address, or 0 when the window or RAM is exhausted.
pub fn new_shared_page() -> usize {
    let s = unsafe { SuperPage::the() };
    let Some(owner) = s.current_process else { return 0 };
    let Some(idx) = (0..MAX_SHARED_PAGES).find(|&i| mapping(i).is_free()) else {
        return 0;
    };

    // All participants see the page at the same address, so the slot
    // index is the only identity the kernel ever needs; it does not even
    // track the physical address after this.
    let user_addr = mem::shared_page_user_addr(idx);
    let Ok(phys) = mem::map_shared_page(owner, user_addr) else {
        return 0;
    };
    set_mapping(idx, Mapping::owned(owner));
    mem::finished_updating_page_tables();
    unsafe {
        core::ptr::write_bytes(mem::phys_to_virt(phys) as *mut u8, 0, layout::PAGE_SIZE);
    }
    user_addr
}

/// Register the calling thread as the server for `id`.
pub fn create_server(id: u32, tid: ThreadId) -> Result<usize> {
    if id == 0 {
        return Err(KernErr::Argument);
    }
    let s = unsafe { SuperPage::the() };
    if s.servers.iter().any(|srv| srv.id == id) {
        return Err(KernErr::AlreadyExists);
    }
    let Some(idx) = s.servers.iter().position(|srv| srv.id == 0) else {
        return Err(KernErr::ResourceLimit);
    };
    let srv = &mut s.servers[idx];
    srv.id = id;
    srv.request.thread = Some(tid);
    srv.blocked_client_head = None;
    Ok(idx)
}

fn find_server(id: u32) -> Option<usize> {
    let s = unsafe { SuperPage::the() };
    s.servers.iter().position(|srv| srv.id == id && srv.id != 0)
}

/// Page-slot index for a validated shared-page user address.
fn checked_page_index(addr: usize) -> Result<usize> {
    mem::shared_page_index_of(addr).ok_or(KernErr::Argument)
}

/// Hand the page to the server: share the mapping, record the
/// connection, and complete the server's outstanding receive request
/// with the page address.
fn deliver_connect(server_idx: usize, client: ThreadId, page_addr: usize) -> Result<()> {
    let s = unsafe { SuperPage::the() };
    let server_tid = s.servers[server_idx]
        .request
        .thread
        .ok_or(KernErr::NotFound)?;
    let page_idx = checked_page_index(page_addr)?;

    if let (Some(owner), Some(server_proc)) = (mapping(page_idx).owner(), server_tid.process()) {
        if owner != server_proc {
            mem::share_page(owner, server_proc, page_addr)?;
            mem::finished_updating_page_tables();
        }
    }
    set_mapping(
        page_idx,
        mapping(page_idx).connect(server_idx as u8, client.thread_idx),
    );
    s.servers[server_idx].request.complete(page_addr as isize);
    Ok(())
}

/// Client connect. Blocks (does not return) once the connection is made
/// or queued; only a validation failure comes back as an error.
pub fn connect_to_server(id: u32, page_addr: usize, tid: ThreadId) -> Result<Infallible> {
    let page_idx = checked_page_index(page_addr)?;
    if page_addr & (layout::PAGE_SIZE - 1) != 0 {
        return Err(KernErr::Argument);
    }
    if mapping(page_idx).owner() != Some(tid.proc_idx) {
        return Err(KernErr::Argument);
    }
    if mapping(page_idx).server().is_some() {
        return Err(KernErr::AlreadyExists);
    }
    let server_idx = find_server(id).ok_or(KernErr::NotFound)?;

    let s = unsafe { SuperPage::the() };
    if s.servers[server_idx].request.is_armed() {
        deliver_connect(server_idx, tid, page_addr)?;
        sched::write_svc_result(tid, server_idx);
        sched::reschedule()
    }

    // Server not listening yet: park on its blocked-client list. The
    // page address rides in the saved argument register until delivery.
    sched::set_state(tid, ThreadState::BlockedFromSvc);
    sched::set_blocked_reason(tid, BlockedReason::WaitingForServerConnect);
    let s = unsafe { SuperPage::the() };
    sched::enqueue_before(tid, s.servers[server_idx].blocked_client_head);
    if s.servers[server_idx].blocked_client_head.is_none() {
        s.servers[server_idx].blocked_client_head = Some(tid);
    }
    sched::reschedule()
}

/// Server arms its receive request. If a client is already parked
/// waiting to connect, the connection is delivered immediately.
pub fn request_server_msg(tid: ThreadId, req_ptr: usize) -> Result<()> {
    uaccess::check_word(req_ptr)?;
    let s = unsafe { SuperPage::the() };
    let server_idx = s
        .servers
        .iter()
        .position(|srv| srv.id != 0 && srv.request.thread == Some(tid))
        .ok_or(KernErr::NotFound)?;

    s.servers[server_idx].request.set(tid, req_ptr);

    if let Some(client) = s.servers[server_idx].blocked_client_head {
        sched::set_blocked_reason(client, BlockedReason::InServerConnect);
        let page_addr = unsafe { client.get() }.saved.gpr[2];
        sched::dequeue(client, &mut s.servers[server_idx].blocked_client_head);
        // Whatever happens, the client comes back to life with a result
        let result = match deliver_connect(server_idx, client, page_addr) {
            Ok(()) => server_idx,
            Err(e) => e.as_isize() as usize,
        };
        sched::write_svc_result(client, result);
        sched::set_state(client, ThreadState::Ready);
    }
    Ok(())
}

/// Wake the other side of a message. `to_server` is the send path (the
/// client has filled the message in); otherwise it is the reply path.
/// Payload and flags live in the shared page, so there is nothing to
/// copy — only a thread to signal.
pub fn complete_request(req_ptr: usize, to_server: bool) -> Result<isize> {
    let page_idx = checked_page_index(req_ptr)?;
    let m = mapping(page_idx);
    if to_server {
        let server_idx = m.server().ok_or(KernErr::BadHandle)?;
        let s = unsafe { SuperPage::the() };
        let server_tid = s.servers[server_idx as usize]
            .request
            .thread
            .ok_or(KernErr::BadHandle)?;
        // The armed receive slot is consumed by this delivery; the
        // per-message state the server will look at is already in the
        // page.
        let _ = s.servers[server_idx as usize].request.take();
        request::signal(server_tid);
    } else {
        let client = m.client_thread().ok_or(KernErr::BadHandle)?;
        request::signal(client);
    }
    Ok(0)
}

fn cancel_blocked_clients(server_idx: usize) {
    let s = unsafe { SuperPage::the() };
    while let Some(client) = s.servers[server_idx].blocked_client_head {
        sched::dequeue(client, &mut s.servers[server_idx].blocked_client_head);
        sched::write_svc_result(client, KernErr::NotFound.as_isize() as usize);
        sched::set_state(client, ThreadState::Ready);
    }
}

/// Process-exit teardown: cancel clients parked on this process's
/// servers, release its server slots, drop peer mappings of pages it
/// owns, and release the pages themselves.
pub fn process_exited(p_idx: u8) {
    let s = unsafe { SuperPage::the() };

    for idx in 0..MAX_SERVERS {
        let owns = s.servers[idx]
            .request
            .thread
            .map(|t| t.proc_idx == p_idx)
            .unwrap_or(false);
        if s.servers[idx].id != 0 && owns {
            cancel_blocked_clients(idx);
            s.servers[idx].id = 0;
            s.servers[idx].request = crate::request::KAsyncRequest::new();
            // Pages connected to this server lose their server half
            for page in 0..MAX_SHARED_PAGES {
                let m = mapping(page);
                if m.server() == Some(idx as u8) {
                    if let Some(owner) = m.owner() {
                        if owner != p_idx {
                            set_mapping(page, m.disconnect());
                        }
                    }
                }
            }
        }
    }

    for page in 0..MAX_SHARED_PAGES {
        let m = mapping(page);
        if m.owner() != Some(p_idx) {
            continue;
        }
        let addr = mem::shared_page_user_addr(page);
        // Un-share from the connected server first so the single free
        // happens on the owner side.
        if let Some(server_idx) = m.server() {
            let server_proc = s.servers[server_idx as usize]
                .request
                .thread
                .and_then(|t| t.process());
            if let Some(server_proc) = server_proc {
                if server_proc != p_idx {
                    mem::unshare_page(server_proc, addr);
                }
            }
        }
        mem::free_shared_page(p_idx, addr);
        set_mapping(page, Mapping::FREE);
    }
    mem::finished_updating_page_tables();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superpage;
    use crate::test_support::{kernel_fixture, spawn_test_process};

    fn fourcc(tag: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*tag)
    }

    #[test]
    fn test_mapping_word_round_trip() {
        let m = Mapping::owned(7);
        assert_eq!(m.owner(), Some(7));
        assert_eq!(m.server(), None);
        let c = m.connect(3, 1);
        assert_eq!(c.owner(), Some(7));
        assert_eq!(c.server(), Some(3));
        assert_eq!(c.client_thread(), Some(ThreadId::new(7, 1)));
        let d = c.disconnect();
        assert_eq!(d.owner(), Some(7));
        assert_eq!(d.server(), None);
        assert!(Mapping::FREE.is_free());
    }

    #[test]
    fn test_new_shared_page_uses_fixed_window() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        superpage::with(|s| s.current_process = Some(tid.proc_idx));

        let a = new_shared_page();
        let b = new_shared_page();
        assert_eq!(a, mem::shared_page_user_addr(0));
        assert_eq!(b, mem::shared_page_user_addr(1));
        assert_eq!(mapping(0).owner(), Some(tid.proc_idx));
        // Page arrives zeroed
        let phys = mem::user_to_phys(tid.proc_idx, a).unwrap();
        let bytes =
            unsafe { core::slice::from_raw_parts(mem::phys_to_virt(phys) as *const u8, 64) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_create_server_rejects_duplicates() {
        let _g = kernel_fixture();
        let tid = spawn_test_process("init");
        let idx = create_server(fourcc(b"TEST"), tid).unwrap();
        assert_eq!(create_server(fourcc(b"TEST"), tid), Err(KernErr::AlreadyExists));
        assert_eq!(unsafe { SuperPage::the() }.servers[idx].id, fourcc(b"TEST"));
    }

    #[test]
    fn test_request_server_msg_delivers_to_parked_client() {
        let _g = kernel_fixture();
        let server = spawn_test_process("init");
        let client = spawn_test_process("interp");
        superpage::with(|s| s.current_process = Some(client.proc_idx));
        let page = new_shared_page();

        let server_idx = create_server(fourcc(b"TEST"), server).unwrap();

        // Park the client by hand, the way connect_to_server would
        sched::set_state(client, ThreadState::BlockedFromSvc);
        sched::set_blocked_reason(client, BlockedReason::WaitingForServerConnect);
        unsafe { client.get() }.saved.gpr[2] = page;
        superpage::with(|s| {
            sched::enqueue_before(client, s.servers[server_idx].blocked_client_head);
            s.servers[server_idx].blocked_client_head = Some(client);
        });

        // Server arms its receive request: connection delivered at once
        let server_rec = [0usize; 2];
        request_server_msg(server, server_rec.as_ptr() as usize).unwrap();

        assert_eq!(unsafe { client.get() }.state, ThreadState::Ready);
        assert_eq!(unsafe { client.get() }.saved.gpr[0], server_idx);
        assert_eq!(superpage::with(|s| s.servers[server_idx].blocked_client_head), None);
        // Server request completed with the page address
        assert_eq!(server_rec[0], page);
        assert_eq!(unsafe { server.get() }.completed_requests, 1);
        // Mapping records the connection
        let m = mapping(mem::shared_page_index_of(page).unwrap());
        assert_eq!(m.server(), Some(server_idx as u8));
        assert_eq!(m.client_thread(), Some(client));
        // Both processes see the same physical page
        assert_eq!(
            mem::user_to_phys(client.proc_idx, page),
            mem::user_to_phys(server.proc_idx, page)
        );
    }

    #[test]
    fn test_send_and_reply_signal_the_right_threads() {
        let _g = kernel_fixture();
        let server = spawn_test_process("init");
        let client = spawn_test_process("interp");
        superpage::with(|s| s.current_process = Some(client.proc_idx));
        let page = new_shared_page();
        let server_idx = create_server(fourcc(b"TEST"), server).unwrap();
        set_mapping(
            mem::shared_page_index_of(page).unwrap(),
            mapping(mem::shared_page_index_of(page).unwrap()).connect(server_idx as u8, client.thread_idx),
        );

        // Send: client completes the message's request toward the server
        let server_rec = [0usize; 2];
        superpage::with(|s| s.servers[server_idx].request.set(server, server_rec.as_ptr() as usize));
        complete_request(page + 8, true).unwrap();
        assert_eq!(unsafe { server.get() }.completed_requests, 1);
        // The armed slot was consumed by the delivery
        assert!(superpage::with(|s| !s.servers[server_idx].request.is_armed()));

        // Reply: server completes the response toward the client
        complete_request(page + 16, false).unwrap();
        assert_eq!(unsafe { client.get() }.completed_requests, 1);
    }

    #[test]
    fn test_complete_request_rejects_foreign_addresses() {
        let _g = kernel_fixture();
        spawn_test_process("init");
        assert_eq!(
            complete_request(layout::USER_HEAP_BASE, true),
            Err(KernErr::Argument)
        );
        // In-window but unconnected page
        assert_eq!(
            complete_request(mem::shared_page_user_addr(9), true),
            Err(KernErr::BadHandle)
        );
    }

    #[test]
    fn test_server_exit_cancels_blocked_clients() {
        let _g = kernel_fixture();
        let server = spawn_test_process("init");
        let client = spawn_test_process("interp");
        let server_idx = create_server(fourcc(b"TEST"), server).unwrap();

        sched::set_state(client, ThreadState::BlockedFromSvc);
        sched::set_blocked_reason(client, BlockedReason::WaitingForServerConnect);
        superpage::with(|s| {
            sched::enqueue_before(client, s.servers[server_idx].blocked_client_head);
            s.servers[server_idx].blocked_client_head = Some(client);
        });

        process_exited(server.proc_idx);

        assert_eq!(unsafe { client.get() }.state, ThreadState::Ready);
        assert_eq!(
            unsafe { client.get() }.saved.gpr[0] as isize,
            KernErr::NotFound.as_isize()
        );
        assert_eq!(superpage::with(|s| s.servers[server_idx].id), 0);
    }

    #[test]
    fn test_owner_exit_releases_pages() {
        let _g = kernel_fixture();
        let owner = spawn_test_process("init");
        superpage::with(|s| s.current_process = Some(owner.proc_idx));
        let page = new_shared_page();
        assert_ne!(page, 0);
        let before = mem::with_allocator(|pa| pa.pages_in_use());

        process_exited(owner.proc_idx);
        assert!(mapping(mem::shared_page_index_of(page).unwrap()).is_free());
        assert!(mem::with_allocator(|pa| pa.pages_in_use()) < before);
        assert_eq!(mem::user_to_phys(owner.proc_idx, page), None);
    }
}
