//! Per-operation driver context.
//!
//! Every operation slot owns one [`IoContext`]: the native overlapped
//! record, the cleanup tag for any handle the driver created on the
//! operation's behalf, the transferred-byte counter, and op-type scratch
//! (stream buffer descriptor, AcceptEx address block, message header, or
//! event-source waiter link).
//!
//! Contexts live in one contiguous column that is allocated at init and
//! never reallocated, so their addresses are stable while operations are in
//! flight. The struct is `repr(C)` with the overlapped record first and the
//! slot id beside it: the completion dequeuer casts the overlapped pointer
//! back to the context and reads the id — no arithmetic on foreign
//! pointers.

#![cfg_attr(windows, allow(unsafe_code))]

use crate::event_source::EventWaiter;
use crate::op::{RawSocket, INVALID_RAW_SOCKET};
use crate::table::OpId;

#[cfg(windows)]
use windows_sys::Win32::System::IO::OVERLAPPED;

/// Address block length AcceptEx requires per address: a full
/// `SOCKADDR_STORAGE` plus 16 bytes of slack.
pub(crate) const ACCEPT_ADDR_BLOCK: usize = 128 + 16;

#[cfg(windows)]
const _: () = assert!(
    std::mem::size_of::<windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE>() + 16
        == ACCEPT_ADDR_BLOCK
);

/// Handle the driver created for this operation and must release on drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OwnedCleanup {
    /// Nothing to release.
    None,
    /// Overlapped-mode duplicate of a caller handle.
    Handle(crate::op::RawHandle),
    /// Job object watching a child process.
    Job(crate::op::RawHandle),
}

/// Scratch space for the AcceptEx path: the socket allocated for the
/// incoming connection and the kernel-written address block.
pub(crate) struct AcceptScratch {
    /// Socket created for the accepted connection; owned by the drain path
    /// until a successful completion hands it to the caller.
    pub(crate) sock: RawSocket,
    /// Two address blocks written by AcceptEx.
    pub(crate) buf: [u8; 2 * ACCEPT_ADDR_BLOCK],
}

impl AcceptScratch {
    pub(crate) fn new() -> Self {
        Self {
            sock: INVALID_RAW_SOCKET,
            buf: [0; 2 * ACCEPT_ADDR_BLOCK],
        }
    }
}

/// Op-type-specific scratch stored inside the context column.
pub(crate) enum Scratch {
    /// Unused for this operation type.
    None,
    /// Single-element buffer descriptor for stream send/recv.
    #[cfg(windows)]
    Stream(windows_sys::Win32::Networking::WinSock::WSABUF),
    /// Message header for `WSASendMsg`/`WSARecvMsg`.
    #[cfg(windows)]
    Msg(windows_sys::Win32::Networking::WinSock::WSAMSG),
    /// AcceptEx socket and address block.
    Accept(Box<AcceptScratch>),
    /// Event-source waiter link; referenced by the source while registered.
    Waiter(EventWaiter),
}

/// Driver-owned per-operation state.
#[repr(C)]
pub(crate) struct IoContext {
    #[cfg(windows)]
    overlapped: OVERLAPPED,
    #[cfg(not(windows))]
    overlapped: [usize; 4],
    id: OpId,
    owned: OwnedCleanup,
    transferred: usize,
    scratch: Scratch,
}

impl IoContext {
    pub(crate) fn new() -> Self {
        Self {
            // SAFETY: OVERLAPPED is a plain C record; all-zero is its
            // documented initial state.
            #[cfg(windows)]
            overlapped: unsafe { std::mem::zeroed() },
            #[cfg(not(windows))]
            overlapped: [0; 4],
            id: OpId::from_raw(0),
            owned: OwnedCleanup::None,
            transferred: 0,
            scratch: Scratch::None,
        }
    }

    /// Rearms the context for a freshly allocated slot.
    pub(crate) fn reset(&mut self, id: OpId) {
        #[cfg(windows)]
        {
            // SAFETY: see `new`.
            self.overlapped = unsafe { std::mem::zeroed() };
        }
        #[cfg(not(windows))]
        {
            self.overlapped = [0; 4];
        }
        self.id = id;
        self.owned = OwnedCleanup::None;
        self.transferred = 0;
        self.scratch = Scratch::None;
    }

    pub(crate) fn id(&self) -> OpId {
        self.id
    }

    pub(crate) fn owned(&self) -> OwnedCleanup {
        self.owned
    }

    pub(crate) fn set_owned(&mut self, owned: OwnedCleanup) {
        debug_assert!(matches!(self.owned, OwnedCleanup::None));
        self.owned = owned;
    }

    pub(crate) fn transferred(&self) -> usize {
        self.transferred
    }

    pub(crate) fn set_transferred(&mut self, bytes: usize) {
        self.transferred = bytes;
    }

    pub(crate) fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut Scratch {
        &mut self.scratch
    }

    pub(crate) fn set_scratch(&mut self, scratch: Scratch) {
        self.scratch = scratch;
    }

    /// The overlapped record handed to the kernel.
    #[cfg(windows)]
    pub(crate) fn overlapped_ptr(&mut self) -> *mut OVERLAPPED {
        std::ptr::addr_of_mut!(self.overlapped)
    }

    /// Recovers the context from an overlapped pointer dequeued off the
    /// port.
    ///
    /// # Safety
    ///
    /// The pointer must be the overlapped record of a context in this
    /// table's column (it is: only contexts are ever handed to the kernel
    /// under the overlapped key).
    #[cfg(windows)]
    pub(crate) unsafe fn from_overlapped<'a>(ptr: *mut OVERLAPPED) -> &'a Self {
        // repr(C) with the overlapped record first makes this a plain cast.
        unsafe { &*ptr.cast::<Self>() }
    }

    /// Sets the overlapped file offset; `None` means the sentinel that
    /// addresses the current file position.
    #[cfg(windows)]
    pub(crate) fn set_offset(&mut self, offset: Option<u64>) {
        let raw = offset.unwrap_or(u64::MAX);
        self.overlapped.Anonymous.Anonymous.Offset = raw as u32;
        self.overlapped.Anonymous.Anonymous.OffsetHigh = (raw >> 32) as u32;
    }

    /// Releases the owned cleanup handle, if any.
    ///
    /// Cleanup failure means the owner violated the handle contract; that
    /// is a fatal assertion, never a leak.
    pub(crate) fn release_owned(&mut self) {
        match std::mem::replace(&mut self.owned, OwnedCleanup::None) {
            OwnedCleanup::None => {}
            OwnedCleanup::Handle(handle) | OwnedCleanup::Job(handle) => {
                #[cfg(windows)]
                {
                    // SAFETY: the handle was created by the driver and is
                    // closed exactly once, here.
                    let ok = unsafe { windows_sys::Win32::Foundation::CloseHandle(handle) };
                    assert!(ok != 0, "owned cleanup handle failed to close");
                }
                #[cfg(not(windows))]
                {
                    let _ = handle;
                    unreachable!("owned handles are never created off-Windows");
                }
            }
        }
    }

    /// Verifies the context is safe to recycle: no owned handle left and no
    /// waiter link still registered in an event source.
    pub(crate) fn assert_released(&self) {
        assert!(
            matches!(self.owned, OwnedCleanup::None),
            "slot released with an owned handle still attached"
        );
        if let Scratch::Waiter(waiter) = &self.scratch {
            assert!(
                !waiter.is_registered(),
                "slot released with its waiter link still in an event source"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_state() {
        let mut ctx = IoContext::new();
        ctx.set_transferred(99);
        ctx.reset(OpId::from_raw(7));
        assert_eq!(ctx.id(), OpId::from_raw(7));
        assert_eq!(ctx.transferred(), 0);
        assert!(matches!(ctx.owned(), OwnedCleanup::None));
        assert!(matches!(ctx.scratch(), Scratch::None));
    }

    #[test]
    fn release_of_clean_context_is_noop() {
        let mut ctx = IoContext::new();
        ctx.release_owned();
        ctx.assert_released();
    }

    #[cfg(windows)]
    #[test]
    fn overlapped_recovery_roundtrip() {
        let mut ctx = IoContext::new();
        ctx.reset(OpId::from_raw(41));
        let ptr = ctx.overlapped_ptr();
        let recovered = unsafe { IoContext::from_overlapped(ptr) };
        assert_eq!(recovered.id(), OpId::from_raw(41));
    }
}
