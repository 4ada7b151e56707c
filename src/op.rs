//! Operation descriptors submitted to the engine.
//!
//! An [`Operation`] is a tagged union over everything the backend can drive:
//! overlapped file and socket I/O, timers, child-exit watches, event-source
//! waits, and the blocking family executed on the worker pool. Descriptors
//! reference caller memory through raw buffer and out-pointer wrappers; the
//! submission functions are `unsafe` and the contract is that every pointer
//! stays valid until the operation's completion has been drained.
//!
//! # Vectored I/O
//!
//! `ReadVectored`/`WriteVectored` submit only the first element of the
//! vector; callers issue follow-up operations for the remaining elements.
//! An empty vector completes immediately with zero bytes. This mirrors the
//! overlapped kernel interface, which takes a single buffer per request.

use crate::error::OpError;
use crate::event_source::EventSource;
use crate::table::OpId;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// Raw OS handle (file, pipe, process). Layout-compatible with `HANDLE`.
pub type RawHandle = *mut core::ffi::c_void;

/// Raw OS socket. Layout-compatible with `SOCKET`.
pub type RawSocket = usize;

/// Sentinel value for an absent socket.
pub const INVALID_RAW_SOCKET: RawSocket = usize::MAX;

/// Borrowed read-only buffer with the lifetime erased.
#[derive(Debug, Clone, Copy)]
pub struct RawBuf {
    ptr: *const u8,
    len: usize,
}

impl RawBuf {
    /// Captures a slice. The slice must outlive the operation.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    /// Buffer base pointer.
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Buffer length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Borrowed mutable buffer with the lifetime erased.
#[derive(Debug, Clone, Copy)]
pub struct RawBufMut {
    ptr: *mut u8,
    len: usize,
}

impl RawBufMut {
    /// Captures a mutable slice. The slice must outlive the operation.
    #[must_use]
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Buffer base pointer.
    #[must_use]
    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Buffer length in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Borrowed vector of read-only buffers, lifetime erased.
#[derive(Debug, Clone, Copy)]
pub struct RawBufs {
    ptr: *const RawBuf,
    len: usize,
}

impl RawBufs {
    /// Captures a slice of buffers. The slice and every element must outlive
    /// the operation.
    #[must_use]
    pub fn from_slice(bufs: &[RawBuf]) -> Self {
        Self {
            ptr: bufs.as_ptr(),
            len: bufs.len(),
        }
    }

    /// Returns true if the vector has no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First element, if any.
    #[must_use]
    pub fn first(&self) -> Option<RawBuf> {
        if self.len == 0 {
            None
        } else {
            // SAFETY: non-empty per the submission contract.
            Some(unsafe { *self.ptr })
        }
    }
}

/// Borrowed vector of mutable buffers, lifetime erased.
#[derive(Debug, Clone, Copy)]
pub struct RawBufsMut {
    ptr: *const RawBufMut,
    len: usize,
}

impl RawBufsMut {
    /// Captures a slice of buffers. The slice and every element must outlive
    /// the operation.
    #[must_use]
    pub fn from_slice(bufs: &[RawBufMut]) -> Self {
        Self {
            ptr: bufs.as_ptr(),
            len: bufs.len(),
        }
    }

    /// Returns true if the vector has no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First element, if any.
    #[must_use]
    pub fn first(&self) -> Option<RawBufMut> {
        if self.len == 0 {
            None
        } else {
            // SAFETY: non-empty per the submission contract.
            Some(unsafe { *self.ptr })
        }
    }
}

/// Optional out-pointer written when the operation completes successfully.
#[derive(Debug, Clone, Copy)]
pub struct Out<T>(Option<NonNull<T>>);

impl<T> Out<T> {
    /// No output requested.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// Captures a destination. Must outlive the operation.
    #[must_use]
    pub fn new(dest: &mut T) -> Self {
        Self(Some(NonNull::from(dest)))
    }

    /// Returns true if a destination was supplied.
    #[must_use]
    pub const fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Writes `value` through the pointer, if one was supplied.
    ///
    /// # Safety
    ///
    /// The destination must still be valid (submission contract).
    pub(crate) unsafe fn write(&self, value: T) {
        if let Some(ptr) = self.0 {
            unsafe { ptr.as_ptr().write(value) };
        }
    }

    /// Reads the current value, if a destination was supplied.
    ///
    /// # Safety
    ///
    /// The destination must still be valid (submission contract).
    pub(crate) unsafe fn read(&self) -> Option<T>
    where
        T: Copy,
    {
        self.0.map(|ptr| unsafe { ptr.as_ptr().read() })
    }
}

/// Socket-address bytes, sized for the largest address family.
///
/// Layout-compatible with `SOCKADDR_STORAGE`.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct SockAddrStorage {
    /// Raw address bytes; the first two encode the family.
    pub data: [u8; 128],
}

impl Default for SockAddrStorage {
    fn default() -> Self {
        Self { data: [0; 128] }
    }
}

impl std::fmt::Debug for SockAddrStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SockAddrStorage").finish_non_exhaustive()
    }
}

/// Single scatter/gather element for message-style socket I/O.
///
/// Layout-compatible with `WSABUF` (length first, then pointer).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockBuf {
    /// Element length in bytes.
    pub len: u32,
    /// Element base pointer.
    pub ptr: *mut u8,
}

impl SockBuf {
    /// An empty element (used for "no control data").
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            len: 0,
            ptr: std::ptr::null_mut(),
        }
    }

    /// Captures a mutable slice. Must outlive the operation.
    ///
    /// # Panics
    ///
    /// Panics if the slice is longer than `u32::MAX` bytes.
    #[must_use]
    pub fn from_slice(slice: &mut [u8]) -> Self {
        Self {
            len: u32::try_from(slice.len()).expect("buffer longer than u32::MAX"),
            ptr: slice.as_mut_ptr(),
        }
    }
}

/// Message descriptor for [`RecvMsg`] / [`SendMsg`].
///
/// The name, buffer vector, and control block all reference caller memory;
/// on receive the driver writes the updated `namelen` back through the
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct MsgHdr {
    /// Peer address bytes (source on receive, destination on send).
    pub name: *mut u8,
    /// Length of `name` in bytes; updated by the kernel on receive.
    pub namelen: u32,
    /// Scatter/gather vector.
    pub bufs: *mut SockBuf,
    /// Number of elements in `bufs`.
    pub buf_count: u32,
    /// Ancillary data block; `SockBuf::empty()` for none.
    pub control: SockBuf,
    /// Transport flags.
    pub flags: u32,
}

/// How a watched child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited with the given code.
    Exited(u32),
    /// The exit code could not be determined.
    Unknown,
}

/// Which direction(s) of a socket to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    /// Further receives are disallowed.
    Receive,
    /// Further sends are disallowed.
    Send,
    /// Both directions.
    Both,
}

/// Positional read from a file-like handle.
#[derive(Debug, Clone, Copy)]
pub struct Read {
    /// Borrowed handle; the driver re-opens it in overlapped mode.
    pub handle: RawHandle,
    /// Destination buffer.
    pub buf: RawBufMut,
    /// Absolute offset, or `None` for the current file position.
    pub offset: Option<u64>,
    /// Receives the number of bytes read.
    pub out_read: Out<usize>,
}

/// Positional write to a file-like handle.
#[derive(Debug, Clone, Copy)]
pub struct Write {
    /// Borrowed handle; the driver re-opens it in overlapped mode.
    pub handle: RawHandle,
    /// Source buffer.
    pub buf: RawBuf,
    /// Absolute offset, or `None` for the current file position.
    pub offset: Option<u64>,
    /// Receives the number of bytes written.
    pub out_written: Out<usize>,
}

/// Vectored read; only the first element is submitted.
#[derive(Debug, Clone, Copy)]
pub struct ReadVectored {
    /// Borrowed handle; the driver re-opens it in overlapped mode.
    pub handle: RawHandle,
    /// Destination buffers.
    pub bufs: RawBufsMut,
    /// Absolute offset, or `None` for the current file position.
    pub offset: Option<u64>,
    /// Receives the number of bytes read.
    pub out_read: Out<usize>,
}

/// Vectored write; only the first element is submitted.
#[derive(Debug, Clone, Copy)]
pub struct WriteVectored {
    /// Borrowed handle; the driver re-opens it in overlapped mode.
    pub handle: RawHandle,
    /// Source buffers.
    pub bufs: RawBufs,
    /// Absolute offset, or `None` for the current file position.
    pub offset: Option<u64>,
    /// Receives the number of bytes written.
    pub out_written: Out<usize>,
}

/// Accept one connection on a listening socket.
#[derive(Debug, Clone, Copy)]
pub struct Accept {
    /// Listening socket.
    pub socket: RawSocket,
    /// Receives the accepted socket. Written at submission; ownership
    /// transfers to the caller only when the operation succeeds.
    pub out_socket: Out<RawSocket>,
    /// Optionally receives the peer address.
    pub out_addr: Out<SockAddrStorage>,
    /// In: capacity of `out_addr`; out: the kernel-written address length.
    pub inout_addrlen: Out<u32>,
}

/// Stream receive.
#[derive(Debug, Clone, Copy)]
pub struct Recv {
    /// Connected socket.
    pub socket: RawSocket,
    /// Destination buffer.
    pub buf: RawBufMut,
    /// Receives the number of bytes received.
    pub out_read: Out<usize>,
}

/// Stream send.
#[derive(Debug, Clone, Copy)]
pub struct Send {
    /// Connected socket.
    pub socket: RawSocket,
    /// Source buffer.
    pub buf: RawBuf,
    /// Receives the number of bytes sent.
    pub out_written: Out<usize>,
}

/// Message-style receive (scatter + source address + control data).
#[derive(Debug, Clone, Copy)]
pub struct RecvMsg {
    /// Socket to receive on.
    pub socket: RawSocket,
    /// Message descriptor; `namelen` is written back on completion.
    pub msg: *mut MsgHdr,
    /// Receives the number of bytes received.
    pub out_read: Out<usize>,
}

/// Message-style send (gather + destination address + control data).
#[derive(Debug, Clone, Copy)]
pub struct SendMsg {
    /// Socket to send on.
    pub socket: RawSocket,
    /// Message descriptor.
    pub msg: *const MsgHdr,
    /// Receives the number of bytes sent.
    pub out_written: Out<usize>,
}

/// One-shot monotonic timeout.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    /// Delay until the timer fires.
    pub duration: Duration,
}

/// Timeout linked to the immediately preceding operation of the batch.
///
/// Whichever side finishes first cancels the other; the timeout itself
/// completes with success when it fires.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeout {
    /// Delay until the timer fires.
    pub duration: Duration,
}

/// Wait for a child process to exit.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    /// Borrowed process handle.
    pub child: RawHandle,
    /// Receives how the process terminated.
    pub out_term: Out<Termination>,
}

/// Wait until an [`EventSource`] is notified.
#[derive(Debug, Clone)]
pub struct WaitEventSource {
    /// The source to wait on.
    pub source: Arc<EventSource>,
}

/// Notify an [`EventSource`]; never blocks.
#[derive(Debug, Clone)]
pub struct NotifyEventSource {
    /// The source to notify.
    pub source: Arc<EventSource>,
}

/// Close an [`EventSource`]; fatal if waiters are still registered.
#[derive(Debug, Clone)]
pub struct CloseEventSource {
    /// The source to close.
    pub source: Arc<EventSource>,
}

/// Readiness poll. Not supported by this backend.
#[derive(Debug, Clone, Copy)]
pub struct Poll {
    /// Socket to poll.
    pub socket: RawSocket,
    /// Requested readiness mask.
    pub events: u32,
}

/// Flush file buffers to stable storage.
#[derive(Debug, Clone, Copy)]
pub struct Fsync {
    /// Borrowed handle.
    pub handle: RawHandle,
}

/// Create a socket.
#[derive(Debug, Clone, Copy)]
pub struct Socket {
    /// Address family.
    pub domain: i32,
    /// Socket type.
    pub socket_type: i32,
    /// Protocol, or 0 for the family default.
    pub protocol: i32,
    /// Receives the created socket.
    pub out_socket: Out<RawSocket>,
}

/// Connect a socket to a remote address.
#[derive(Debug, Clone, Copy)]
pub struct Connect {
    /// Socket to connect.
    pub socket: RawSocket,
    /// Destination address bytes (copied at submission).
    pub addr: SockAddrStorage,
    /// Valid length of `addr`.
    pub addrlen: u32,
}

/// Shut down one or both directions of a socket.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSocket {
    /// Socket to shut down.
    pub socket: RawSocket,
    /// Direction(s).
    pub how: ShutdownHow,
}

/// Close a file-like handle.
#[derive(Debug, Clone, Copy)]
pub struct CloseFile {
    /// Handle to close; ownership passes to the engine.
    pub handle: RawHandle,
}

/// Close a socket.
#[derive(Debug, Clone, Copy)]
pub struct CloseSocket {
    /// Socket to close; ownership passes to the engine.
    pub socket: RawSocket,
}

/// Tagged union over every operation the backend accepts.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Positional file read.
    Read(Read),
    /// Positional file write.
    Write(Write),
    /// Vectored file read (first element only).
    ReadVectored(ReadVectored),
    /// Vectored file write (first element only).
    WriteVectored(WriteVectored),
    /// Accept a connection.
    Accept(Accept),
    /// Stream receive.
    Recv(Recv),
    /// Stream send.
    Send(Send),
    /// Message-style receive.
    RecvMsg(RecvMsg),
    /// Message-style send.
    SendMsg(SendMsg),
    /// One-shot timeout.
    Timeout(Timeout),
    /// Timeout linked to the preceding batch entry.
    LinkTimeout(LinkTimeout),
    /// Child-process exit watch.
    ChildExit(ChildExit),
    /// Event-source wait.
    WaitEventSource(WaitEventSource),
    /// Event-source notify.
    NotifyEventSource(NotifyEventSource),
    /// Event-source close.
    CloseEventSource(CloseEventSource),
    /// Readiness poll (unsupported).
    Poll(Poll),
    /// File flush.
    Fsync(Fsync),
    /// Socket creation.
    Socket(Socket),
    /// Socket connect.
    Connect(Connect),
    /// Socket shutdown.
    ShutdownSocket(ShutdownSocket),
    /// Handle close.
    CloseFile(CloseFile),
    /// Socket close.
    CloseSocket(CloseSocket),
}

impl Operation {
    /// Returns the tag of this operation.
    #[must_use]
    pub const fn tag(&self) -> OpTag {
        match self {
            Self::Read(_) => OpTag::Read,
            Self::Write(_) => OpTag::Write,
            Self::ReadVectored(_) => OpTag::ReadVectored,
            Self::WriteVectored(_) => OpTag::WriteVectored,
            Self::Accept(_) => OpTag::Accept,
            Self::Recv(_) => OpTag::Recv,
            Self::Send(_) => OpTag::Send,
            Self::RecvMsg(_) => OpTag::RecvMsg,
            Self::SendMsg(_) => OpTag::SendMsg,
            Self::Timeout(_) => OpTag::Timeout,
            Self::LinkTimeout(_) => OpTag::LinkTimeout,
            Self::ChildExit(_) => OpTag::ChildExit,
            Self::WaitEventSource(_) => OpTag::WaitEventSource,
            Self::NotifyEventSource(_) => OpTag::NotifyEventSource,
            Self::CloseEventSource(_) => OpTag::CloseEventSource,
            Self::Poll(_) => OpTag::Poll,
            Self::Fsync(_) => OpTag::Fsync,
            Self::Socket(_) => OpTag::Socket,
            Self::Connect(_) => OpTag::Connect,
            Self::ShutdownSocket(_) => OpTag::ShutdownSocket,
            Self::CloseFile(_) => OpTag::CloseFile,
            Self::CloseSocket(_) => OpTag::CloseSocket,
        }
    }
}

/// Fieldless operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum OpTag {
    Read,
    Write,
    ReadVectored,
    WriteVectored,
    Accept,
    Recv,
    Send,
    RecvMsg,
    SendMsg,
    Timeout,
    LinkTimeout,
    ChildExit,
    WaitEventSource,
    NotifyEventSource,
    CloseEventSource,
    Poll,
    Fsync,
    Socket,
    Connect,
    ShutdownSocket,
    CloseFile,
    CloseSocket,
}

/// One batch entry: an operation plus the caller's correlation word.
#[derive(Debug, Clone)]
pub struct SubmitEntry {
    /// The operation to perform.
    pub op: Operation,
    /// Opaque caller word handed back on completion.
    pub user_data: u64,
}

impl SubmitEntry {
    /// Creates a batch entry.
    #[must_use]
    pub fn new(op: Operation, user_data: u64) -> Self {
        Self { op, user_data }
    }
}

/// Callbacks invoked by the engine for batch lifecycle events.
pub trait Handler {
    /// Called once per entry when the batch is queued, before any I/O starts.
    fn queued(&mut self, id: OpId, user_data: u64) {
        let _ = (id, user_data);
    }

    /// Called exactly once per operation when its completion is drained.
    fn completed(&mut self, id: OpId, user_data: u64, result: Result<(), OpError>);
}

/// Handler that discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn completed(&mut self, _id: OpId, _user_data: u64, _result: Result<(), OpError>) {}
}

/// Returns false if the batch contains any operation this backend cannot
/// drive (currently only [`Operation::Poll`]).
#[must_use]
pub fn is_supported<'a, I>(ops: I) -> bool
where
    I: IntoIterator<Item = &'a Operation>,
{
    ops.into_iter().all(|op| op.tag() != OpTag::Poll)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_is_unsupported() {
        let poll = Operation::Poll(Poll {
            socket: 1,
            events: 0,
        });
        let timeout = Operation::Timeout(Timeout {
            duration: Duration::from_millis(1),
        });

        assert!(!is_supported([&poll]));
        assert!(!is_supported([&timeout, &poll]));
        assert!(is_supported([&timeout]));
        assert!(is_supported(std::iter::empty()));
    }

    #[test]
    fn out_pointer_roundtrip() {
        let mut dest = 0usize;
        let out = Out::new(&mut dest);
        assert!(out.is_some());
        unsafe { out.write(42) };
        assert_eq!(dest, 42);

        let none = Out::<usize>::none();
        assert!(!none.is_some());
        unsafe { none.write(7) };
    }

    #[test]
    fn raw_buf_captures_slice() {
        let mut data = [1u8, 2, 3];
        let buf = RawBufMut::from_slice(&mut data);
        assert_eq!(buf.len(), 3);
        assert!(!buf.is_empty());

        let empty = RawBuf::from_slice(&[]);
        assert!(empty.is_empty());
    }

    #[test]
    fn raw_bufs_first_element() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 8];
        let elems = [RawBufMut::from_slice(&mut a), RawBufMut::from_slice(&mut b)];
        let bufs = RawBufsMut::from_slice(&elems);
        assert_eq!(bufs.first().expect("non-empty").len(), 4);

        let none = RawBufsMut::from_slice(&[]);
        assert!(none.is_empty());
        assert!(none.first().is_none());
    }

    #[test]
    fn tags_match_variants() {
        let op = Operation::Fsync(Fsync {
            handle: std::ptr::null_mut(),
        });
        assert_eq!(op.tag(), OpTag::Fsync);

        let op = Operation::LinkTimeout(LinkTimeout {
            duration: Duration::from_secs(1),
        });
        assert_eq!(op.tag(), OpTag::LinkTimeout);
    }

    #[test]
    fn sock_buf_layout_matches_wsabuf() {
        // WSABUF is {len: u32, buf: *mut u8}; the driver casts SockBuf
        // pointers directly.
        assert_eq!(
            std::mem::size_of::<SockBuf>(),
            std::mem::size_of::<u32>().max(std::mem::size_of::<*mut u8>()) * 2
        );
        assert_eq!(std::mem::offset_of!(SockBuf, len), 0);
        assert_eq!(
            std::mem::offset_of!(SockBuf, ptr),
            std::mem::size_of::<*mut u8>()
        );
    }
}
