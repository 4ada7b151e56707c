//! The Windows completion-port driver.
//!
//! This is the backend behind the engine's public surface: it starts
//! operations against the kernel, routes every wakeup source through one
//! port dequeue, and funnels all completions into the coordinator.
//!
//! # Architecture
//!
//! ```text
//! queue() ─▶ ┌─────────────┐  start   ┌──────────────────────────────┐
//!            │ Uringlator  │ ───────▶ │ overlapped I/O ─▶ completion │
//!            │ (slots,     │          │ timer queue    ─▶ port       │
//!            │  finish)    │ ◀─────── │ worker pool    ─▶ (one       │
//! complete()◀┤ drain       │  finish  │ event sources  ─▶  dequeue)  │
//!            └─────────────┘          └──────────────────────────────┘
//! ```
//!
//! On non-Windows targets the driver compiles as a stub whose constructor
//! reports `Unsupported`, keeping the portable components testable
//! everywhere.

use std::time::Duration;

/// Wait mode for [`IocpDriver::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    /// Block until at least one completion or error is drained.
    Blocking,
    /// Drain whatever is ready and return immediately.
    NonBlocking,
}

/// Counters returned by one [`IocpDriver::complete`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompleteResult {
    /// Operations drained with success.
    pub completed: usize,
    /// Operations drained with a terminal error.
    pub errors: usize,
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Worker-pool capacity for blocking operations. Zero selects the
    /// single-threaded configuration: blocking operations run inline on the
    /// submitting thread and no pool is created.
    pub max_workers: usize,
    /// Idle budget before a pool worker retires.
    pub worker_idle_timeout: Duration,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// Concurrency hint for the completion port; also the number of
    /// shutdown messages posted at teardown.
    pub port_threads: u32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            worker_idle_timeout: crate::pool::DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "winaio".to_string(),
            port_threads: 1,
        }
    }
}

#[cfg(windows)]
pub use iocp_impl::IocpDriver;

#[cfg(not(windows))]
pub use stub::IocpDriver;

#[cfg(windows)]
mod iocp_impl {
    #![allow(unsafe_code)]

    use super::{CompleteMode, CompleteResult, DriverOptions};
    use crate::context::{AcceptScratch, IoContext, OwnedCleanup, Scratch, ACCEPT_ADDR_BLOCK};
    use crate::error::{op_error_from_os, OpError, QueueError};
    use crate::event_source::EventWaiter;
    use crate::executor::{self, BlockingOp};
    use crate::op::{
        Accept, Handler, MsgHdr, NoopHandler, Operation, RawBuf, RawBufMut, RawHandle, RawSocket,
        SockAddrStorage, SubmitEntry, Termination,
    };
    use crate::pool::WorkerPool;
    use crate::port::{CompletionPort, Dequeued, Key, KeyKind};
    use crate::table::OpId;
    use crate::timer::TimerQueue;
    use crate::uringlator::{Backend, OpResult, Uringlator};
    use std::io;
    use std::ptr::NonNull;
    use std::time::{Duration, Instant};
    use windows_sys::Wdk::Storage::FileSystem::{FileAccessInformation, NtQueryInformationFile};
    use windows_sys::Win32::Foundation::{
        GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE,
        INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Networking::WinSock::{
        getsockname, setsockopt, AcceptEx, GetAcceptExSockaddrs, WSAGetLastError, WSAIoctl,
        WSARecv, WSASend, WSASendMsg, WSASocketW, INVALID_SOCKET, LPFN_WSARECVMSG,
        SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR, SOCKADDR_STORAGE, SOCK_STREAM, SOL_SOCKET,
        SO_UPDATE_ACCEPT_CONTEXT, WSABUF, WSAID_WSARECVMSG, WSAMSG, WSA_FLAG_OVERLAPPED,
        WSA_IO_PENDING,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        ReOpenFile, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, FILE_READ_DATA, FILE_SHARE_DELETE,
        FILE_SHARE_READ, FILE_SHARE_WRITE, FILE_WRITE_DATA,
    };
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectAssociateCompletionPortInformation,
        SetInformationJobObject, JOBOBJECT_ASSOCIATE_COMPLETION_PORT,
        JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS, JOB_OBJECT_MSG_EXIT_PROCESS,
    };
    use windows_sys::Win32::System::Threading::{GetExitCodeProcess, INFINITE};
    use windows_sys::Win32::System::IO::{CancelIoEx, IO_STATUS_BLOCK, OVERLAPPED};

    fn op_error_from_io(err: &io::Error) -> OpError {
        err.raw_os_error()
            .map_or(OpError::Unexpected(0), |code| op_error_from_os(code as u32))
    }

    fn last_error() -> u32 {
        // SAFETY: trivially safe errno read.
        unsafe { GetLastError() }
    }

    fn last_socket_error() -> u32 {
        // SAFETY: trivially safe errno read.
        unsafe { WSAGetLastError() as u32 }
    }

    /// Backend state: everything the driver hooks need besides the
    /// coordinator itself.
    struct DriverState {
        port: CompletionPort,
        timers: TimerQueue,
        pool: Option<WorkerPool>,
        recvmsg: LPFN_WSARECVMSG,
        shutdown_seen: bool,
    }

    /// Completion-port backed submission/completion engine.
    pub struct IocpDriver {
        inner: DriverState,
        ur: Uringlator,
    }

    impl IocpDriver {
        /// Creates a driver with room for `capacity` concurrent operations.
        pub fn new(capacity: usize) -> io::Result<Self> {
            Self::with_options(capacity, DriverOptions::default())
        }

        /// Creates a driver with explicit options.
        pub fn with_options(capacity: usize, options: DriverOptions) -> io::Result<Self> {
            let port = CompletionPort::create(options.port_threads)?;
            let ur = Uringlator::new(capacity);
            ur.inbox().set_wake(port.poster());
            let pool = (options.max_workers > 0).then(|| {
                WorkerPool::new(
                    options.max_workers,
                    options.worker_idle_timeout,
                    &options.thread_name_prefix,
                )
            });
            tracing::debug!(
                capacity,
                max_workers = options.max_workers,
                "driver created"
            );
            Ok(Self {
                inner: DriverState {
                    port,
                    timers: TimerQueue::new(),
                    pool,
                    recvmsg: None,
                    shutdown_seen: false,
                },
                ur,
            })
        }

        /// Maximum number of concurrent operations.
        #[must_use]
        pub fn capacity(&self) -> usize {
            self.ur.table.capacity()
        }

        /// Operations currently queued or in flight.
        #[must_use]
        pub fn in_flight(&self) -> usize {
            self.ur.table.len()
        }

        /// True when nothing is queued, in flight, or awaiting drain.
        #[must_use]
        pub fn is_idle(&self) -> bool {
            self.ur.is_idle()
        }

        /// Hands a batch to the coordinator for slot allocation.
        ///
        /// All-or-nothing: on [`QueueError::Overflow`] nothing was queued.
        ///
        /// # Safety
        ///
        /// Every buffer, out-pointer, and message descriptor referenced by
        /// the batch must stay valid until the corresponding completion has
        /// been drained by [`Self::complete`] (or the driver is dropped).
        pub unsafe fn queue<H: Handler>(
            &mut self,
            entries: &[SubmitEntry],
            handler: &mut H,
        ) -> Result<(), QueueError> {
            self.ur.queue(entries, handler)
        }

        /// Requests cancellation of an in-flight operation.
        ///
        /// True means the operation is already finished with
        /// [`OpError::Canceled`]; false means its natural completion must be
        /// awaited (it may still surface the cancellation error).
        pub fn cancel(&mut self, id: OpId) -> bool {
            if self.ur.cancel_queued(id) {
                return true;
            }
            if self.ur.table.lookup(id).is_none() {
                return false;
            }
            self.inner.cancel(&mut self.ur, id)
        }

        /// Runs the submission/completion loop.
        ///
        /// Submits queued operations, waits for one port wakeup (bounded by
        /// the next timer), fires due timers, and drains finished
        /// operations into `handler`. Blocking mode returns once at least
        /// one completion or error was drained; non-blocking mode returns
        /// after a single pass.
        pub fn complete<H: Handler>(&mut self, mode: CompleteMode, handler: &mut H) -> CompleteResult {
            let mut total = CompleteResult::default();
            loop {
                self.ur.submit(&mut self.inner);
                self.ur.drain_inbox();

                // Nothing in flight means nothing can ever arrive; do not
                // park on the port.
                if self.ur.is_idle() {
                    return total;
                }

                let timeout_ms = if self.ur.signaled() {
                    0
                } else {
                    match mode {
                        CompleteMode::NonBlocking => 0,
                        CompleteMode::Blocking => self.wait_bound(),
                    }
                };

                match self.inner.port.dequeue(timeout_ms) {
                    Ok(Dequeued::TimedOut) => {}
                    Ok(Dequeued::Entry {
                        key,
                        bytes,
                        overlapped,
                        error,
                    }) => self.route(key, bytes, overlapped, error),
                    Err(err) => {
                        tracing::error!(error = %err, "port dequeue failed");
                        self.inner.shutdown_seen = true;
                    }
                }

                let now = Instant::now();
                let timers = &mut self.inner.timers;
                let ur = &mut self.ur;
                timers.expire(now, |word| {
                    let id = OpId::from_word(word);
                    if ur.table.lookup(id).is_some() {
                        ur.finish_now(id, Ok(()));
                    }
                });

                while self.ur.take_signaled() {
                    self.ur.drain_inbox();
                    let (completed, errors) = self.ur.drain(&mut self.inner, handler);
                    total.completed += completed;
                    total.errors += errors;
                }

                if total.completed + total.errors > 0
                    || mode == CompleteMode::NonBlocking
                    || self.inner.shutdown_seen
                {
                    return total;
                }
            }
        }

        /// One-shot convenience: build a driver sized for the batch, queue
        /// it, drain blockingly until idle, tear down.
        ///
        /// Returns the number of operations that completed with an error.
        ///
        /// # Safety
        ///
        /// Same contract as [`Self::queue`]; the pointers must stay valid
        /// for the duration of this call.
        pub unsafe fn immediate(entries: &[SubmitEntry]) -> io::Result<usize> {
            struct CountErrors(usize);
            impl Handler for CountErrors {
                fn completed(&mut self, _id: OpId, _user_data: u64, result: Result<(), OpError>) {
                    if result.is_err() {
                        self.0 += 1;
                    }
                }
            }

            let mut driver = Self::new(entries.len().max(1))?;
            let mut counter = CountErrors(0);
            // SAFETY: forwarded caller contract.
            unsafe { driver.queue(entries, &mut counter) }
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
            while !driver.is_idle() {
                driver.complete(CompleteMode::Blocking, &mut counter);
                if driver.inner.shutdown_seen {
                    break;
                }
            }
            Ok(counter.0)
        }

        /// Port-wait bound: the next timer fire delay, capped to the 32-bit
        /// native wait, or INFINITE without timers.
        fn wait_bound(&mut self) -> u32 {
            let now = Instant::now();
            match self.inner.timers.next_delay(now) {
                None => INFINITE,
                Some(delay) => {
                    let millis = delay.as_millis();
                    // Round up so a sub-millisecond delay does not spin.
                    let millis = if delay > Duration::from_millis(millis as u64) {
                        millis + 1
                    } else {
                        millis
                    };
                    u32::try_from(millis).unwrap_or(INFINITE - 1).min(INFINITE - 1)
                }
            }
        }

        /// Routes one dequeued port entry by key kind.
        fn route(&mut self, key_word: usize, bytes: u32, overlapped: *mut OVERLAPPED, error: Option<u32>) {
            let Some(key) = Key::decode(key_word) else {
                tracing::warn!(key_word, "dropping completion with unknown key kind");
                return;
            };
            match key.kind {
                KeyKind::Nop => self.ur.set_signaled(),
                KeyKind::Shutdown => {
                    tracing::debug!("shutdown sentinel dequeued");
                    self.inner.shutdown_seen = true;
                }
                KeyKind::EventSource => {
                    let id = key.op_id();
                    if self.ur.table.lookup(id).is_some() {
                        self.ur.finish_now(id, Ok(()));
                    }
                }
                KeyKind::ChildExit => {
                    let id = key.op_id();
                    if self.ur.table.lookup(id).is_some() {
                        self.handle_job_message(id, bytes);
                    }
                }
                KeyKind::Overlapped => {
                    if overlapped.is_null() {
                        return;
                    }
                    // SAFETY: only IoContext overlapped records are ever
                    // submitted under the overlapped key.
                    let id = unsafe { IoContext::from_overlapped(overlapped) }.id();
                    if self.ur.table.lookup(id).is_none() {
                        tracing::trace!(%id, "dropping completion for a released slot");
                        return;
                    }
                    let result = match error {
                        None => self.inner.on_port_success(&mut self.ur, id, bytes),
                        Some(code) if code == ERROR_HANDLE_EOF => {
                            self.ur.table.context_mut(id).set_transferred(0);
                            Ok(())
                        }
                        Some(code) => Err(op_error_from_os(code)),
                    };
                    self.ur.finish_now(id, result);
                }
            }
        }

        /// Handles a job-object message; only the exit messages finish the
        /// slot, every other message code is ignored.
        fn handle_job_message(&mut self, id: OpId, code: u32) {
            if code != JOB_OBJECT_MSG_EXIT_PROCESS && code != JOB_OBJECT_MSG_ABNORMAL_EXIT_PROCESS {
                return;
            }
            let Some(Operation::ChildExit(child)) = self.ur.table.op(id).cloned() else {
                return;
            };
            let mut exit_code = 0u32;
            // SAFETY: the child handle is valid per the submission contract.
            let term = if unsafe { GetExitCodeProcess(child.child, &mut exit_code) } != 0 {
                Termination::Exited(exit_code)
            } else {
                Termination::Unknown
            };
            // SAFETY: out-pointer validity per the submission contract.
            unsafe { child.out_term.write(term) };
            self.ur.finish_now(id, Ok(()));
        }
    }

    impl Drop for IocpDriver {
        fn drop(&mut self) {
            tracing::debug!(in_flight = self.in_flight(), "driver teardown");
            self.ur.shutdown(&mut self.inner);
            while !self.ur.is_idle() && !self.inner.shutdown_seen {
                let _ = self.complete(CompleteMode::Blocking, &mut NoopHandler);
            }
            if let Some(pool) = self.inner.pool.take() {
                pool.shutdown();
            }
            // The port itself posts its shutdown sentinels and closes when
            // DriverState drops.
        }
    }

    impl Backend for DriverState {
        fn start(&mut self, ur: &mut Uringlator, id: OpId) {
            let op = ur.table.op(id).expect("started op is live").clone();
            let outcome = match &op {
                Operation::Read(read) => {
                    self.start_read(ur, id, read.handle, read.buf, read.offset)
                }
                Operation::Write(write) => {
                    self.start_write(ur, id, write.handle, write.buf, write.offset)
                }
                Operation::ReadVectored(readv) => match readv.bufs.first() {
                    None => {
                        ur.table.context_mut(id).set_transferred(0);
                        Some(Ok(()))
                    }
                    Some(buf) => self.start_read(ur, id, readv.handle, buf, readv.offset),
                },
                Operation::WriteVectored(writev) => match writev.bufs.first() {
                    None => {
                        ur.table.context_mut(id).set_transferred(0);
                        Some(Ok(()))
                    }
                    Some(buf) => self.start_write(ur, id, writev.handle, buf, writev.offset),
                },
                Operation::Accept(accept) => self.start_accept(ur, id, accept),
                Operation::Recv(recv) => {
                    self.start_stream(ur, id, recv.socket, recv.buf.as_mut_ptr(), recv.buf.len(), true)
                }
                Operation::Send(send) => self.start_stream(
                    ur,
                    id,
                    send.socket,
                    send.buf.as_ptr().cast_mut(),
                    send.buf.len(),
                    false,
                ),
                Operation::RecvMsg(recv) => self.start_msg(ur, id, recv.socket, recv.msg, true),
                Operation::SendMsg(send) => {
                    self.start_msg(ur, id, send.socket, send.msg.cast_mut(), false)
                }
                Operation::Timeout(timeout) => {
                    self.timers.arm(id.to_word(), timeout.duration, Instant::now());
                    None
                }
                Operation::LinkTimeout(timeout) => {
                    self.timers.arm(id.to_word(), timeout.duration, Instant::now());
                    None
                }
                Operation::ChildExit(child) => self.start_child_exit(ur, id, child.child),
                Operation::WaitEventSource(wait) => {
                    if wait.source.try_wait() {
                        Some(Ok(()))
                    } else {
                        let ctx = ur.table.context_mut(id);
                        ctx.set_scratch(Scratch::Waiter(EventWaiter::new(
                            self.port.poster(),
                            Key::event_source(id),
                        )));
                        let Scratch::Waiter(link) = ctx.scratch_mut() else {
                            unreachable!("scratch was just set");
                        };
                        let link = NonNull::from(link);
                        // SAFETY: the link lives in the slot's scratch and
                        // is removed before the slot is released.
                        unsafe { wait.source.add_waiter(link) };
                        None
                    }
                }
                Operation::NotifyEventSource(notify) => Some(executor::execute(
                    BlockingOp::NotifyEventSource(notify.source.clone()),
                )),
                Operation::CloseEventSource(close) => Some(executor::execute(
                    BlockingOp::CloseEventSource(close.source.clone()),
                )),
                Operation::Poll(_) => Some(Err(OpError::NotSupported)),
                Operation::Fsync(fsync) => {
                    self.dispatch_blocking(ur, id, BlockingOp::Fsync(*fsync))
                }
                Operation::Socket(socket) => {
                    self.dispatch_blocking(ur, id, BlockingOp::Socket(*socket))
                }
                Operation::Connect(connect) => {
                    self.dispatch_blocking(ur, id, BlockingOp::Connect(*connect))
                }
                Operation::ShutdownSocket(shutdown) => {
                    self.dispatch_blocking(ur, id, BlockingOp::Shutdown(*shutdown))
                }
                Operation::CloseFile(close) => {
                    self.dispatch_blocking(ur, id, BlockingOp::CloseFile(*close))
                }
                Operation::CloseSocket(close) => {
                    self.dispatch_blocking(ur, id, BlockingOp::CloseSocket(*close))
                }
            };
            if let Some(result) = outcome {
                ur.finish_now(id, result);
            }
        }

        fn cancel(&mut self, ur: &mut Uringlator, id: OpId) -> bool {
            let Some(op) = ur.table.op(id).cloned() else {
                return false;
            };
            match &op {
                Operation::Read(_)
                | Operation::Write(_)
                | Operation::ReadVectored(_)
                | Operation::WriteVectored(_) => {
                    let ctx = ur.table.context_mut(id);
                    let OwnedCleanup::Handle(dup) = ctx.owned() else {
                        return false;
                    };
                    let ovl = ctx.overlapped_ptr();
                    // SAFETY: the duplicate and overlapped record belong to
                    // this slot and are valid while the op is in flight.
                    if unsafe { CancelIoEx(dup, ovl) } != 0 {
                        ur.finish_now(id, Err(OpError::Canceled));
                        true
                    } else {
                        false
                    }
                }
                Operation::Accept(Accept { socket, .. })
                | Operation::Recv(crate::op::Recv { socket, .. })
                | Operation::Send(crate::op::Send { socket, .. })
                | Operation::RecvMsg(crate::op::RecvMsg { socket, .. })
                | Operation::SendMsg(crate::op::SendMsg { socket, .. }) => {
                    let ovl = ur.table.context_mut(id).overlapped_ptr();
                    // SAFETY: as above, against the socket handle.
                    if unsafe { CancelIoEx(*socket as HANDLE, ovl) } != 0 {
                        ur.finish_now(id, Err(OpError::Canceled));
                        true
                    } else {
                        false
                    }
                }
                Operation::ChildExit(_) => {
                    // Closing the job terminates the port association.
                    ur.table.context_mut(id).release_owned();
                    ur.finish_now(id, Err(OpError::Canceled));
                    true
                }
                Operation::Timeout(_) | Operation::LinkTimeout(_) => {
                    if self.timers.disarm(id.to_word()) {
                        ur.finish_now(id, Err(OpError::Canceled));
                        true
                    } else {
                        false
                    }
                }
                Operation::WaitEventSource(wait) => {
                    let ctx = ur.table.context_mut(id);
                    let Scratch::Waiter(link) = ctx.scratch_mut() else {
                        return false;
                    };
                    let link = NonNull::from(link);
                    if wait.source.remove_waiter(link).is_ok() {
                        ur.finish_now(id, Err(OpError::Canceled));
                        true
                    } else {
                        // Lost the race against a concurrent notify; the
                        // port message is already on its way.
                        false
                    }
                }
                _ => false,
            }
        }

        fn complete(&mut self, ur: &mut Uringlator, id: OpId, result: OpResult) {
            let (op, ctx) = ur.table.op_and_context_mut(id);
            match (op, result) {
                (Operation::Accept(accept), Ok(())) => {
                    Self::finalize_accept(accept, ctx);
                }
                (Operation::Accept(_), Err(_)) => {
                    if let Scratch::Accept(scratch) = ctx.scratch_mut() {
                        if scratch.sock != INVALID_SOCKET {
                            // SAFETY: the socket was allocated by the driver
                            // and never handed to the caller.
                            unsafe {
                                windows_sys::Win32::Networking::WinSock::closesocket(scratch.sock)
                            };
                            scratch.sock = INVALID_SOCKET;
                        }
                    }
                }
                (Operation::Read(read), Ok(())) => {
                    // SAFETY: out-pointer validity per the submission contract.
                    unsafe { read.out_read.write(ctx.transferred()) };
                }
                (Operation::ReadVectored(readv), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { readv.out_read.write(ctx.transferred()) };
                }
                (Operation::Recv(recv), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { recv.out_read.write(ctx.transferred()) };
                }
                (Operation::RecvMsg(recv), Ok(())) => {
                    // SAFETY: as above; the descriptor is caller memory the
                    // contract keeps valid.
                    unsafe {
                        recv.out_read.write(ctx.transferred());
                        if let Scratch::Msg(msg) = ctx.scratch() {
                            (*recv.msg).namelen = msg.namelen as u32;
                        }
                    }
                }
                (Operation::Write(write), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { write.out_written.write(ctx.transferred()) };
                }
                (Operation::WriteVectored(writev), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { writev.out_written.write(ctx.transferred()) };
                }
                (Operation::Send(send), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { send.out_written.write(ctx.transferred()) };
                }
                (Operation::SendMsg(send), Ok(())) => {
                    // SAFETY: as above.
                    unsafe { send.out_written.write(ctx.transferred()) };
                }
                _ => {}
            }
            ctx.release_owned();
        }
    }

    impl DriverState {
        /// Access check + overlapped re-open + port association shared by
        /// the file I/O starts. The duplicate becomes owned cleanup.
        fn prepare_file(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            handle: RawHandle,
            write: bool,
        ) -> Result<HANDLE, OpError> {
            let access = query_access(handle)?;
            if write {
                if access & FILE_WRITE_DATA == 0 {
                    return Err(OpError::NotOpenForWriting);
                }
            } else if access & FILE_READ_DATA == 0 {
                return Err(OpError::NotOpenForReading);
            }

            let desired = if write { GENERIC_WRITE } else { GENERIC_READ };
            // SAFETY: re-opening a caller handle; produces an owned duplicate.
            let dup = unsafe {
                ReOpenFile(
                    handle,
                    desired,
                    FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                    FILE_FLAG_OVERLAPPED,
                )
            };
            if dup == INVALID_HANDLE_VALUE {
                return Err(op_error_from_os(last_error()));
            }
            if let Err(err) = self.port.associate_handle(dup) {
                // SAFETY: the duplicate is ours and not yet owned by the
                // context.
                unsafe { windows_sys::Win32::Foundation::CloseHandle(dup) };
                return Err(op_error_from_io(&err));
            }
            ur.table.context_mut(id).set_owned(OwnedCleanup::Handle(dup));
            Ok(dup)
        }

        fn start_read(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            handle: RawHandle,
            buf: RawBufMut,
            offset: Option<u64>,
        ) -> Option<OpResult> {
            let dup = match self.prepare_file(ur, id, handle, false) {
                Ok(dup) => dup,
                Err(err) => return Some(Err(err)),
            };
            let ctx = ur.table.context_mut(id);
            ctx.set_offset(offset);
            let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
            let mut read = 0u32;
            let ovl = ctx.overlapped_ptr();
            // SAFETY: buffer validity per the submission contract; the
            // overlapped record is pinned in the context column.
            let ok = unsafe { ReadFile(dup, buf.as_mut_ptr().cast(), len, &mut read, ovl) };
            if ok != 0 {
                ctx.set_transferred(read as usize);
                return Some(Ok(()));
            }
            match last_error() {
                ERROR_IO_PENDING => None,
                ERROR_HANDLE_EOF => {
                    ctx.set_transferred(0);
                    Some(Ok(()))
                }
                code => Some(Err(op_error_from_os(code))),
            }
        }

        fn start_write(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            handle: RawHandle,
            buf: RawBuf,
            offset: Option<u64>,
        ) -> Option<OpResult> {
            let dup = match self.prepare_file(ur, id, handle, true) {
                Ok(dup) => dup,
                Err(err) => return Some(Err(err)),
            };
            let ctx = ur.table.context_mut(id);
            ctx.set_offset(offset);
            let len = u32::try_from(buf.len()).unwrap_or(u32::MAX);
            let mut written = 0u32;
            let ovl = ctx.overlapped_ptr();
            // SAFETY: see `start_read`.
            let ok = unsafe { WriteFile(dup, buf.as_ptr().cast(), len, &mut written, ovl) };
            if ok != 0 {
                ctx.set_transferred(written as usize);
                return Some(Ok(()));
            }
            match last_error() {
                ERROR_IO_PENDING => None,
                code => Some(Err(op_error_from_os(code))),
            }
        }

        fn start_accept(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            accept: &Accept,
        ) -> Option<OpResult> {
            if let Err(err) = self.port.associate_socket(accept.socket) {
                return Some(Err(op_error_from_io(&err)));
            }

            // A socket of the listener's family receives the connection.
            // SAFETY: plain zeroed C record.
            let mut local: SOCKADDR_STORAGE = unsafe { std::mem::zeroed() };
            let mut local_len = std::mem::size_of::<SOCKADDR_STORAGE>() as i32;
            // SAFETY: the listening socket is valid per the contract.
            let rc = unsafe {
                getsockname(
                    accept.socket,
                    std::ptr::addr_of_mut!(local).cast::<SOCKADDR>(),
                    &mut local_len,
                )
            };
            if rc != 0 {
                return Some(Err(op_error_from_os(last_socket_error())));
            }
            // SAFETY: plain socket creation.
            let sock = unsafe {
                WSASocketW(
                    local.ss_family as i32,
                    SOCK_STREAM as i32,
                    0,
                    std::ptr::null(),
                    0,
                    WSA_FLAG_OVERLAPPED,
                )
            };
            if sock == INVALID_SOCKET {
                return Some(Err(op_error_from_os(last_socket_error())));
            }
            // SAFETY: out-pointer validity per the submission contract.
            unsafe { accept.out_socket.write(sock) };

            let ctx = ur.table.context_mut(id);
            let mut scratch = Box::new(AcceptScratch::new());
            scratch.sock = sock;
            ctx.set_scratch(Scratch::Accept(scratch));
            let Scratch::Accept(scratch) = ctx.scratch_mut() else {
                unreachable!("scratch was just set");
            };
            let buf = scratch.buf.as_mut_ptr();
            let mut received = 0u32;
            let ovl = ctx.overlapped_ptr();
            // SAFETY: the scratch block is pinned for the life of the op.
            let ok = unsafe {
                AcceptEx(
                    accept.socket,
                    sock,
                    buf.cast(),
                    0,
                    ACCEPT_ADDR_BLOCK as u32,
                    ACCEPT_ADDR_BLOCK as u32,
                    &mut received,
                    ovl,
                )
            };
            if ok != 0 {
                return Some(Ok(()));
            }
            let code = last_socket_error();
            if code == WSA_IO_PENDING as u32 {
                None
            } else {
                Some(Err(op_error_from_os(code)))
            }
        }

        fn start_stream(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            socket: RawSocket,
            buf: *mut u8,
            len: usize,
            recv: bool,
        ) -> Option<OpResult> {
            if let Err(err) = self.port.associate_socket(socket) {
                return Some(Err(op_error_from_io(&err)));
            }
            let ctx = ur.table.context_mut(id);
            ctx.set_scratch(Scratch::Stream(WSABUF {
                len: u32::try_from(len).unwrap_or(u32::MAX),
                buf,
            }));
            let Scratch::Stream(wsabuf) = ctx.scratch_mut() else {
                unreachable!("scratch was just set");
            };
            let wsabuf: *mut WSABUF = wsabuf;
            let ovl = ctx.overlapped_ptr();
            let mut transferred = 0u32;
            let mut flags = 0u32;
            // SAFETY: buffer and descriptor are pinned per the contract.
            let rc = unsafe {
                if recv {
                    WSARecv(socket, wsabuf, 1, &mut transferred, &mut flags, ovl, None)
                } else {
                    WSASend(socket, wsabuf, 1, &mut transferred, 0, ovl, None)
                }
            };
            if rc == 0 {
                ctx.set_transferred(transferred as usize);
                return Some(Ok(()));
            }
            let code = last_socket_error();
            if code == WSA_IO_PENDING as u32 {
                None
            } else {
                Some(Err(op_error_from_os(code)))
            }
        }

        fn start_msg(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            socket: RawSocket,
            msg: *mut MsgHdr,
            recv: bool,
        ) -> Option<OpResult> {
            if let Err(err) = self.port.associate_socket(socket) {
                return Some(Err(op_error_from_io(&err)));
            }
            let recvmsg = if recv {
                match self.recvmsg_fn(socket) {
                    Ok(f) => Some(f),
                    Err(err) => return Some(Err(err)),
                }
            } else {
                None
            };

            // SAFETY: descriptor validity per the submission contract.
            let hdr = unsafe { *msg };
            let ctx = ur.table.context_mut(id);
            ctx.set_scratch(Scratch::Msg(WSAMSG {
                name: hdr.name.cast::<SOCKADDR>(),
                namelen: hdr.namelen as i32,
                lpBuffers: hdr.bufs.cast::<WSABUF>(),
                dwBufferCount: hdr.buf_count,
                Control: WSABUF {
                    len: hdr.control.len,
                    buf: hdr.control.ptr,
                },
                dwFlags: hdr.flags,
            }));
            let Scratch::Msg(wsamsg) = ctx.scratch_mut() else {
                unreachable!("scratch was just set");
            };
            let wsamsg: *mut WSAMSG = wsamsg;
            let ovl = ctx.overlapped_ptr();
            let mut transferred = 0u32;
            // SAFETY: the message header is pinned in scratch; its pointers
            // are caller memory under the submission contract.
            let rc = unsafe {
                if let Some(recvmsg) = recvmsg {
                    recvmsg(socket, wsamsg, &mut transferred, ovl, None)
                } else {
                    WSASendMsg(socket, wsamsg, 0, &mut transferred, ovl, None)
                }
            };
            if rc == 0 {
                ctx.set_transferred(transferred as usize);
                return Some(Ok(()));
            }
            let code = last_socket_error();
            if code == WSA_IO_PENDING as u32 {
                None
            } else {
                Some(Err(op_error_from_os(code)))
            }
        }

        fn start_child_exit(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            child: RawHandle,
        ) -> Option<OpResult> {
            // SAFETY: plain job creation.
            let job = unsafe { CreateJobObjectW(std::ptr::null(), std::ptr::null()) };
            if job.is_null() {
                return Some(Err(op_error_from_os(last_error())));
            }
            // The job is owned from here on; any failure below is cleaned up
            // by completion finalization closing it.
            ur.table.context_mut(id).set_owned(OwnedCleanup::Job(job));

            // SAFETY: both handles are valid; the job is ours.
            if unsafe { AssignProcessToJobObject(job, child) } == 0 {
                return Some(Err(op_error_from_os(last_error())));
            }
            let assoc = JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
                CompletionKey: Key::child_exit(id).encode() as *mut core::ffi::c_void,
                CompletionPort: self.port.raw(),
            };
            // SAFETY: the association struct is read before the call returns.
            let ok = unsafe {
                SetInformationJobObject(
                    job,
                    JobObjectAssociateCompletionPortInformation,
                    std::ptr::addr_of!(assoc).cast(),
                    std::mem::size_of::<JOBOBJECT_ASSOCIATE_COMPLETION_PORT>() as u32,
                )
            };
            if ok == 0 {
                return Some(Err(op_error_from_os(last_error())));
            }
            None
        }

        fn dispatch_blocking(
            &mut self,
            ur: &mut Uringlator,
            id: OpId,
            op: BlockingOp,
        ) -> Option<OpResult> {
            match &self.pool {
                Some(pool) => {
                    let inbox = ur.inbox();
                    match pool.spawn(move || {
                        let result = executor::execute(op);
                        inbox.finish(id, result);
                    }) {
                        Ok(()) => None,
                        Err(err) => {
                            tracing::warn!(%id, error = %err, "blocking dispatch failed");
                            Some(Err(OpError::SystemResources))
                        }
                    }
                }
                // Single-threaded configuration: run inline on the caller.
                None => Some(executor::execute(op)),
            }
        }

        /// Resolves the `WSARecvMsg` extension through the ioctl mechanism
        /// on first use.
        fn recvmsg_fn(
            &mut self,
            socket: RawSocket,
        ) -> Result<
            unsafe extern "system" fn(
                usize,
                *mut WSAMSG,
                *mut u32,
                *mut OVERLAPPED,
                windows_sys::Win32::Networking::WinSock::LPWSAOVERLAPPED_COMPLETION_ROUTINE,
            ) -> i32,
            OpError,
        > {
            if let Some(f) = self.recvmsg {
                return Ok(f);
            }
            let guid = WSAID_WSARECVMSG;
            let mut func: LPFN_WSARECVMSG = None;
            let mut bytes = 0u32;
            // SAFETY: in/out buffers are valid locals of the documented
            // sizes.
            let rc = unsafe {
                WSAIoctl(
                    socket,
                    SIO_GET_EXTENSION_FUNCTION_POINTER,
                    std::ptr::addr_of!(guid).cast(),
                    std::mem::size_of_val(&guid) as u32,
                    std::ptr::addr_of_mut!(func).cast(),
                    std::mem::size_of::<LPFN_WSARECVMSG>() as u32,
                    &mut bytes,
                    std::ptr::null_mut(),
                    None,
                )
            };
            if rc != 0 {
                return Err(OpError::NotSupported);
            }
            match func {
                Some(f) => {
                    self.recvmsg = Some(f);
                    Ok(f)
                }
                None => Err(OpError::NotSupported),
            }
        }

        /// Per-op success handling for overlapped completions dequeued off
        /// the port.
        fn on_port_success(&mut self, ur: &mut Uringlator, id: OpId, bytes: u32) -> OpResult {
            let (op, ctx) = ur.table.op_and_context_mut(id);
            ctx.set_transferred(bytes as usize);
            if let Operation::Accept(accept) = op {
                let Scratch::Accept(scratch) = ctx.scratch() else {
                    return Ok(());
                };
                let listener = accept.socket;
                // SAFETY: both sockets are alive; the option value is read
                // before the call returns.
                let rc = unsafe {
                    setsockopt(
                        scratch.sock,
                        SOL_SOCKET,
                        SO_UPDATE_ACCEPT_CONTEXT,
                        std::ptr::addr_of!(listener).cast(),
                        std::mem::size_of::<RawSocket>() as i32,
                    )
                };
                if rc != 0 {
                    return Err(op_error_from_os(last_socket_error()));
                }
            }
            Ok(())
        }

        /// Peer-address extraction for a successful accept.
        fn finalize_accept(accept: &Accept, ctx: &mut IoContext) {
            if !accept.out_addr.is_some() && !accept.inout_addrlen.is_some() {
                return;
            }
            let Scratch::Accept(scratch) = ctx.scratch() else {
                return;
            };
            let mut local: *mut SOCKADDR = std::ptr::null_mut();
            let mut local_len = 0i32;
            let mut remote: *mut SOCKADDR = std::ptr::null_mut();
            let mut remote_len = 0i32;
            // SAFETY: the scratch block was filled by AcceptEx with the
            // same length arguments.
            unsafe {
                GetAcceptExSockaddrs(
                    scratch.buf.as_ptr().cast(),
                    0,
                    ACCEPT_ADDR_BLOCK as u32,
                    ACCEPT_ADDR_BLOCK as u32,
                    &mut local,
                    &mut local_len,
                    &mut remote,
                    &mut remote_len,
                );
            }
            if remote.is_null() || remote_len <= 0 {
                return;
            }
            let len = remote_len as usize;
            let mut storage = SockAddrStorage::default();
            let copy = len.min(storage.data.len());
            // SAFETY: the kernel wrote `remote_len` bytes at `remote`.
            unsafe {
                std::ptr::copy_nonoverlapping(remote.cast::<u8>(), storage.data.as_mut_ptr(), copy);
                accept.out_addr.write(storage);
                accept.inout_addrlen.write(remote_len as u32);
            }
        }
    }

    /// File-access bits of the original caller handle.
    fn query_access(handle: RawHandle) -> Result<u32, OpError> {
        #[repr(C)]
        struct FileAccessInformationBuf {
            access_flags: u32,
        }
        let mut iosb: IO_STATUS_BLOCK = unsafe { std::mem::zeroed() };
        let mut info = FileAccessInformationBuf { access_flags: 0 };
        // SAFETY: out-buffers are valid locals of the documented sizes.
        let status = unsafe {
            NtQueryInformationFile(
                handle,
                &mut iosb,
                std::ptr::addr_of_mut!(info).cast(),
                std::mem::size_of::<FileAccessInformationBuf>() as u32,
                FileAccessInformation,
            )
        };
        if status < 0 {
            return Err(OpError::Unexpected(status as u32));
        }
        Ok(info.access_flags)
    }
}

#[cfg(not(windows))]
mod stub {
    use super::DriverOptions;
    use std::io;

    /// Completion-port engine (Windows only).
    ///
    /// This stub keeps builds and docs consistent on other targets; every
    /// constructor reports `Unsupported`.
    #[derive(Debug)]
    pub struct IocpDriver {
        _private: (),
    }

    impl IocpDriver {
        /// Creates a driver with room for `capacity` concurrent operations.
        ///
        /// # Errors
        ///
        /// Always returns `Unsupported` on non-Windows targets.
        pub fn new(_capacity: usize) -> io::Result<Self> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the completion-port driver is only available on Windows",
            ))
        }

        /// Creates a driver with explicit options.
        ///
        /// # Errors
        ///
        /// Always returns `Unsupported` on non-Windows targets.
        pub fn with_options(_capacity: usize, _options: DriverOptions) -> io::Result<Self> {
            Self::new(0)
        }

        /// One-shot batch execution.
        ///
        /// # Errors
        ///
        /// Always returns `Unsupported` on non-Windows targets.
        ///
        /// # Safety
        ///
        /// Trivially safe here; the Windows implementation requires batch
        /// pointers to outlive their completions.
        pub unsafe fn immediate(_entries: &[crate::op::SubmitEntry]) -> io::Result<usize> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the completion-port driver is only available on Windows",
            ))
        }
    }
}
