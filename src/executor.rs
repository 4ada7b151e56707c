//! Blocking executor for operations the completion port cannot express.
//!
//! Each [`BlockingOp`] is a self-contained copy of the payload the driver
//! dispatched; the executor performs the blocking call, writes the
//! operation's outputs, and the caller reports the result through the
//! thread-safe finish path (worker) or directly (inline / single-threaded
//! configurations).
//!
//! A would-block condition is retried with a yield loop; the first terminal
//! result wins.

#![allow(unsafe_code)]

use crate::error::{op_error_from_os, OpError};
use crate::event_source::EventSource;
use crate::op::{CloseFile, CloseSocket, Connect, Fsync, ShutdownHow, ShutdownSocket, Socket};
use std::sync::Arc;
use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::Networking::WinSock::{
    closesocket, connect, shutdown, WSAGetLastError, WSASocketW, INVALID_SOCKET, SD_BOTH,
    SD_RECEIVE, SD_SEND, SOCKADDR, WSAEISCONN, WSAEWOULDBLOCK, WSA_FLAG_OVERLAPPED,
};
use windows_sys::Win32::Storage::FileSystem::FlushFileBuffers;

/// Operation dispatched to the blocking executor.
pub(crate) enum BlockingOp {
    Fsync(Fsync),
    Socket(Socket),
    Connect(Connect),
    Shutdown(ShutdownSocket),
    CloseFile(CloseFile),
    CloseSocket(CloseSocket),
    NotifyEventSource(Arc<EventSource>),
    CloseEventSource(Arc<EventSource>),
}

// SAFETY: the raw pointers inside payloads reference caller memory that the
// submission contract keeps valid until the completion is drained; the
// executor is the only writer while the operation is in flight.
unsafe impl Send for BlockingOp {}

fn last_socket_error() -> u32 {
    // SAFETY: trivially safe errno read.
    unsafe { WSAGetLastError() as u32 }
}

/// Runs the blocking call to its first terminal result.
pub(crate) fn execute(op: BlockingOp) -> Result<(), OpError> {
    match op {
        BlockingOp::Fsync(fsync) => {
            // SAFETY: the handle is valid per the submission contract.
            let ok = unsafe { FlushFileBuffers(fsync.handle) };
            if ok == 0 {
                return Err(last_file_error());
            }
            Ok(())
        }
        BlockingOp::Socket(socket) => loop {
            // SAFETY: plain socket creation; no caller memory involved.
            let sock = unsafe {
                WSASocketW(
                    socket.domain,
                    socket.socket_type,
                    socket.protocol,
                    std::ptr::null(),
                    0,
                    WSA_FLAG_OVERLAPPED,
                )
            };
            if sock == INVALID_SOCKET {
                let code = last_socket_error();
                if code == WSAEWOULDBLOCK as u32 {
                    std::thread::yield_now();
                    continue;
                }
                return Err(op_error_from_os(code));
            }
            // SAFETY: out-pointer validity per the submission contract.
            unsafe { socket.out_socket.write(sock) };
            return Ok(());
        },
        BlockingOp::Connect(op) => loop {
            // SAFETY: the address bytes were copied into the payload at
            // submission; the socket is valid per the contract.
            let rc = unsafe {
                connect(
                    op.socket,
                    std::ptr::addr_of!(op.addr).cast::<SOCKADDR>(),
                    op.addrlen as i32,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let code = last_socket_error();
            if code == WSAEWOULDBLOCK as u32 {
                std::thread::yield_now();
                continue;
            }
            if code == WSAEISCONN as u32 {
                // The earlier would-block attempt finished the handshake.
                return Ok(());
            }
            return Err(op_error_from_os(code));
        },
        BlockingOp::Shutdown(op) => {
            let how = match op.how {
                ShutdownHow::Receive => SD_RECEIVE,
                ShutdownHow::Send => SD_SEND,
                ShutdownHow::Both => SD_BOTH,
            };
            // SAFETY: the socket is valid per the submission contract.
            let rc = unsafe { shutdown(op.socket, how as i32) };
            if rc != 0 {
                return Err(op_error_from_os(last_socket_error()));
            }
            Ok(())
        }
        BlockingOp::CloseFile(op) => {
            // SAFETY: ownership of the handle passed to the engine.
            let ok = unsafe { CloseHandle(op.handle) };
            if ok == 0 {
                return Err(last_file_error());
            }
            Ok(())
        }
        BlockingOp::CloseSocket(op) => {
            // SAFETY: ownership of the socket passed to the engine.
            let rc = unsafe { closesocket(op.socket) };
            if rc != 0 {
                return Err(op_error_from_os(last_socket_error()));
            }
            Ok(())
        }
        BlockingOp::NotifyEventSource(source) => {
            source.notify();
            Ok(())
        }
        BlockingOp::CloseEventSource(source) => {
            source.close();
            Ok(())
        }
    }
}

fn last_file_error() -> OpError {
    // SAFETY: trivially safe errno read.
    op_error_from_os(unsafe { windows_sys::Win32::Foundation::GetLastError() })
}
