//! Completion-port wrapper and the tagged completion key.
//!
//! The port is the single wakeup funnel of the backend: overlapped kernel
//! completions, job-object messages, event-source notifications, and custom
//! wakeups all arrive here. Every dequeued entry carries a machine-word
//! [`Key`] whose low bits select the handler and whose upper bits carry the
//! operation slot id.
//!
//! The key encoding is pure bit math and portable; the port itself is
//! `cfg(windows)`.

use crate::table::OpId;

/// Number of low bits reserved for the key kind.
const KIND_BITS: u32 = 3;

/// Discriminator carried in the low bits of every completion key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeyKind {
    /// Custom wakeup; sets the signaled flag and nothing else.
    Nop = 0,
    /// Teardown sentinel posted once per expected dequeuer thread.
    Shutdown = 1,
    /// Event-source notification addressed to a waiting operation.
    EventSource = 2,
    /// Job-object message for a child-exit watch.
    ChildExit = 3,
    /// Overlapped kernel I/O; the slot is recovered from the overlapped
    /// pointer, not from the key.
    Overlapped = 4,
}

/// Machine-word tagged completion key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    /// Which handler the completion routes to.
    pub kind: KeyKind,
    /// Slot id for kinds that address a specific operation.
    pub id: u32,
}

impl Key {
    /// Builds a key.
    #[must_use]
    pub const fn new(kind: KeyKind, id: u32) -> Self {
        Self { kind, id }
    }

    /// Custom-wakeup key.
    #[must_use]
    pub const fn nop() -> Self {
        Self::new(KeyKind::Nop, 0)
    }

    /// Teardown sentinel key.
    #[must_use]
    pub const fn shutdown() -> Self {
        Self::new(KeyKind::Shutdown, 0)
    }

    /// Event-source key addressed to the given operation.
    #[must_use]
    pub const fn event_source(id: OpId) -> Self {
        Self::new(KeyKind::EventSource, id.raw())
    }

    /// Child-exit key addressed to the given operation.
    #[must_use]
    pub const fn child_exit(id: OpId) -> Self {
        Self::new(KeyKind::ChildExit, id.raw())
    }

    /// Key under which overlapped handles are associated with the port.
    #[must_use]
    pub const fn overlapped() -> Self {
        Self::new(KeyKind::Overlapped, 0)
    }

    /// Encodes the key into one machine word.
    ///
    /// On 32-bit targets the id occupies the remaining bits of the word;
    /// slot ids are small enough that no information is lost.
    #[must_use]
    pub const fn encode(self) -> usize {
        ((self.id as usize) << KIND_BITS) | self.kind as usize
    }

    /// Decodes a machine word back into a key.
    ///
    /// Returns `None` for kind bits this backend never produces.
    #[must_use]
    pub fn decode(word: usize) -> Option<Self> {
        let kind = match word & ((1 << KIND_BITS) - 1) {
            0 => KeyKind::Nop,
            1 => KeyKind::Shutdown,
            2 => KeyKind::EventSource,
            3 => KeyKind::ChildExit,
            4 => KeyKind::Overlapped,
            _ => return None,
        };
        Some(Self {
            kind,
            id: (word >> KIND_BITS) as u32,
        })
    }

    /// The operation id carried by this key.
    #[must_use]
    pub const fn op_id(self) -> OpId {
        OpId::from_raw(self.id)
    }
}

#[cfg(windows)]
pub use sys::{CompletionPort, Dequeued, PortHandle};

#[cfg(not(windows))]
pub use stub::PortHandle;

#[cfg(windows)]
mod sys {
    #![allow(unsafe_code)]

    use super::Key;
    use std::io;
    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_INVALID_PARAMETER, HANDLE, INVALID_HANDLE_VALUE,
        WAIT_TIMEOUT,
    };
    use windows_sys::Win32::Networking::WinSock::SOCKET;
    use windows_sys::Win32::Storage::FileSystem::{
        SetFileCompletionNotificationModes, FILE_SKIP_COMPLETION_PORT_ON_SUCCESS,
        FILE_SKIP_SET_EVENT_ON_HANDLE,
    };
    use windows_sys::Win32::System::IO::{
        CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
    };

    /// One dequeued port entry.
    #[derive(Debug)]
    pub enum Dequeued {
        /// A completion was dequeued.
        Entry {
            /// Raw completion key word.
            key: usize,
            /// Bytes transferred (or the message code for job keys).
            bytes: u32,
            /// The overlapped record, when the completion carries one.
            overlapped: *mut OVERLAPPED,
            /// `None` for success; the raw OS error otherwise.
            error: Option<u32>,
        },
        /// The wait timed out with nothing to dequeue.
        TimedOut,
    }

    /// Owned I/O completion port.
    ///
    /// Teardown posts one [`Key::shutdown`] message per expected dequeuer
    /// thread before closing the handle: some kernels (WINE in particular)
    /// do not wake blocked dequeuers when the port is closed underneath
    /// them.
    #[derive(Debug)]
    pub struct CompletionPort {
        handle: HANDLE,
        threads: u32,
    }

    // SAFETY: the kernel serializes all port operations.
    unsafe impl Send for CompletionPort {}
    unsafe impl Sync for CompletionPort {}

    impl CompletionPort {
        /// Creates a port sized for `threads` concurrent dequeuers.
        pub fn create(threads: u32) -> io::Result<Self> {
            // SAFETY: creating a fresh port; no foreign handle involved.
            let handle = unsafe {
                CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, threads)
            };
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { handle, threads })
        }

        /// Associates a file-like handle with the port.
        ///
        /// Enables skip-port-on-success so synchronously completed overlapped
        /// I/O is reported inline instead of enqueueing a completion.
        /// Re-association of an already-associated handle reports success.
        pub fn associate_handle(&self, handle: HANDLE) -> io::Result<()> {
            // SAFETY: `handle` is valid per the submission contract.
            let mode = unsafe {
                SetFileCompletionNotificationModes(
                    handle,
                    (FILE_SKIP_COMPLETION_PORT_ON_SUCCESS | FILE_SKIP_SET_EVENT_ON_HANDLE) as u8,
                )
            };
            if mode == 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: associating a valid handle with our own port.
            let port = unsafe {
                CreateIoCompletionPort(handle, self.handle, Key::overlapped().encode(), 0)
            };
            if port.is_null() {
                let code = unsafe { GetLastError() };
                if code == ERROR_INVALID_PARAMETER {
                    // Already associated with this port.
                    return Ok(());
                }
                return Err(io::Error::from_raw_os_error(code as i32));
            }
            Ok(())
        }

        /// Associates a socket with the port. See [`Self::associate_handle`].
        pub fn associate_socket(&self, socket: SOCKET) -> io::Result<()> {
            self.associate_handle(socket as HANDLE)
        }

        /// Posts a zero-byte completion carrying `key` and `opaque`.
        pub fn post(&self, key: Key, opaque: usize) -> io::Result<()> {
            // SAFETY: the port handle is valid for the lifetime of self; the
            // opaque pointer is never dereferenced by the kernel.
            let ok = unsafe {
                PostQueuedCompletionStatus(self.handle, 0, key.encode(), opaque as *const OVERLAPPED)
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Dequeues a single completion, waiting up to `timeout_ms`.
        pub fn dequeue(&self, timeout_ms: u32) -> io::Result<Dequeued> {
            let mut bytes = 0u32;
            let mut key = 0usize;
            let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
            // SAFETY: out-pointers are valid locals; the port handle is
            // valid for the lifetime of self.
            let ok = unsafe {
                GetQueuedCompletionStatus(
                    self.handle,
                    &mut bytes,
                    &mut key,
                    &mut overlapped,
                    timeout_ms,
                )
            };
            if ok != 0 {
                return Ok(Dequeued::Entry {
                    key,
                    bytes,
                    overlapped,
                    error: None,
                });
            }
            // SAFETY: trivially safe errno read.
            let code = unsafe { GetLastError() };
            if overlapped.is_null() {
                if code == WAIT_TIMEOUT {
                    return Ok(Dequeued::TimedOut);
                }
                return Err(io::Error::from_raw_os_error(code as i32));
            }
            // A completion for a failed overlapped operation.
            Ok(Dequeued::Entry {
                key,
                bytes,
                overlapped,
                error: Some(code),
            })
        }

        /// Cheap cloneable poster for cross-thread wakeups.
        #[must_use]
        pub fn poster(&self) -> PortHandle {
            PortHandle {
                handle: self.handle,
            }
        }

        /// Number of dequeuer threads this port was sized for.
        #[must_use]
        pub const fn threads(&self) -> u32 {
            self.threads
        }

        /// Raw port handle, for kernel objects that register completions
        /// themselves (job objects).
        pub(crate) const fn raw(&self) -> HANDLE {
            self.handle
        }
    }

    impl Drop for CompletionPort {
        fn drop(&mut self) {
            for _ in 0..self.threads {
                if let Err(err) = self.post(Key::shutdown(), 0) {
                    tracing::warn!(error = %err, "failed to post shutdown key");
                }
            }
            // SAFETY: the handle is owned and closed exactly once.
            unsafe { CloseHandle(self.handle) };
        }
    }

    /// Cloneable handle that can post to the port from any thread.
    ///
    /// Valid only while the owning [`CompletionPort`] is alive; the engine
    /// guarantees workers and event-source waiters are quiesced before the
    /// port closes.
    #[derive(Debug, Clone)]
    pub struct PortHandle {
        handle: HANDLE,
    }

    // SAFETY: the kernel serializes posts; the raw handle is plain data.
    unsafe impl Send for PortHandle {}
    unsafe impl Sync for PortHandle {}

    impl PortHandle {
        /// Posts a zero-byte completion carrying `key` and `opaque`.
        pub fn post(&self, key: Key, opaque: usize) -> io::Result<()> {
            // SAFETY: see `CompletionPort::post`.
            let ok = unsafe {
                PostQueuedCompletionStatus(self.handle, 0, key.encode(), opaque as *const OVERLAPPED)
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Handle that posts into the void; accounting-only tests.
        #[cfg(test)]
        pub(crate) fn dummy() -> Self {
            Self {
                handle: std::ptr::null_mut(),
            }
        }
    }
}

#[cfg(not(windows))]
mod stub {
    use super::Key;
    use std::io;

    /// Port poster stub for non-Windows targets.
    #[derive(Debug, Clone)]
    pub struct PortHandle;

    impl PortHandle {
        /// Always fails: there is no completion port on this target.
        pub fn post(&self, _key: Key, _opaque: usize) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "completion ports are only available on Windows",
            ))
        }

        /// Handle that posts into the void; accounting-only tests.
        #[cfg(test)]
        pub(crate) fn dummy() -> Self {
            Self
        }
    }
}
