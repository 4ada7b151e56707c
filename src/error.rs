//! Error types and error-handling strategy for the engine.
//!
//! Every operation completes exactly once with either success or a single
//! terminal [`OpError`]. The taxonomy is intentionally closed: anything the
//! backend cannot translate collapses into the [`OpError::Unexpected`]
//! sentinel carrying the raw OS error code.
//!
//! Submission-time failures (bad orientation, unsupported tag) are reported
//! through the same completion path as kernel failures; they never become
//! in-flight operations.

use core::fmt;

/// Terminal error of a single I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpError {
    /// The handle was not opened with read access.
    NotOpenForReading,
    /// The handle was not opened with write access.
    NotOpenForWriting,
    /// The peer reset the connection.
    ConnectionReset,
    /// The network is unreachable.
    NetworkUnreachable,
    /// The datagram was larger than the transport allows.
    MessageTooBig,
    /// The socket was already shut down in that direction.
    SocketShutdown,
    /// The socket is not connected.
    NotConnected,
    /// Access to the resource was denied.
    AccessDenied,
    /// The requested address is not available on this host.
    AddressNotAvailable,
    /// The handle does not refer to a socket.
    NotSocket,
    /// The address family is not supported by the socket.
    AddressFamilyUnsupported,
    /// The system ran out of buffers, memory, or similar resources.
    SystemResources,
    /// The operation was cancelled before it completed.
    Canceled,
    /// The operation is not supported by this backend.
    NotSupported,
    /// An OS error the backend does not translate; carries the raw code.
    Unexpected(u32),
}

impl OpError {
    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns the raw OS error code for untranslated errors.
    #[must_use]
    pub const fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::Unexpected(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpenForReading => write!(f, "handle is not open for reading"),
            Self::NotOpenForWriting => write!(f, "handle is not open for writing"),
            Self::ConnectionReset => write!(f, "connection reset by peer"),
            Self::NetworkUnreachable => write!(f, "network is unreachable"),
            Self::MessageTooBig => write!(f, "message too big"),
            Self::SocketShutdown => write!(f, "socket has been shut down"),
            Self::NotConnected => write!(f, "socket is not connected"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::AddressNotAvailable => write!(f, "address not available"),
            Self::NotSocket => write!(f, "handle is not a socket"),
            Self::AddressFamilyUnsupported => write!(f, "address family not supported"),
            Self::SystemResources => write!(f, "insufficient system resources"),
            Self::Canceled => write!(f, "operation canceled"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Unexpected(code) => write!(f, "unexpected OS error {code}"),
        }
    }
}

impl std::error::Error for OpError {}

/// Error returned when a batch cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The operation table has no room for the whole batch.
    #[error("operation table is full")]
    Overflow,
}

/// Translates a raw Windows error code into the operation taxonomy.
///
/// Codes without a dedicated variant collapse into [`OpError::Unexpected`].
#[cfg(windows)]
pub(crate) fn op_error_from_os(code: u32) -> OpError {
    use windows_sys::Win32::Foundation::{
        ERROR_ACCESS_DENIED, ERROR_NOT_ENOUGH_MEMORY, ERROR_NOT_SUPPORTED,
        ERROR_NO_SYSTEM_RESOURCES, ERROR_OPERATION_ABORTED,
    };
    use windows_sys::Win32::Networking::WinSock::{
        WSAEACCES, WSAEADDRNOTAVAIL, WSAEAFNOSUPPORT, WSAECONNRESET, WSAEMSGSIZE, WSAENETUNREACH,
        WSAENOBUFS, WSAENOTCONN, WSAENOTSOCK, WSAEOPNOTSUPP, WSAESHUTDOWN,
    };

    match code {
        c if c == ERROR_OPERATION_ABORTED => OpError::Canceled,
        c if c == ERROR_ACCESS_DENIED || c == WSAEACCES as u32 => OpError::AccessDenied,
        c if c == ERROR_NOT_SUPPORTED || c == WSAEOPNOTSUPP as u32 => OpError::NotSupported,
        c if c == ERROR_NOT_ENOUGH_MEMORY || c == ERROR_NO_SYSTEM_RESOURCES => {
            OpError::SystemResources
        }
        c if c == WSAECONNRESET as u32 => OpError::ConnectionReset,
        c if c == WSAENETUNREACH as u32 => OpError::NetworkUnreachable,
        c if c == WSAEMSGSIZE as u32 => OpError::MessageTooBig,
        c if c == WSAESHUTDOWN as u32 => OpError::SocketShutdown,
        c if c == WSAENOTCONN as u32 => OpError::NotConnected,
        c if c == WSAEADDRNOTAVAIL as u32 => OpError::AddressNotAvailable,
        c if c == WSAENOTSOCK as u32 => OpError::NotSocket,
        c if c == WSAEAFNOSUPPORT as u32 => OpError::AddressFamilyUnsupported,
        c if c == WSAENOBUFS as u32 => OpError::SystemResources,
        other => OpError::Unexpected(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_condition() {
        assert_eq!(
            OpError::NotOpenForReading.to_string(),
            "handle is not open for reading"
        );
        assert_eq!(OpError::Canceled.to_string(), "operation canceled");
        assert_eq!(OpError::Unexpected(87).to_string(), "unexpected OS error 87");
    }

    #[test]
    fn canceled_predicate() {
        assert!(OpError::Canceled.is_canceled());
        assert!(!OpError::AccessDenied.is_canceled());
    }

    #[test]
    fn raw_code_only_for_unexpected() {
        assert_eq!(OpError::Unexpected(1450).raw_os_error(), Some(1450));
        assert_eq!(OpError::SystemResources.raw_os_error(), None);
    }

    #[test]
    fn queue_error_display() {
        assert_eq!(QueueError::Overflow.to_string(), "operation table is full");
    }

    #[cfg(windows)]
    #[test]
    fn os_translation_covers_transport_errors() {
        assert_eq!(op_error_from_os(995), OpError::Canceled);
        assert_eq!(op_error_from_os(10054), OpError::ConnectionReset);
        assert_eq!(op_error_from_os(10051), OpError::NetworkUnreachable);
        assert_eq!(op_error_from_os(10040), OpError::MessageTooBig);
        assert_eq!(op_error_from_os(10058), OpError::SocketShutdown);
        assert_eq!(op_error_from_os(10057), OpError::NotConnected);
        assert_eq!(op_error_from_os(10049), OpError::AddressNotAvailable);
        assert_eq!(op_error_from_os(10038), OpError::NotSocket);
        assert_eq!(op_error_from_os(10047), OpError::AddressFamilyUnsupported);
        assert_eq!(op_error_from_os(10055), OpError::SystemResources);
        assert_eq!(op_error_from_os(0xDEAD), OpError::Unexpected(0xDEAD));
    }
}
