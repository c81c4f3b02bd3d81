//! Maps host socket errors onto a single portable error enumeration, the way
//! `Asio::ErrorMapping` does for the original runtime.

use std::fmt;
use std::io;

/// Unified error code produced by every reactor, proactor and socket operation in this crate.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    Ok,
    Timeout,
    ConnectionClosed,
    ConnectionRefused,
    WouldBlock,
    AddressInUse,
    InvalidArgument,
    PermissionDenied,
    NetworkUnreachable,
    BufferOverflow,
    SendFailed,
    ReceiveFailed,
    NotInitialized,
    AlreadyInitialized,
    ConnectionFailed,
}

impl ErrorCode {
    /// Maps a raw `io::Error` to a unified code. Total: unknown `io::ErrorKind`s fall back to
    /// `ConnectionFailed`, matching the original's catch-all `MapSystemError` default branch.
    #[inline]
    pub fn from_io_error(err: &io::Error) -> ErrorCode {
        Self::from_io_kind(err.kind())
    }

    #[inline]
    pub fn from_io_kind(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            io::ErrorKind::TimedOut => ErrorCode::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => ErrorCode::ConnectionClosed,
            io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
            io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorCode::InvalidArgument,
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            io::ErrorKind::AddrNotAvailable => ErrorCode::NetworkUnreachable,
            io::ErrorKind::WriteZero => ErrorCode::BufferOverflow,
            _ => ErrorCode::ConnectionFailed,
        }
    }

    /// Human-readable description, mirroring `ErrorMapping::GetErrorString`.
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::Timeout => "operation timed out",
            ErrorCode::ConnectionClosed => "connection closed",
            ErrorCode::ConnectionRefused => "connection refused",
            ErrorCode::WouldBlock => "operation would block",
            ErrorCode::AddressInUse => "address already in use",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::NetworkUnreachable => "network unreachable",
            ErrorCode::BufferOverflow => "buffer overflow",
            ErrorCode::SendFailed => "send failed",
            ErrorCode::ReceiveFailed => "receive failed",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::AlreadyInitialized => "already initialized",
            ErrorCode::ConnectionFailed => "connection failed",
        }
    }

    /// True for the non-fatal "try again" class of error (would-block, timeout).
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::WouldBlock | ErrorCode::Timeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for ErrorCode {}

impl From<io::Error> for ErrorCode {
    #[inline]
    fn from(err: io::Error) -> Self {
        ErrorCode::from_io_error(&err)
    }
}

pub type IoResult<T> = Result<T, ErrorCode>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_to_would_block() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::WouldBlock);
        assert!(ErrorCode::from_io_error(&err).is_retryable());
    }

    #[test]
    fn connection_reset_maps_to_connection_closed() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::ConnectionClosed);
    }

    #[test]
    fn unknown_kind_falls_back_to_connection_failed() {
        let err = io::Error::from(io::ErrorKind::Other);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::ConnectionFailed);
    }

    #[test]
    fn display_matches_describe() {
        assert_eq!(ErrorCode::Timeout.to_string(), "operation timed out");
    }
}
