//! Unified broker error enumeration (§7). Mirrors `broker_runtime::ErrorCode`'s total, `Copy`,
//! exhaustively-mapped shape, extended with the queue/message/transaction kinds the runtime's
//! I/O-only enum has no use for.

use std::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BrokerError {
    Ok,
    InvalidArgument,
    InvalidState,
    QueueNotFound,
    QueueFull,
    MessageTooLarge,
    MessageNotFound,
    Timeout,
    ConnectionRefused,
    ConnectionClosed,
    NetworkUnreachable,
    PermissionDenied,
    BufferOverflow,
    NotInitialized,
    AlreadyInitialized,
    OperationFailed,
    InternalError,
    TransactionNotFound,
}

impl BrokerError {
    pub fn describe(self) -> &'static str {
        match self {
            BrokerError::Ok => "ok",
            BrokerError::InvalidArgument => "invalid argument",
            BrokerError::InvalidState => "invalid state",
            BrokerError::QueueNotFound => "queue not found",
            BrokerError::QueueFull => "queue full",
            BrokerError::MessageTooLarge => "message too large",
            BrokerError::MessageNotFound => "message not found",
            BrokerError::Timeout => "operation timed out",
            BrokerError::ConnectionRefused => "connection refused",
            BrokerError::ConnectionClosed => "connection closed",
            BrokerError::NetworkUnreachable => "network unreachable",
            BrokerError::PermissionDenied => "permission denied",
            BrokerError::BufferOverflow => "buffer overflow",
            BrokerError::NotInitialized => "not initialized",
            BrokerError::AlreadyInitialized => "already initialized",
            BrokerError::OperationFailed => "operation failed",
            BrokerError::InternalError => "internal error",
            BrokerError::TransactionNotFound => "transaction not found",
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for BrokerError {}

impl From<broker_runtime::ErrorCode> for BrokerError {
    fn from(err: broker_runtime::ErrorCode) -> Self {
        match err {
            broker_runtime::ErrorCode::Ok => BrokerError::Ok,
            broker_runtime::ErrorCode::Timeout => BrokerError::Timeout,
            broker_runtime::ErrorCode::ConnectionClosed => BrokerError::ConnectionClosed,
            broker_runtime::ErrorCode::ConnectionRefused => BrokerError::ConnectionRefused,
            broker_runtime::ErrorCode::WouldBlock => BrokerError::Timeout,
            broker_runtime::ErrorCode::AddressInUse => BrokerError::InvalidState,
            broker_runtime::ErrorCode::InvalidArgument => BrokerError::InvalidArgument,
            broker_runtime::ErrorCode::PermissionDenied => BrokerError::PermissionDenied,
            broker_runtime::ErrorCode::NetworkUnreachable => BrokerError::NetworkUnreachable,
            broker_runtime::ErrorCode::BufferOverflow => BrokerError::BufferOverflow,
            broker_runtime::ErrorCode::SendFailed | broker_runtime::ErrorCode::ReceiveFailed => {
                BrokerError::OperationFailed
            }
            broker_runtime::ErrorCode::NotInitialized => BrokerError::NotInitialized,
            broker_runtime::ErrorCode::AlreadyInitialized => BrokerError::AlreadyInitialized,
            broker_runtime::ErrorCode::ConnectionFailed => BrokerError::OperationFailed,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
