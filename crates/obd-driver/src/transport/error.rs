//! Transport layer errors

use thiserror::Error;

/// Errors raised by transport implementations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
