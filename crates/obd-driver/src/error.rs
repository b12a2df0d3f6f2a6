//! Driver error types

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by the ELM327 driver
#[derive(Debug, Error)]
pub enum DriverError {
    /// No candidate adapter appeared before the scan deadline
    #[error("adapter discovery timed out after {0:?}")]
    DiscoveryTimeout(Duration),

    /// The scan ended without a usable candidate
    #[error("no matching adapter found")]
    AdapterNotFound,

    /// Endpoint negotiation failed on the connected link
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Writing a command to the link failed
    #[error("transport write failed: {0}")]
    TransportWriteFailure(String),

    /// No prompt arrived before the per-command deadline
    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// The link closed while a command was outstanding
    #[error("connection lost")]
    ConnectionLost,

    /// No link is attached
    #[error("not connected")]
    NotConnected,

    /// A required init command failed or the reset signature was wrong
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Connect was cancelled by the caller
    #[error("connect cancelled")]
    Cancelled,

    /// A response could not be parsed
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
