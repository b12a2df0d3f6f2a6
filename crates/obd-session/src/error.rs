//! Connection and session error types

use obd_core::DiagnosticOperation;
use obd_driver::DriverError;
use thiserror::Error;

/// Errors raised by the connection manager
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A connect attempt failed
    #[error("connect failed: {0}")]
    ConnectFailed(#[from] DriverError),
}

/// Errors raised by the diagnostic session manager
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation was rejected before any attempt: no connection
    #[error("not connected")]
    NotConnected,

    /// Every retry attempt raised; the last error is attached
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: DiagnosticOperation,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}
