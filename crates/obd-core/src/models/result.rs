//! Driver-level operation result type
//!
//! Driver operations report vehicle-level failures (bus silent, adapter
//! rejected the command) as a resolved value with `ok: false` rather than an
//! error. The session layer treats these as final and never retries them,
//! while transport-level errors surface as `Err` and are retried.

use serde::{Deserialize, Serialize};

/// Result of a driver-level diagnostic operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObdResult<T> {
    /// Whether the operation produced usable data
    pub ok: bool,
    /// Payload, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure description, present when `ok` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ObdResult<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome classification for values returned by session operations
///
/// A value whose `failure()` is `Some` settled the operation but reports a
/// business-level failure; the session records it once and hands it back to
/// the caller without retrying.
pub trait TaskOutcome {
    fn failure(&self) -> Option<&str>;
}

impl<T> TaskOutcome for ObdResult<T> {
    fn failure(&self) -> Option<&str> {
        if self.ok {
            None
        } else {
            Some(self.error.as_deref().unwrap_or("operation failed"))
        }
    }
}
