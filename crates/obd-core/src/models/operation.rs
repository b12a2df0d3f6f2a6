//! Session and connection state enums

use std::fmt;

use serde::{Deserialize, Serialize};

/// The diagnostic operations a kiosk session can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticOperation {
    /// Read stored trouble codes (mode 03)
    ReadDtc,
    /// Read a batch of live sensor PIDs (mode 01)
    LiveData,
    /// Read monitor status and MIL state (PID 01)
    Status,
    /// Combined status + live-data health check
    SelfCheck,
    /// Clear stored trouble codes (mode 04)
    ClearDtc,
}

impl DiagnosticOperation {
    /// All operations, in display order
    pub fn all() -> [DiagnosticOperation; 5] {
        [
            Self::ReadDtc,
            Self::LiveData,
            Self::Status,
            Self::SelfCheck,
            Self::ClearDtc,
        ]
    }

    /// Stable snake_case label used in metrics keys and transition reasons
    pub fn label(&self) -> &'static str {
        match self {
            Self::ReadDtc => "read_dtc",
            Self::LiveData => "live_data",
            Self::Status => "status",
            Self::SelfCheck => "self_check",
            Self::ClearDtc => "clear_dtc",
        }
    }
}

impl fmt::Display for DiagnosticOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Diagnostic session state machine
///
/// `Authenticating` is reserved for adapters that require a pairing handshake;
/// no current transport enters it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reading,
    Clearing,
    Error,
}

impl DiagnosticState {
    /// True while an operation holds the session
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Reading | Self::Clearing)
    }
}

impl fmt::Display for DiagnosticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reading => "reading",
            Self::Clearing => "clearing",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Link state as seen by the connection manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_labels_are_stable() {
        let labels: Vec<&str> = DiagnosticOperation::all().iter().map(|o| o.label()).collect();
        assert_eq!(
            labels,
            vec!["read_dtc", "live_data", "status", "self_check", "clear_dtc"]
        );
    }

    #[test]
    fn test_busy_states() {
        assert!(DiagnosticState::Reading.is_busy());
        assert!(DiagnosticState::Clearing.is_busy());
        assert!(!DiagnosticState::Ready.is_busy());
        assert!(!DiagnosticState::Error.is_busy());
    }
}
