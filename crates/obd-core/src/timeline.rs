//! Session timeline events
//!
//! Every state transition and operation outcome is recorded as a timeline
//! event. Events carry a strictly monotonic sequence number and a derived
//! string id (`evt_<seq in base36>`) used for cursor-style paging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::operation::{ConnectionState, DiagnosticOperation, DiagnosticState};

/// Compact view of the connection attached to a state-change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A single timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Cursor id, `evt_` followed by the sequence number in base36
    pub id: String,
    /// Strictly monotonic sequence number
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TimelineEventKind,
}

impl TimelineEvent {
    pub fn new(seq: u64, kind: TimelineEventKind) -> Self {
        Self {
            id: format!("evt_{}", to_base36(seq)),
            seq,
            at: Utc::now(),
            kind,
        }
    }
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEventKind {
    StateChange {
        from: DiagnosticState,
        to: DiagnosticState,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        reconnect_attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection: Option<ConnectionSummary>,
    },
    OperationStarted {
        operation: DiagnosticOperation,
        attempt: u32,
        attempts_allowed: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection: Option<ConnectionSummary>,
    },
    OperationSucceeded {
        operation: DiagnosticOperation,
        duration_ms: u64,
        attempts_allowed: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection: Option<ConnectionSummary>,
    },
    OperationFailed {
        operation: DiagnosticOperation,
        duration_ms: u64,
        attempt: u32,
        attempts_allowed: u32,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection: Option<ConnectionSummary>,
    },
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(seq: u64) -> TimelineEvent {
        TimelineEvent::new(seq, TimelineEventKind::OperationStarted {
            operation: DiagnosticOperation::ReadDtc,
            attempt: 1,
            attempts_allowed: 3,
            connection: None,
        })
    }

    #[test]
    fn test_event_ids_are_base36() {
        assert_eq!(started(0).id, "evt_0");
        assert_eq!(started(36).id, "evt_10");
        assert_eq!(started(35).id, "evt_z");
    }

    #[test]
    fn test_event_serializes_with_flattened_kind() {
        let e = TimelineEvent::new(1, TimelineEventKind::OperationFailed {
            operation: DiagnosticOperation::ClearDtc,
            duration_ms: 120,
            attempt: 3,
            attempts_allowed: 3,
            error: "command timed out".to_string(),
            summary: None,
            connection: None,
        });
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "operation_failed");
        assert_eq!(v["operation"], "clear_dtc");
        assert_eq!(v["attempt"], 3);
        assert_eq!(v["attempts_allowed"], 3);
        // Empty optionals stay off the wire
        assert!(v.get("summary").is_none());
        assert!(v.get("connection").is_none());
    }
}
