//! Diagnostic session management
//!
//! The session manager tracks what the kiosk user experiences: whether the
//! vehicle link is ready, which operation is running, what failed and why.
//! State changes come from two sources: connection snapshots and operation
//! lifecycles.

pub mod insights;
mod manager;

pub use manager::DiagnosticSessionManager;

use chrono::{DateTime, Utc};
use obd_core::{ConnectionSummary, DiagnosticOperation, DiagnosticState};
use serde::Serialize;
use std::collections::BTreeMap;

/// Retry policy and bookkeeping limits for the session manager
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Attempts per operation before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff unit: attempt n waits `base_delay_ms * n`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

/// Per-call overrides for [`DiagnosticSessionManager::run_operation`]
pub struct OperationOptions<T> {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    /// Builds the summary payload attached to the success event
    pub summarize_success: Option<Box<dyn Fn(&T) -> serde_json::Value + Send + Sync>>,
    /// Builds the summary payload attached to a typed-failure event
    pub summarize_failure: Option<Box<dyn Fn(&T) -> serde_json::Value + Send + Sync>>,
    /// Attach a connection summary to the operation's timeline events
    pub capture_snapshot: bool,
}

impl<T> Default for OperationOptions<T> {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: None,
            summarize_success: None,
            summarize_failure: None,
            capture_snapshot: false,
        }
    }
}

/// The operation currently holding the session
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation: DiagnosticOperation,
    pub started_at: DateTime<Utc>,
    /// 1-based attempt counter, bumped on every retry
    pub attempt: u32,
    /// Attempt budget this run was started with
    pub max_attempts: u32,
}

/// Last recorded failure, kept until the next success or acknowledgement
#[derive(Debug, Clone, Serialize)]
pub struct SessionLastError {
    pub message: String,
    pub at: DateTime<Utc>,
    pub operation: Option<DiagnosticOperation>,
}

/// One entry of the bounded transition history
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: DiagnosticState,
    pub to: DiagnosticState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Full session status handed to listeners and pollers
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: DiagnosticState,
    /// When the current state was entered
    pub since: DateTime<Utc>,
    pub active_operation: Option<ActiveOperation>,
    pub last_error: Option<SessionLastError>,
    pub connection: Option<ConnectionSummary>,
    pub reconnect_attempts: u32,
}

/// Counters for one operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationMetrics {
    pub success: u64,
    pub failure: u64,
    pub total: u64,
    /// Mean duration over successful runs only; failures settle too fast and
    /// on too many distinct paths to average meaningfully
    pub average_duration_ms: u64,
}

/// Session-level metrics keyed by operation label
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    pub operations: BTreeMap<String, OperationMetrics>,
    pub totals: OperationMetrics,
}
