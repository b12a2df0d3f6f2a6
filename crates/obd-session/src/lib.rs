//! obd-session - connection and diagnostic session management
//!
//! Two layers sit between the kiosk application and the ELM327 driver:
//!
//! - [`ObdConnectionManager`] owns the driver lifecycle: coalesced connects,
//!   published connection snapshots, a background monitor and a one-shot
//!   reconnect timer.
//! - [`DiagnosticSessionManager`] owns the user-visible session: a state
//!   machine fed by connection snapshots and operation lifecycles, a retrying
//!   operation runner, a bounded event timeline, and derived insights.

pub mod connection;
pub mod error;
pub mod listeners;
pub mod session;

pub use connection::{
    ConnectionManagerConfig, ConnectionSnapshot, ObdConnectionManager, SnapshotSource,
};
pub use error::{ConnectionError, SessionError};
pub use listeners::Subscription;
pub use session::{
    ActiveOperation, DiagnosticSessionManager, OperationMetrics, OperationOptions, SessionConfig,
    SessionLastError, SessionMetrics, SessionStatus, StateTransition,
};
pub use session::insights::{
    FailureRecord, OperationInsight, SessionInsights, StateSegment,
};

// Re-export for convenience
pub use obd_core::{
    ConnectionState, DiagnosticOperation, DiagnosticState, DiagnosticsEventStore, NullEventStore,
    ObdResult, TaskOutcome,
};
