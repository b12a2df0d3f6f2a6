//! obd-core - shared models and traits for the OBD kiosk diagnostic stack
//!
//! This crate defines the types that cross layer boundaries:
//! - Diagnostic trouble codes and live sensor values
//! - The operation result type used by driver-level operations
//! - Session/connection state enums and timeline events
//! - The event-store trait used for historical summaries

pub mod models;
pub mod store;
pub mod timeline;

pub use models::dtc::{Dtc, DtcCategory};
pub use models::live::{AdapterIdentity, LiveData, VehicleStatus};
pub use models::operation::{ConnectionState, DiagnosticOperation, DiagnosticState};
pub use models::result::{ObdResult, TaskOutcome};
pub use store::{
    DiagnosticsEventStore, HistoricalSummary, NullEventStore, StoreError, SummaryOptions,
};
pub use timeline::{ConnectionSummary, TimelineEvent, TimelineEventKind};
