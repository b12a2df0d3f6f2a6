//! obd-driver - ELM327 protocol driver for the OBD kiosk
//!
//! This crate talks the ELM327 AT dialect to a wireless OBD-II adapter and
//! exposes typed diagnostic operations on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Elm327Driver                            │
//! │                                                             │
//! │  ┌─────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │ discovery   │  │command queue │  │ watchdog          │  │
//! │  │ (scan/score)│  │(single flight│  │ (hung-link close) │  │
//! │  └─────────────┘  └──────────────┘  └───────────────────┘  │
//! │                          │                                  │
//! │                    ┌─────┴─────┐                            │
//! │                    │  parse    │                            │
//! │                    │ (DTC/PID) │                            │
//! │                    └─────┬─────┘                            │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │  ObdTransport   │                         │
//! │                 │  (tcp / mock)   │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod discovery;
pub mod elm327;
pub mod error;
pub mod metrics;
pub mod parse;
pub mod transport;

pub use config::{AdapterConfig, MockConfig, TcpConfig, TransportConfig};
pub use discovery::ConnectPhase;
pub use elm327::{DriverEvent, Elm327Driver};
pub use error::DriverError;
pub use metrics::DriverMetrics;
pub use transport::{
    create_transport, Advertisement, EndpointInfo, ObdLink, ObdTransport, TransportError,
};

// Re-export for convenience
pub use obd_core::{AdapterIdentity, Dtc, DtcCategory, LiveData, ObdResult, VehicleStatus};
