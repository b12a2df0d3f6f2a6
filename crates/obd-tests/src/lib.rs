//! Integration tests for the OBD kiosk diagnostic stack
//!
//! This crate contains end-to-end tests that exercise the full stack against
//! the mock transport:
//!
//! - `driver_test.rs` - ELM327 driver: discovery, init, command queue,
//!   watchdog, reconnect
//! - `connection_test.rs` - connection manager: coalesced connects, snapshot
//!   listeners, reconnect policy
//! - `session_test.rs` - session manager: state machine, retries, timeline,
//!   insights
//!
//! All tests run against simulated adapters; no hardware is required.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the test tracing subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
