//! Transport layer for adapter communication
//!
//! This module provides transports for reaching an ELM327 adapter:
//! - TCP transport for WiFi dongles
//! - Mock transport for testing
//!
//! # Example
//!
//! ```ignore
//! use obd_driver::transport::{create_transport, ObdTransport};
//! use obd_driver::config::TransportConfig;
//!
//! let config = TransportConfig::default();
//! let transport = create_transport(&config)?;
//! let mut scan = transport.scan().await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod tcp;

pub use adapter::{Advertisement, EndpointInfo, ObdLink, ObdTransport};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a transport based on configuration
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Arc<dyn ObdTransport>, TransportError> {
    match config {
        TransportConfig::Tcp(cfg) => {
            if cfg.host.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "tcp transport requires a host".to_string(),
                ));
            }
            Ok(Arc::new(tcp::TcpTransport::new(cfg.clone())))
        }
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockTransport::new(cfg.clone()))),
    }
}
