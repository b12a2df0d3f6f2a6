//! Transport traits and types

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

use super::TransportError;

/// An adapter seen during a scan
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Transport-specific address (MAC for wireless, host:port for TCP)
    pub address: String,
    /// Advertised device name, if any
    pub local_name: Option<String>,
    /// Advertised service ids (16-bit short or 128-bit long form)
    pub service_ids: Vec<String>,
    /// Signal strength, if the transport reports it
    pub rssi: Option<i16>,
}

/// A data endpoint exposed by a connected link
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    /// Endpoint id (16-bit short or 128-bit long form)
    pub id: String,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

/// Discovery and connection interface for OBD adapters
///
/// Implementations are selected once at startup via [`TransportConfig`];
/// nothing in the connect path probes for an implementation at runtime.
///
/// [`TransportConfig`]: crate::config::TransportConfig
#[async_trait]
pub trait ObdTransport: Send + Sync {
    /// Short implementation name for logs and snapshots
    fn name(&self) -> &str;

    /// Start a scan. Advertisements arrive on the returned channel until the
    /// receiver is dropped or the transport has nothing more to report.
    async fn scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError>;

    /// Open a link to the adapter at `address`
    async fn connect(&self, address: &str) -> Result<Arc<dyn ObdLink>, TransportError>;
}

/// A connected adapter link
#[async_trait]
pub trait ObdLink: Send + Sync {
    /// Address of the connected peer
    fn peer(&self) -> String;

    /// Endpoints available on this link
    fn endpoints(&self) -> Vec<EndpointInfo>;

    /// Write raw bytes to an endpoint
    async fn write(&self, endpoint: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe to notification chunks from an endpoint
    fn subscribe(&self, endpoint: &str) -> Result<broadcast::Receiver<Vec<u8>>, TransportError>;

    /// Watch that flips to `true` when the link closes, expectedly or not
    fn closed(&self) -> watch::Receiver<bool>;

    /// Close the link. Idempotent.
    async fn close(&self);
}
