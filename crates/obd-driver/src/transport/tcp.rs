//! TCP transport for WiFi ELM327 dongles
//!
//! WiFi adapters expose the same AT dialect over a raw TCP socket (usually
//! 192.168.0.10:35000). Discovery is trivial here: the configured endpoint is
//! reported as a single synthetic advertisement, and the driver's normal
//! scoring and negotiation run against it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Advertisement, EndpointInfo, ObdLink, ObdTransport, TransportError};
use crate::config::TcpConfig;

/// Pseudo endpoint id for the outbound side of the socket
pub const TCP_WRITE_ENDPOINT: &str = "tx";
/// Pseudo endpoint id for the inbound side of the socket
pub const TCP_NOTIFY_ENDPOINT: &str = "rx";

const READ_BUFFER_SIZE: usize = 512;

/// TCP transport for a single configured adapter
pub struct TcpTransport {
    config: TcpConfig,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl ObdTransport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(1);
        let adv = Advertisement {
            address: self.address(),
            local_name: Some("ELM327 WiFi".to_string()),
            service_ids: Vec::new(),
            rssi: None,
        };
        tx.try_send(adv)
            .map_err(|e| TransportError::ScanFailed(e.to_string()))?;
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn ObdLink>, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(address))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "connect to {} timed out after {:?}",
                    address,
                    self.config.connect_timeout()
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        debug!(address, "TCP transport: connected");
        Ok(Arc::new(TcpLink::new(address, stream)))
    }
}

/// A connected TCP link with a background reader task
pub struct TcpLink {
    address: String,
    write_half: tokio::sync::Mutex<OwnedWriteHalf>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpLink {
    fn new(address: &str, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (notify_tx, _) = broadcast::channel(64);
        let (closed_tx, _) = watch::channel(false);

        let reader = spawn_reader(address.to_string(), read_half, notify_tx.clone(), closed_tx.clone());

        Self {
            address: address.to_string(),
            write_half: tokio::sync::Mutex::new(write_half),
            notify_tx,
            closed_tx,
            reader: Mutex::new(Some(reader)),
        }
    }
}

fn spawn_reader(
    address: String,
    mut read_half: OwnedReadHalf,
    notify_tx: broadcast::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    warn!(address, "TCP link: peer closed the connection");
                    break;
                }
                Ok(_) => {
                    let _ = notify_tx.send(buf.split().to_vec());
                }
                Err(e) => {
                    warn!(address, error = %e, "TCP link: read failed");
                    break;
                }
            }
        }
        let _ = closed_tx.send(true);
    })
}

#[async_trait]
impl ObdLink for TcpLink {
    fn peer(&self) -> String {
        self.address.clone()
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        vec![
            EndpointInfo {
                id: TCP_WRITE_ENDPOINT.to_string(),
                write: true,
                write_without_response: false,
                notify: false,
                indicate: false,
            },
            EndpointInfo {
                id: TCP_NOTIFY_ENDPOINT.to_string(),
                write: false,
                write_without_response: false,
                notify: true,
                indicate: false,
            },
        ]
    }

    async fn write(&self, _endpoint: &str, payload: &[u8]) -> Result<(), TransportError> {
        if *self.closed_tx.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut half = self.write_half.lock().await;
        half.write_all(payload)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        half.flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, endpoint: &str) -> Result<broadcast::Receiver<Vec<u8>>, TransportError> {
        if !endpoint.eq_ignore_ascii_case(TCP_NOTIFY_ENDPOINT) {
            return Err(TransportError::UnknownEndpoint(endpoint.to_string()));
        }
        Ok(self.notify_tx.subscribe())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
        debug!(address = %self.address, "TCP link: closed");
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}
