//! Mock transport for testing
//!
//! Scripts a scan (advertisements delivered on a schedule) and simulates an
//! ELM327 behind each link. The default responder answers the full init
//! sequence plus the common mode 01/03/04 requests; tests override it per
//! command to exercise failure paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};

use super::{Advertisement, EndpointInfo, ObdLink, ObdTransport, TransportError};
use crate::config::MockConfig;

/// Default adapter name used by [`MockTransport::with_default_adapter`]
pub const DEFAULT_ADAPTER_NAME: &str = "EDIAG-1234";
/// Default adapter address used by [`MockTransport::with_default_adapter`]
pub const DEFAULT_ADAPTER_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
/// Default write endpoint id
pub const DEFAULT_WRITE_ENDPOINT: &str = "fff2";
/// Default notify endpoint id
pub const DEFAULT_NOTIFY_ENDPOINT: &str = "fff1";

/// What the simulated adapter does with a command
pub enum MockReply {
    /// Send the body followed by the prompt
    Respond(String),
    /// Swallow the command; the driver will time out
    Silent,
}

type Responder = Box<dyn Fn(&str) -> MockReply + Send + Sync>;

/// An advertisement delivered `delay` after the scan starts
pub struct ScriptedAdvertisement {
    pub advertisement: Advertisement,
    pub delay: Duration,
}

/// Mock transport
pub struct MockTransport {
    config: MockConfig,
    script: RwLock<Vec<ScriptedAdvertisement>>,
    links: RwLock<HashMap<String, Arc<MockLink>>>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            script: RwLock::new(Vec::new()),
            links: RwLock::new(HashMap::new()),
        }
    }

    /// Transport with one well-behaved adapter that advertises promptly
    pub fn with_default_adapter(config: MockConfig) -> Self {
        let transport = Self::new(config);
        transport.advertise(
            Advertisement {
                address: DEFAULT_ADAPTER_ADDRESS.to_string(),
                local_name: Some(DEFAULT_ADAPTER_NAME.to_string()),
                service_ids: vec!["fff0".to_string()],
                rssi: Some(-60),
            },
            Duration::from_millis(10),
        );
        transport.prepare_link(DEFAULT_ADAPTER_ADDRESS);
        transport
    }

    /// Schedule an advertisement for future scans
    pub fn advertise(&self, advertisement: Advertisement, delay: Duration) {
        self.script.write().push(ScriptedAdvertisement {
            advertisement,
            delay,
        });
    }

    /// Create (or return) the link behind `address`
    pub fn prepare_link(&self, address: &str) -> Arc<MockLink> {
        let mut links = self.links.write();
        links
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MockLink::new(address, self.config.latency_ms)))
            .clone()
    }

    /// Access a link created by an earlier connect or prepare
    pub fn link(&self, address: &str) -> Option<Arc<MockLink>> {
        self.links.read().get(address).cloned()
    }
}

#[async_trait]
impl ObdTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (tx, rx) = mpsc::channel(32);
        let mut script: Vec<(Duration, Advertisement)> = self
            .script
            .read()
            .iter()
            .map(|s| (s.delay, s.advertisement.clone()))
            .collect();
        script.sort_by_key(|(delay, _)| *delay);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            for (delay, adv) in script {
                tokio::time::sleep_until(started + delay).await;
                if tx.send(adv).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn ObdLink>, TransportError> {
        let link = self.prepare_link(address);
        if *link.closed().borrow() {
            link.reopen();
        }
        tracing::debug!(address, "Mock transport: link opened");
        Ok(link)
    }
}

/// A simulated adapter link
pub struct MockLink {
    address: String,
    latency: Duration,
    endpoints: RwLock<Vec<EndpointInfo>>,
    notify_tx: broadcast::Sender<Vec<u8>>,
    closed_tx: watch::Sender<bool>,
    responder: RwLock<Responder>,
    commands: Mutex<Vec<String>>,
}

impl MockLink {
    fn new(address: &str, latency_ms: u64) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        let (closed_tx, _) = watch::channel(false);
        Self {
            address: address.to_string(),
            latency: Duration::from_millis(latency_ms),
            endpoints: RwLock::new(vec![
                EndpointInfo {
                    id: DEFAULT_WRITE_ENDPOINT.to_string(),
                    write: true,
                    write_without_response: true,
                    notify: false,
                    indicate: false,
                },
                EndpointInfo {
                    id: DEFAULT_NOTIFY_ENDPOINT.to_string(),
                    write: false,
                    write_without_response: false,
                    notify: true,
                    indicate: false,
                },
            ]),
            notify_tx,
            closed_tx,
            responder: RwLock::new(Box::new(default_responder)),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Replace the command responder
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> MockReply + Send + Sync + 'static,
    {
        *self.responder.write() = Box::new(responder);
    }

    /// Replace the advertised endpoints
    pub fn set_endpoints(&self, endpoints: Vec<EndpointInfo>) {
        *self.endpoints.write() = endpoints;
    }

    /// Commands written so far, prompt terminators stripped
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Simulate an unexpected link drop
    pub fn force_close(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Push raw bytes to notify subscribers, bypassing the responder
    pub fn inject_notification(&self, payload: &[u8]) {
        let _ = self.notify_tx.send(payload.to_vec());
    }

    fn reopen(&self) {
        // `send` drops the update when no receivers exist; `send_replace`
        // always stores the value so a later subscriber sees the link open
        self.closed_tx.send_replace(false);
    }
}

#[async_trait]
impl ObdLink for MockLink {
    fn peer(&self) -> String {
        self.address.clone()
    }

    fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints.read().clone()
    }

    async fn write(&self, _endpoint: &str, payload: &[u8]) -> Result<(), TransportError> {
        if *self.closed_tx.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        let command = String::from_utf8_lossy(payload)
            .trim_end_matches('\r')
            .to_string();
        self.commands.lock().push(command.clone());

        let reply = (self.responder.read())(&command);
        match reply {
            MockReply::Respond(body) => {
                let tx = self.notify_tx.clone();
                let latency = self.latency;
                tokio::spawn(async move {
                    if !latency.is_zero() {
                        tokio::time::sleep(latency).await;
                    }
                    let _ = tx.send(format!("{body}\r\r>").into_bytes());
                });
            }
            MockReply::Silent => {
                tracing::debug!(command, "Mock link: swallowing command");
            }
        }
        Ok(())
    }

    fn subscribe(&self, endpoint: &str) -> Result<broadcast::Receiver<Vec<u8>>, TransportError> {
        let known = self
            .endpoints
            .read()
            .iter()
            .any(|e| e.id.eq_ignore_ascii_case(endpoint));
        if !known {
            return Err(TransportError::UnknownEndpoint(endpoint.to_string()));
        }
        Ok(self.notify_tx.subscribe())
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// Canned ELM327 behavior: full init sequence plus common mode 01/03/04
/// requests against a vehicle with two stored codes and the MIL on
pub fn default_responder(command: &str) -> MockReply {
    let body = match command {
        "ATZ" => "\r\rELM327 v1.5",
        "ATE0" | "ATL1" | "ATS0" | "ATH1" | "ATSP0" | "AT#2" => "OK",
        "AT#1" => "KB EDIAG V2.1",
        "ATRV" => "12.6V",
        "ATDPN" => "A6",
        "0101" => "41 01 82 07 65 04",
        "010C" => "41 0C 1A F8",
        "0105" => "41 05 7B",
        "010D" => "41 0D 37",
        "010F" => "41 0F 5A",
        "0111" => "41 11 80",
        "0142" => "41 42 30 39",
        "03" => "43 01 33 02 44",
        "04" => "44",
        _ => "?",
    };
    MockReply::Respond(body.to_string())
}
