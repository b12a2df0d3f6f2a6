//! ELM327 driver: connect, init, single-flight command queue, watchdog

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use obd_core::{AdapterIdentity, Dtc, LiveData, ObdResult, VehicleStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::AdapterConfig;
use crate::discovery::{self, ConnectPhase};
use crate::error::DriverError;
use crate::metrics::DriverMetrics;
use crate::parse;
use crate::transport::{ObdLink, ObdTransport};

/// Required init commands after the reset, in protocol order: echo off,
/// linefeeds on, spaces off, headers on, automatic protocol selection
const INIT_SEQUENCE: &[&str] = &["ATE0", "ATL1", "ATS0", "ATH1", "ATSP0"];

/// PIDs fetched by a live-data read
const LIVE_PIDS: &[&str] = &["0C", "05", "0D", "0F", "11", "42"];

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle notifications for observers (the connection manager)
#[derive(Debug, Clone)]
pub enum DriverEvent {
    Connected { reconnect: bool },
    Disconnected,
    ReconnectScheduled { delay_ms: u64 },
    WatchdogTriggered,
}

struct LinkState {
    link: Arc<dyn ObdLink>,
    write_endpoint: String,
    adapter_name: Option<String>,
}

/// Receiver side of the command queue. Guarded by the async mutex that also
/// serializes commands, so only the in-flight command reads from it.
struct CommandChannel {
    rx: Option<broadcast::Receiver<Vec<u8>>>,
    buffer: String,
}

struct DriverInner {
    config: AdapterConfig,
    transport: Arc<dyn ObdTransport>,
    link: RwLock<Option<LinkState>>,
    identity: RwLock<AdapterIdentity>,
    metrics: RwLock<DriverMetrics>,
    channel: AsyncMutex<CommandChannel>,
    pending: AtomicBool,
    last_settlement: RwLock<Option<Instant>>,
    queue_depth: AtomicU32,
    user_disconnect: AtomicBool,
    events: broadcast::Sender<DriverEvent>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    close_monitor: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        for slot in [&self.watchdog, &self.close_monitor, &self.reconnect] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

/// ELM327 protocol driver over an abstract transport
#[derive(Clone)]
pub struct Elm327Driver {
    inner: Arc<DriverInner>,
}

impl Elm327Driver {
    pub fn new(transport: Arc<dyn ObdTransport>, config: AdapterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DriverInner {
                config,
                transport,
                link: RwLock::new(None),
                identity: RwLock::new(AdapterIdentity::default()),
                metrics: RwLock::new(DriverMetrics::default()),
                channel: AsyncMutex::new(CommandChannel {
                    rx: None,
                    buffer: String::new(),
                }),
                pending: AtomicBool::new(false),
                last_settlement: RwLock::new(None),
                queue_depth: AtomicU32::new(0),
                user_disconnect: AtomicBool::new(false),
                events,
                watchdog: Mutex::new(None),
                close_monitor: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        }
    }

    /// Discover an adapter, open the link, negotiate endpoints and run the
    /// init sequence. No-op when already connected.
    pub async fn connect(
        &self,
        cancel: Option<watch::Receiver<bool>>,
        is_reconnect: bool,
    ) -> Result<(), DriverError> {
        if self.is_connected() {
            return Ok(());
        }

        self.inner
            .metrics
            .write()
            .record_connection_attempt(is_reconnect);
        info!(reconnect = is_reconnect, "Connecting to OBD adapter");

        let result = self.connect_inner(cancel).await;
        match &result {
            Ok(()) => {
                self.inner
                    .metrics
                    .write()
                    .record_connect_outcome(is_reconnect, true);
                let _ = self.inner.events.send(DriverEvent::Connected {
                    reconnect: is_reconnect,
                });
            }
            Err(e) => {
                self.inner
                    .metrics
                    .write()
                    .record_connect_outcome(is_reconnect, false);
                warn!(reconnect = is_reconnect, error = %e, "Connect failed");
            }
        }
        result
    }

    async fn connect_inner(
        &self,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<(), DriverError> {
        let discovered =
            discovery::discover(self.inner.transport.as_ref(), &self.inner.config, cancel).await?;
        self.inner.metrics.write().last_connect_phase = Some(discovered.phase);
        if discovered.phase == ConnectPhase::Widened {
            info!(
                address = %discovered.advertisement.address,
                "Adapter found by widened scan"
            );
        }

        let link = self
            .inner
            .transport
            .connect(&discovered.advertisement.address)
            .await?;

        let (write_endpoint, notify_endpoint) =
            match discovery::negotiate_endpoints(&link.endpoints(), &self.inner.config) {
                Ok(pair) => pair,
                Err(e) => {
                    link.close().await;
                    return Err(e);
                }
            };

        let rx = match link.subscribe(&notify_endpoint) {
            Ok(rx) => rx,
            Err(e) => {
                link.close().await;
                return Err(e.into());
            }
        };

        {
            let mut chan = self.inner.channel.lock().await;
            chan.rx = Some(rx);
            chan.buffer.clear();
        }
        *self.inner.last_settlement.write() = Some(Instant::now());
        self.inner.user_disconnect.store(false, Ordering::SeqCst);
        *self.inner.link.write() = Some(LinkState {
            link: link.clone(),
            write_endpoint,
            adapter_name: discovered.advertisement.local_name.clone(),
        });
        self.spawn_close_monitor(link.closed());

        if let Err(e) = self.initialize().await {
            self.teardown().await;
            return Err(e);
        }
        self.spawn_watchdog();

        info!(
            address = %discovered.advertisement.address,
            name = ?discovered.advertisement.local_name,
            phase = ?discovered.phase,
            "OBD adapter ready"
        );
        Ok(())
    }

    /// Run the init sequence. The reset response must carry the ELM327
    /// signature; later optional commands may fail without aborting.
    async fn initialize(&self) -> Result<(), DriverError> {
        let reset = self
            .send_command("ATZ", None)
            .await
            .map_err(|e| DriverError::InitFailed(format!("ATZ: {e}")))?;
        let upper = reset.to_uppercase();
        if !upper.contains("ELM327") && !upper.contains("OK") {
            return Err(DriverError::InitFailed(format!(
                "unexpected reset response: {}",
                reset.trim()
            )));
        }
        // Adapters drop characters while rebooting after ATZ
        tokio::time::sleep(Duration::from_millis(self.inner.config.reset_delay_ms)).await;

        for cmd in INIT_SEQUENCE {
            self.send_command(cmd, None)
                .await
                .map_err(|e| DriverError::InitFailed(format!("{cmd}: {e}")))?;
        }

        if self.inner.config.extended_mode {
            self.optional_command("AT#2").await;
        }
        let firmware = self.optional_command("AT#1").await;
        let voltage = self.optional_command("ATRV").await;
        let protocol = self.optional_command("ATDPN").await;

        let mut identity = self.inner.identity.write();
        identity.firmware = firmware.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        identity.voltage = voltage.as_deref().and_then(parse::parse_voltage);
        identity.protocol = protocol.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Ok(())
    }

    async fn optional_command(&self, command: &str) -> Option<String> {
        match self.send_command(command, None).await {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(command, error = %e, "Optional init command failed, continuing");
                None
            }
        }
    }

    /// Send one AT or OBD command and wait for the prompt-framed response.
    ///
    /// Commands queue FIFO behind an async mutex; exactly one command has an
    /// outstanding response at any time, and every settlement path releases
    /// the queue so a failing command never wedges the next one.
    pub async fn send_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, DriverError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.command_timeout());

        let depth = self.inner.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.metrics.write().set_queue_depth(depth);

        let mut chan = self.inner.channel.lock().await;
        let result = self.execute(&mut chan, command, timeout).await;
        drop(chan);

        let depth = self.inner.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
        self.inner.metrics.write().set_queue_depth(depth);
        result
    }

    async fn execute(
        &self,
        chan: &mut CommandChannel,
        command: &str,
        timeout: Duration,
    ) -> Result<String, DriverError> {
        let (link, write_endpoint) = {
            let guard = self.inner.link.read();
            match guard.as_ref() {
                Some(state) => (state.link.clone(), state.write_endpoint.clone()),
                None => return Err(DriverError::NotConnected),
            }
        };
        let mut closed = link.closed();

        let started = Instant::now();
        self.inner.metrics.write().record_command_started(command);
        self.inner.pending.store(true, Ordering::SeqCst);
        debug!(command, "Sending command");

        let payload = format!("{command}\r");
        if let Err(e) = link.write(&write_endpoint, payload.as_bytes()).await {
            let msg = e.to_string();
            self.settle_failure(command, started, &msg, false);
            return Err(DriverError::TransportWriteFailure(msg));
        }
        self.inner.metrics.write().record_bytes_sent(payload.len());

        let deadline = started + timeout;
        loop {
            let rx = match chan.rx.as_mut() {
                Some(rx) => rx,
                None => {
                    self.settle_failure(command, started, "notification channel missing", false);
                    return Err(DriverError::ConnectionLost);
                }
            };

            tokio::select! {
                recv = tokio::time::timeout_at(deadline, rx.recv()) => match recv {
                    Err(_) => {
                        self.settle_failure(
                            command,
                            started,
                            &format!("no response within {timeout:?}"),
                            true,
                        );
                        return Err(DriverError::CommandTimeout(timeout));
                    }
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        warn!(command, skipped, "Notification stream lagged");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        self.settle_failure(command, started, "link closed", false);
                        return Err(DriverError::ConnectionLost);
                    }
                    Ok(Ok(chunk)) => {
                        self.inner.metrics.write().record_bytes_received(chunk.len());
                        chan.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        if let Some(pos) = chan.buffer.find('>') {
                            let raw: String = chan.buffer.drain(..=pos).collect();
                            let response = raw
                                .trim_end_matches('>')
                                .trim()
                                .replace("\r\n", "\n")
                                .replace('\r', "\n");
                            self.settle_success(command, started);
                            return Ok(response);
                        }
                    }
                },
                _ = closed.changed() => {
                    if *closed.borrow() {
                        self.settle_failure(command, started, "link closed", false);
                        return Err(DriverError::ConnectionLost);
                    }
                }
            }
        }
    }

    fn settle_success(&self, command: &str, started: Instant) {
        self.inner.pending.store(false, Ordering::SeqCst);
        *self.inner.last_settlement.write() = Some(Instant::now());
        let elapsed = started.elapsed().as_millis() as u64;
        self.inner.metrics.write().record_success(elapsed);
        debug!(command, duration_ms = elapsed, "Command settled");
    }

    fn settle_failure(&self, command: &str, started: Instant, error: &str, timed_out: bool) {
        self.inner.pending.store(false, Ordering::SeqCst);
        *self.inner.last_settlement.write() = Some(Instant::now());
        let elapsed = started.elapsed().as_millis() as u64;
        self.inner
            .metrics
            .write()
            .record_failure(elapsed, error, timed_out);
        warn!(command, error, duration_ms = elapsed, "Command failed");
    }

    /// Watchdog: while a response is outstanding, a settlement gap longer
    /// than twice the command timeout means the link is hung. Force it
    /// closed so the in-flight command settles through the disconnect path.
    fn spawn_watchdog(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.watchdog_interval();
        let limit = self.inner.config.command_timeout() * 2;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !inner.pending.load(Ordering::SeqCst) {
                    continue;
                }
                let stale = inner
                    .last_settlement
                    .read()
                    .map_or(false, |t| t.elapsed() > limit);
                if !stale {
                    continue;
                }
                warn!(limit_ms = limit.as_millis() as u64, "Watchdog: hung command, forcing link closed");
                inner.metrics.write().record_watchdog_trigger();
                let _ = inner.events.send(DriverEvent::WatchdogTriggered);
                let link = inner.link.read().as_ref().map(|s| s.link.clone());
                if let Some(link) = link {
                    link.close().await;
                }
            }
        });
        if let Some(old) = self.inner.watchdog.lock().replace(handle) {
            old.abort();
        }
    }

    fn spawn_close_monitor(&self, mut closed: watch::Receiver<bool>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                if *closed.borrow() {
                    break;
                }
                if closed.changed().await.is_err() {
                    break;
                }
            }
            let Some(inner) = weak.upgrade() else { return };
            if inner.user_disconnect.load(Ordering::SeqCst) {
                return;
            }
            DriverInner::handle_unexpected_close(&inner);
        });
        if let Some(old) = self.inner.close_monitor.lock().replace(handle) {
            old.abort();
        }
    }

    async fn teardown(&self) {
        if let Some(handle) = self.inner.watchdog.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.close_monitor.lock().take() {
            handle.abort();
        }
        let state = self.inner.link.write().take();
        if let Some(state) = state {
            state.link.close().await;
        }
    }

    /// Close the link and stop background tasks. Idempotent; never schedules
    /// a reconnect. Metrics survive for post-mortem inspection.
    pub async fn disconnect(&self) {
        self.inner.user_disconnect.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.reconnect.lock().take() {
            handle.abort();
        }
        self.teardown().await;

        let mut chan = self.inner.channel.lock().await;
        chan.rx = None;
        chan.buffer.clear();
        info!("Disconnected from adapter");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.read().is_some()
    }

    /// Name the adapter advertised during discovery
    pub fn adapter_name(&self) -> Option<String> {
        self.inner
            .link
            .read()
            .as_ref()
            .and_then(|s| s.adapter_name.clone())
    }

    /// Identity gathered from the optional init queries
    pub fn identity(&self) -> AdapterIdentity {
        self.inner.identity.read().clone()
    }

    pub fn metrics(&self) -> DriverMetrics {
        self.inner.metrics.read().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.inner.events.subscribe()
    }

    /// Read stored trouble codes (mode 03)
    pub async fn read_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        match self.send_command("03", None).await {
            Ok(resp) if parse::is_error_marker(&resp) => ObdResult::failure(resp.trim().to_string()),
            Ok(resp) if parse::is_no_data(&resp) => ObdResult::success(Vec::new()),
            Ok(resp) => ObdResult::success(parse::parse_dtcs(&resp)),
            Err(e) => ObdResult::failure(e.to_string()),
        }
    }

    /// Clear stored trouble codes (mode 04)
    pub async fn clear_dtcs(&self) -> ObdResult<bool> {
        match self.send_command("04", None).await {
            Ok(resp) if parse::is_clear_ok(&resp) => ObdResult::success(true),
            Ok(resp) => ObdResult::failure(format!("clear rejected: {}", resp.trim())),
            Err(e) => ObdResult::failure(e.to_string()),
        }
    }

    /// Read the live-data PID batch. PIDs the vehicle does not answer stay
    /// `None`; losing the link mid-batch fails the whole read.
    pub async fn read_live_data(&self) -> ObdResult<LiveData> {
        let mut data = LiveData::default();
        for pid in LIVE_PIDS {
            match self.send_command(&format!("01{pid}"), None).await {
                Ok(resp) => {
                    let value = parse::parse_pid_response(&resp, pid);
                    match *pid {
                        "0C" => data.rpm = value,
                        "05" => data.coolant_temp_c = value,
                        "0D" => data.speed_kph = value,
                        "0F" => data.intake_temp_c = value,
                        "11" => data.throttle_pct = value,
                        "42" => data.module_voltage = value,
                        _ => {}
                    }
                }
                Err(e @ (DriverError::NotConnected | DriverError::ConnectionLost)) => {
                    return ObdResult::failure(e.to_string());
                }
                Err(e) => {
                    debug!(pid, error = %e, "Live data PID failed");
                }
            }
        }
        ObdResult::success(data)
    }

    /// Read monitor status: MIL lamp and stored-code count (PID 01)
    pub async fn read_status(&self) -> ObdResult<VehicleStatus> {
        match self.send_command("0101", None).await {
            Ok(resp) => match parse::parse_status(&resp) {
                Some(status) => ObdResult::success(status),
                None => ObdResult::failure(format!("unparseable status response: {}", resp.trim())),
            },
            Err(e) => ObdResult::failure(e.to_string()),
        }
    }

    /// Read the battery voltage at the OBD port (ATRV)
    pub async fn read_voltage(&self) -> ObdResult<f64> {
        match self.send_command("ATRV", None).await {
            Ok(resp) => match parse::parse_voltage(&resp) {
                Some(v) => ObdResult::success(v),
                None => ObdResult::failure(format!("unparseable voltage: {}", resp.trim())),
            },
            Err(e) => ObdResult::failure(e.to_string()),
        }
    }
}

impl DriverInner {
    fn handle_unexpected_close(inner: &Arc<DriverInner>) {
        warn!("Adapter link closed unexpectedly");
        *inner.link.write() = None;
        if let Some(handle) = inner.watchdog.lock().take() {
            handle.abort();
        }
        let _ = inner.events.send(DriverEvent::Disconnected);

        if !inner.config.auto_reconnect {
            return;
        }
        let delay = inner.config.reconnect_delay();
        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        let _ = inner.events.send(DriverEvent::ReconnectScheduled {
            delay_ms: delay.as_millis() as u64,
        });

        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.link.read().is_some() || inner.user_disconnect.load(Ordering::SeqCst) {
                return;
            }
            let driver = Elm327Driver { inner };
            if let Err(e) = driver.connect(None, true).await {
                warn!(error = %e, "Reconnect attempt failed");
            }
        });
        if let Some(old) = inner.reconnect.lock().replace(handle) {
            old.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::transport::mock::{MockReply, MockTransport, DEFAULT_ADAPTER_ADDRESS};

    fn test_config() -> AdapterConfig {
        AdapterConfig {
            command_timeout_ms: 500,
            discovery_timeout_ms: 2_000,
            candidate_settle_ms: 20,
            reset_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_runs_init_sequence_in_order() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let driver = Elm327Driver::new(transport.clone(), test_config());

        driver.connect(None, false).await.unwrap();

        let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
        let commands = link.commands();
        assert_eq!(
            &commands[..6],
            &["ATZ", "ATE0", "ATL1", "ATS0", "ATH1", "ATSP0"]
        );
        assert!(driver.is_connected());
        driver.disconnect().await;
    }

    #[tokio::test]
    async fn test_bad_reset_signature_is_fatal() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
        link.set_responder(|cmd| match cmd {
            "ATZ" => MockReply::Respond("GARBAGE".to_string()),
            _ => crate::transport::mock::default_responder(cmd),
        });

        let driver = Elm327Driver::new(transport, test_config());
        let err = driver.connect(None, false).await.unwrap_err();
        assert!(matches!(err, DriverError::InitFailed(_)));
        assert!(!driver.is_connected());
    }

    #[tokio::test]
    async fn test_optional_command_failure_is_swallowed() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
        link.set_responder(|cmd| match cmd {
            // Firmware, voltage and protocol queries all time out
            "AT#1" | "ATRV" | "ATDPN" => MockReply::Silent,
            _ => crate::transport::mock::default_responder(cmd),
        });

        let driver = Elm327Driver::new(transport, test_config());
        driver.connect(None, false).await.unwrap();
        assert!(driver.is_connected());
        assert_eq!(driver.identity(), AdapterIdentity::default());
        driver.disconnect().await;
    }

    #[tokio::test]
    async fn test_identity_gathered_from_init() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let driver = Elm327Driver::new(transport, test_config());
        driver.connect(None, false).await.unwrap();

        let identity = driver.identity();
        assert_eq!(identity.firmware.as_deref(), Some("KB EDIAG V2.1"));
        assert_eq!(identity.voltage, Some(12.6));
        assert_eq!(identity.protocol.as_deref(), Some("A6"));
        driver.disconnect().await;
    }

    #[tokio::test]
    async fn test_command_rejected_when_not_connected() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let driver = Elm327Driver::new(transport, test_config());
        let err = driver.send_command("0100", None).await.unwrap_err();
        assert!(matches!(err, DriverError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
        let driver = Elm327Driver::new(transport, test_config());
        driver.connect(None, false).await.unwrap();
        driver.disconnect().await;
        driver.disconnect().await;
        assert!(!driver.is_connected());
    }
}
