//! Connection manager: driver lifecycle, snapshots, background reconnect

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use obd_core::{AdapterIdentity, ConnectionState};
use obd_driver::{
    AdapterConfig, DriverEvent, DriverMetrics, Elm327Driver, ObdTransport,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::listeners::{ListenerRegistry, Subscription};

/// Connection manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionManagerConfig {
    /// Driver settings for each connect attempt
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Run the monitor and reconnect timers. Off by default so tests stay
    /// deterministic; the kiosk binary turns it on.
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterConfig::default(),
            background: false,
            monitor_interval_ms: default_monitor_interval_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

/// Immutable view of the connection, published to listeners on every change
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    /// Transport implementation name
    pub transport: String,
    /// Name the adapter advertised, when connected
    pub adapter_name: Option<String>,
    pub identity: Option<AdapterIdentity>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Reconnect attempts scheduled since the last successful connect
    pub reconnect_attempts: u32,
    /// Live driver metrics, merged in at snapshot time
    pub metrics: Option<DriverMetrics>,
}

/// Anything that publishes connection snapshots to listeners
///
/// The session manager depends on this seam rather than on the concrete
/// manager, so tests can feed it scripted snapshots.
pub trait SnapshotSource: Send + Sync {
    /// Register a listener. It is invoked immediately with the current
    /// snapshot, then on every change. Dropping the handle unsubscribes.
    fn subscribe_snapshots(
        &self,
        listener: Box<dyn Fn(&ConnectionSnapshot) + Send + Sync>,
    ) -> Subscription;
}

struct ConnInner {
    config: ConnectionManagerConfig,
    transport: Arc<dyn ObdTransport>,
    driver: RwLock<Option<Elm327Driver>>,
    snapshot: RwLock<ConnectionSnapshot>,
    connect_gate: tokio::sync::Mutex<()>,
    listeners: ListenerRegistry<ConnectionSnapshot>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    events_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        for slot in [&self.monitor, &self.reconnect, &self.events_task] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

/// Owns the driver and keeps the kiosk's view of the adapter connection
#[derive(Clone)]
pub struct ObdConnectionManager {
    inner: Arc<ConnInner>,
}

impl ObdConnectionManager {
    pub fn new(transport: Arc<dyn ObdTransport>, config: ConnectionManagerConfig) -> Self {
        let snapshot = ConnectionSnapshot {
            state: ConnectionState::Disconnected,
            transport: transport.name().to_string(),
            adapter_name: None,
            identity: None,
            last_connected_at: None,
            last_failure_at: None,
            last_error: None,
            reconnect_attempts: 0,
            metrics: None,
        };
        let manager = Self {
            inner: Arc::new(ConnInner {
                config,
                transport,
                driver: RwLock::new(None),
                snapshot: RwLock::new(snapshot),
                connect_gate: tokio::sync::Mutex::new(()),
                listeners: ListenerRegistry::new(),
                monitor: Mutex::new(None),
                reconnect: Mutex::new(None),
                events_task: Mutex::new(None),
            }),
        };
        if manager.inner.config.background {
            manager.spawn_monitor();
        }
        manager
    }

    /// Current snapshot with live driver metrics merged in
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let mut snap = self.inner.snapshot.read().clone();
        if let Some(driver) = self.inner.driver.read().as_ref() {
            snap.metrics = Some(driver.metrics());
        }
        snap
    }

    /// Connected driver, if any
    pub fn driver(&self) -> Option<Elm327Driver> {
        self.inner
            .driver
            .read()
            .as_ref()
            .filter(|d| d.is_connected())
            .cloned()
    }

    /// Connect to the adapter. Concurrent calls coalesce on a single
    /// underlying attempt; when already connected this returns the live
    /// driver unless `force` is set.
    pub async fn connect(&self, force: bool) -> Result<Elm327Driver, ConnectionError> {
        self.do_connect(force, false).await
    }

    async fn do_connect(
        &self,
        force: bool,
        is_reconnect: bool,
    ) -> Result<Elm327Driver, ConnectionError> {
        if !force {
            if let Some(driver) = self.driver() {
                return Ok(driver);
            }
        }

        let _gate = self.inner.connect_gate.lock().await;

        // A coalesced caller sees the attempt that just finished
        if !force {
            if let Some(driver) = self.driver() {
                return Ok(driver);
            }
        }
        if force {
            self.detach_and_close().await;
        }

        self.publish(|snap| {
            snap.state = ConnectionState::Connecting;
            snap.last_error = None;
        });

        let mut adapter = self.inner.config.adapter.clone();
        // The manager owns reconnect policy; the driver must not race it
        adapter.auto_reconnect = false;
        let driver = Elm327Driver::new(self.inner.transport.clone(), adapter);

        match driver.connect(None, is_reconnect).await {
            Ok(()) => {
                *self.inner.driver.write() = Some(driver.clone());
                self.spawn_events_task(&driver);
                self.cancel_reconnect_timer();

                let identity = driver.identity();
                let adapter_name = driver.adapter_name();
                self.publish(|snap| {
                    snap.state = ConnectionState::Connected;
                    snap.adapter_name = adapter_name.clone();
                    snap.identity = Some(identity.clone());
                    snap.last_connected_at = Some(Utc::now());
                    snap.last_error = None;
                    snap.reconnect_attempts = 0;
                });
                info!(reconnect = is_reconnect, "Adapter connection established");
                Ok(driver)
            }
            Err(e) => {
                *self.inner.driver.write() = None;
                let message = e.to_string();
                self.publish(|snap| {
                    snap.state = ConnectionState::Disconnected;
                    snap.last_error = Some(message.clone());
                    snap.last_failure_at = Some(Utc::now());
                });
                warn!(reconnect = is_reconnect, error = %e, "Adapter connection failed");
                self.schedule_reconnect();
                Err(ConnectionError::ConnectFailed(e))
            }
        }
    }

    /// Disconnect and stay down. Waits out any in-flight connect, cancels the
    /// reconnect timer and never schedules a new one. Idempotent.
    pub async fn disconnect(&self) {
        let _gate = self.inner.connect_gate.lock().await;
        self.cancel_reconnect_timer();
        self.detach_and_close().await;
        self.publish(|snap| {
            snap.state = ConnectionState::Disconnected;
            snap.last_error = None;
        });
        debug!("Connection manager: disconnected");
    }

    /// Driver if connected, otherwise a fresh connect attempt
    pub async fn ensure_connected(&self) -> Result<Elm327Driver, ConnectionError> {
        match self.driver() {
            Some(driver) => Ok(driver),
            None => self.connect(false).await,
        }
    }

    /// Ensure a connection, then run `f` against the live driver
    pub async fn with_driver<T, F, Fut>(&self, f: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(Elm327Driver) -> Fut,
        Fut: Future<Output = T>,
    {
        let driver = self.ensure_connected().await?;
        Ok(f(driver).await)
    }

    /// Register a snapshot listener; it fires immediately with the current
    /// snapshot
    pub fn add_snapshot_listener(
        &self,
        listener: Box<dyn Fn(&ConnectionSnapshot) + Send + Sync>,
    ) -> Subscription {
        let current = self.snapshot();
        listener(&current);
        self.inner.listeners.add(listener)
    }

    /// Stop background tasks and drop the driver
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.monitor.lock().take() {
            handle.abort();
        }
        self.disconnect().await;
        self.inner.listeners.clear();
    }

    fn publish(&self, mutate: impl FnOnce(&mut ConnectionSnapshot)) {
        {
            let mut snap = self.inner.snapshot.write();
            mutate(&mut snap);
        }
        let merged = self.snapshot();
        self.inner.listeners.notify(&merged);
    }

    async fn detach_and_close(&self) {
        if let Some(handle) = self.inner.events_task.lock().take() {
            handle.abort();
        }
        let driver = self.inner.driver.write().take();
        if let Some(driver) = driver {
            driver.disconnect().await;
        }
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(handle) = self.inner.reconnect.lock().take() {
            handle.abort();
        }
    }

    /// Watch the attached driver: a drop detaches it and arms the reconnect
    /// timer, any other event refreshes the published metrics
    fn spawn_events_task(&self, driver: &Elm327Driver) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = driver.events();
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let manager = ObdConnectionManager { inner };
                match event {
                    DriverEvent::Disconnected => {
                        manager.handle_driver_lost();
                        break;
                    }
                    _ => {
                        // Refresh metrics for listeners
                        manager.publish(|_| {});
                    }
                }
            }
        });
        if let Some(old) = self.inner.events_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn handle_driver_lost(&self) {
        warn!("Adapter connection lost");
        *self.inner.driver.write() = None;
        self.publish(|snap| {
            snap.state = ConnectionState::Disconnected;
            snap.last_error = Some("connection_lost".to_string());
            snap.last_failure_at = Some(Utc::now());
        });
        self.schedule_reconnect();
    }

    /// Arm a single one-shot reconnect, replacing any armed timer. Only runs
    /// when background mode is on; each arming counts as an attempt.
    fn schedule_reconnect(&self) {
        if !self.inner.config.background {
            return;
        }
        let delay = std::time::Duration::from_millis(self.inner.config.reconnect_delay_ms);
        self.publish(|snap| {
            snap.reconnect_attempts += 1;
        });
        info!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let manager = ObdConnectionManager { inner };
            if manager.driver().is_none() {
                let _ = manager.do_connect(false, true).await;
            }
        });
        if let Some(old) = self.inner.reconnect.lock().replace(handle) {
            old.abort();
        }
    }

    fn spawn_monitor(&self) {
        let interval = std::time::Duration::from_millis(self.inner.config.monitor_interval_ms);
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = ObdConnectionManager { inner };
                if manager.driver().is_none() {
                    debug!("Connection monitor: attempting connect");
                    let _ = manager.do_connect(false, false).await;
                }
            }
        });
        if let Some(old) = self.inner.monitor.lock().replace(handle) {
            old.abort();
        }
    }
}

impl SnapshotSource for ObdConnectionManager {
    fn subscribe_snapshots(
        &self,
        listener: Box<dyn Fn(&ConnectionSnapshot) + Send + Sync>,
    ) -> Subscription {
        self.add_snapshot_listener(listener)
    }
}
