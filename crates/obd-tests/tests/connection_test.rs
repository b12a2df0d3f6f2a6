//! Connection manager integration tests
//!
//! Covers connect coalescing, snapshot listeners, manual disconnect semantics
//! and the background reconnect policy.
//!
//! Run with: cargo test -p obd-tests --test connection_test

use std::sync::Arc;
use std::time::Duration;

use obd_core::ConnectionState;
use obd_driver::transport::mock::{MockTransport, DEFAULT_ADAPTER_ADDRESS, DEFAULT_ADAPTER_NAME};
use obd_driver::{AdapterConfig, MockConfig};
use obd_session::{ConnectionError, ConnectionManagerConfig, ObdConnectionManager};
use obd_tests::init_tracing;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn adapter_config() -> AdapterConfig {
    AdapterConfig {
        command_timeout_ms: 500,
        discovery_timeout_ms: 2_000,
        candidate_settle_ms: 20,
        reset_delay_ms: 1,
        ..Default::default()
    }
}

fn manager_config(background: bool) -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        adapter: adapter_config(),
        background,
        // Keep the periodic monitor out of the way; reconnect-on-loss is
        // what these tests exercise
        monitor_interval_ms: 600_000,
        reconnect_delay_ms: 50,
    }
}

fn default_manager(background: bool) -> (Arc<MockTransport>, ObdConnectionManager) {
    let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
    let manager = ObdConnectionManager::new(transport.clone(), manager_config(background));
    (transport, manager)
}

#[tokio::test]
async fn test_concurrent_connects_coalesce_into_one_attempt() {
    init_tracing();
    let (transport, manager) = default_manager(false);

    let (a, b) = tokio::join!(manager.connect(false), manager.connect(false));
    assert!(a.is_ok());
    assert!(b.is_ok());

    // One underlying attempt means the adapter saw exactly one reset
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
    let resets = link.commands().iter().filter(|c| *c == "ATZ").count();
    assert_eq!(resets, 1);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.adapter_name.as_deref(), Some(DEFAULT_ADAPTER_NAME));
    assert!(snapshot.identity.is_some());
    assert!(snapshot.metrics.is_some());
}

#[tokio::test]
async fn test_snapshot_listener_replays_then_follows() {
    init_tracing();
    let (_transport, manager) = default_manager(false);

    let states: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let sub = manager.add_snapshot_listener(Box::new(move |snap| {
        sink.lock().push(snap.state);
    }));

    // Immediate replay of the current snapshot
    assert_eq!(states.lock().as_slice(), &[ConnectionState::Disconnected]);

    manager.connect(false).await.unwrap();
    {
        let seen = states.lock();
        assert!(seen.contains(&ConnectionState::Connecting));
        assert_eq!(*seen.last().unwrap(), ConnectionState::Connected);
    }

    sub.unsubscribe();
    let count = states.lock().len();
    manager.disconnect().await;
    assert_eq!(states.lock().len(), count);
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_stays_down() {
    init_tracing();
    let (_transport, manager) = default_manager(true);

    manager.connect(false).await.unwrap();
    manager.disconnect().await;

    assert_eq!(manager.snapshot().state, ConnectionState::Disconnected);
    assert!(manager.driver().is_none());

    // Well past the reconnect delay; a manual disconnect must not rearm it
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.snapshot().state, ConnectionState::Disconnected);
    assert!(manager.driver().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_triggers_background_reconnect() {
    init_tracing();
    let (transport, manager) = default_manager(true);

    manager.connect(false).await.unwrap();
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
    link.force_close();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if manager.snapshot().state == ConnectionState::Connected && manager.driver().is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "manager did not reconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A successful reconnect resets the attempt counter
    assert_eq!(manager.snapshot().reconnect_attempts, 0);
}

#[tokio::test]
async fn test_with_driver_connects_on_demand() {
    init_tracing();
    let (transport, manager) = default_manager(false);
    assert!(manager.driver().is_none());

    // No prior connect; with_driver establishes the connection itself
    let voltage = manager
        .with_driver(|driver| async move { driver.read_voltage().await })
        .await
        .unwrap();
    assert_eq!(voltage.data, Some(12.6));

    // A second call reuses the live driver instead of reconnecting
    let dtcs = manager
        .with_driver(|driver| async move { driver.read_dtcs().await })
        .await
        .unwrap();
    assert!(dtcs.ok);

    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
    let resets = link.commands().iter().filter(|c| *c == "ATZ").count();
    assert_eq!(resets, 1);
}

#[tokio::test(start_paused = true)]
async fn test_with_driver_surfaces_the_connect_failure() {
    init_tracing();
    // Nothing advertises, so the implicit connect fails
    let transport = Arc::new(MockTransport::new(MockConfig::default()));
    let manager = ObdConnectionManager::new(transport, manager_config(false));

    let result = manager
        .with_driver(|driver| async move { driver.read_voltage().await })
        .await;
    assert!(matches!(result, Err(ConnectionError::ConnectFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_publishes_error() {
    init_tracing();
    // Nothing advertises, so discovery times out
    let transport = Arc::new(MockTransport::new(MockConfig::default()));
    let manager = ObdConnectionManager::new(transport, manager_config(false));

    let result = manager.connect(false).await;
    assert!(matches!(result, Err(ConnectionError::ConnectFailed(_))));

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.last_error.is_some());
    assert!(snapshot.last_failure_at.is_some());
}

#[tokio::test]
async fn test_shutdown_is_final() {
    init_tracing();
    let (_transport, manager) = default_manager(false);

    manager.connect(false).await.unwrap();
    manager.shutdown().await;

    assert!(manager.driver().is_none());
    assert_eq!(manager.snapshot().state, ConnectionState::Disconnected);
}
