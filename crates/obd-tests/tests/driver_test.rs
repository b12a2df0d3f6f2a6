//! Driver integration tests against the mock transport
//!
//! Covers discovery (including the widened rescan), the single-flight command
//! queue, the hung-link watchdog and the driver's own reconnect path.
//!
//! Run with: cargo test -p obd-tests --test driver_test

use std::sync::Arc;
use std::time::Duration;

use obd_driver::transport::mock::{
    MockReply, MockTransport, DEFAULT_ADAPTER_ADDRESS, DEFAULT_ADAPTER_NAME,
};
use obd_driver::{
    AdapterConfig, Advertisement, ConnectPhase, DriverError, Elm327Driver, MockConfig,
};
use obd_tests::init_tracing;
use pretty_assertions::assert_eq;

fn test_config() -> AdapterConfig {
    AdapterConfig {
        command_timeout_ms: 500,
        discovery_timeout_ms: 2_000,
        candidate_settle_ms: 20,
        reset_delay_ms: 1,
        ..Default::default()
    }
}

async fn connected_driver(config: AdapterConfig) -> (Arc<MockTransport>, Elm327Driver) {
    let transport = Arc::new(MockTransport::with_default_adapter(MockConfig::default()));
    let driver = Elm327Driver::new(transport.clone(), config);
    driver.connect(None, false).await.expect("connect failed");
    (transport, driver)
}

#[tokio::test]
async fn test_read_operations_against_simulated_vehicle() {
    init_tracing();
    let (_transport, driver) = connected_driver(test_config()).await;

    let dtcs = driver.read_dtcs().await;
    assert!(dtcs.ok);
    let codes: Vec<String> = dtcs
        .data
        .unwrap()
        .iter()
        .map(|d| d.code.clone())
        .collect();
    assert_eq!(codes, vec!["P0133", "P0244"]);

    let status = driver.read_status().await;
    assert!(status.ok);
    let status = status.data.unwrap();
    assert!(status.mil_on);
    assert_eq!(status.dtc_count, 2);

    let live = driver.read_live_data().await;
    assert!(live.ok);
    let live = live.data.unwrap();
    assert_eq!(live.rpm, Some(1726.0));
    assert_eq!(live.coolant_temp_c, Some(83.0));
    assert_eq!(live.speed_kph, Some(55.0));
    assert_eq!(live.intake_temp_c, Some(50.0));
    assert!((live.throttle_pct.unwrap() - 50.196).abs() < 0.01);
    assert_eq!(live.module_voltage, Some(12.345));

    let voltage = driver.read_voltage().await;
    assert_eq!(voltage.data, Some(12.6));

    let cleared = driver.clear_dtcs().await;
    assert_eq!(cleared.data, Some(true));
}

#[tokio::test]
async fn test_identity_gathered_during_init() {
    init_tracing();
    let (_transport, driver) = connected_driver(test_config()).await;

    let identity = driver.identity();
    assert_eq!(identity.firmware.as_deref(), Some("KB EDIAG V2.1"));
    assert_eq!(identity.voltage, Some(12.6));
    assert_eq!(identity.protocol.as_deref(), Some("A6"));
    assert_eq!(driver.adapter_name().as_deref(), Some(DEFAULT_ADAPTER_NAME));
}

#[tokio::test]
async fn test_error_marker_reported_as_typed_failure() {
    init_tracing();
    let (transport, driver) = connected_driver(test_config()).await;
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();

    link.set_responder(|cmd| match cmd {
        "03" => MockReply::Respond("UNABLE TO CONNECT".to_string()),
        "0101" => MockReply::Respond("NO DATA".to_string()),
        _ => obd_driver::transport::mock::default_responder(cmd),
    });

    let dtcs = driver.read_dtcs().await;
    assert!(!dtcs.ok);
    assert_eq!(dtcs.error.as_deref(), Some("UNABLE TO CONNECT"));

    let status = driver.read_status().await;
    assert!(!status.ok);
}

#[tokio::test]
async fn test_no_data_means_empty_dtc_list() {
    init_tracing();
    let (transport, driver) = connected_driver(test_config()).await;
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();

    link.set_responder(|cmd| match cmd {
        "03" => MockReply::Respond("NO DATA".to_string()),
        _ => obd_driver::transport::mock::default_responder(cmd),
    });

    let dtcs = driver.read_dtcs().await;
    assert!(dtcs.ok);
    assert_eq!(dtcs.data, Some(Vec::new()));
}

#[tokio::test]
async fn test_timed_out_command_does_not_wedge_the_queue() {
    init_tracing();
    let (transport, driver) = connected_driver(test_config()).await;
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();

    link.set_responder(|cmd| match cmd {
        "0101" => MockReply::Silent,
        _ => obd_driver::transport::mock::default_responder(cmd),
    });

    let err = driver.send_command("0101", None).await.unwrap_err();
    assert!(matches!(err, DriverError::CommandTimeout(_)));

    // The queue must be released; the next command goes straight through
    let response = driver.send_command("010D", None).await.unwrap();
    assert_eq!(response, "41 0D 37");

    let metrics = driver.metrics();
    assert_eq!(metrics.timeouts, 1);
    assert!(driver.is_connected());
}

#[tokio::test]
async fn test_concurrent_commands_queue_fifo() {
    init_tracing();
    let transport = Arc::new(MockTransport::with_default_adapter(MockConfig {
        latency_ms: 30,
    }));
    let driver = Elm327Driver::new(transport.clone(), test_config());
    driver.connect(None, false).await.unwrap();

    let (a, b, c) = tokio::join!(
        driver.send_command("010C", None),
        driver.send_command("0105", None),
        driver.send_command("010D", None),
    );
    assert_eq!(a.unwrap(), "41 0C 1A F8");
    assert_eq!(b.unwrap(), "41 05 7B");
    assert_eq!(c.unwrap(), "41 0D 37");

    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
    let commands = link.commands();
    assert_eq!(&commands[commands.len() - 3..], &["010C", "0105", "010D"]);

    let metrics = driver.metrics();
    assert_eq!(metrics.max_queue_depth_observed, 3);
    assert_eq!(metrics.queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_widened_scan_accepts_unmatched_adapter() {
    init_tracing();
    let transport = Arc::new(MockTransport::new(MockConfig::default()));
    // Name matches no adapter keyword, so only the widened phase accepts it.
    // It shows up after the widen point (timeout/2 - 1.5s, here 500ms).
    transport.advertise(
        Advertisement {
            address: "11:22:33:44:55:66".to_string(),
            local_name: Some("CAR-MEDIA".to_string()),
            service_ids: Vec::new(),
            rssi: Some(-72),
        },
        Duration::from_millis(800),
    );
    transport.prepare_link("11:22:33:44:55:66");

    let driver = Elm327Driver::new(transport, test_config());
    driver.connect(None, false).await.unwrap();

    assert_eq!(driver.metrics().last_connect_phase, Some(ConnectPhase::Widened));
}

#[tokio::test(start_paused = true)]
async fn test_connect_fails_when_nothing_advertises() {
    init_tracing();
    // An empty script ends the scan stream without a candidate
    let transport = Arc::new(MockTransport::new(MockConfig::default()));
    let driver = Elm327Driver::new(transport, test_config());

    let err = driver.connect(None, false).await.unwrap_err();
    assert!(matches!(err, DriverError::AdapterNotFound));
    assert!(!driver.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_closes_hung_link() {
    init_tracing();
    let config = AdapterConfig {
        watchdog_interval_ms: 100,
        ..test_config()
    };
    let (transport, driver) = connected_driver(config).await;
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();
    link.set_responder(|_| MockReply::Silent);

    // A caller override can outlive the configured timeout; the watchdog is
    // what reclaims the link in that case.
    let err = driver
        .send_command("0101", Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::ConnectionLost));

    // Give the close monitor a chance to tear the link state down
    tokio::time::sleep(Duration::from_millis(10)).await;

    let metrics = driver.metrics();
    assert_eq!(metrics.watchdog_triggers, 1);
    assert!(!driver.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_driver_reconnects_after_unexpected_close() {
    init_tracing();
    let config = AdapterConfig {
        auto_reconnect: true,
        reconnect_delay_ms: 50,
        ..test_config()
    };
    let (transport, driver) = connected_driver(config).await;
    let link = transport.link(DEFAULT_ADAPTER_ADDRESS).unwrap();

    link.force_close();
    // Let the close monitor detach the stale link before polling, otherwise
    // is_connected still reports the dead link as live
    tokio::time::sleep(Duration::from_millis(10)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if driver.is_connected() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "driver did not reconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let metrics = driver.metrics();
    assert_eq!(metrics.reconnect_attempts, 1);
    assert_eq!(metrics.reconnect_successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_suppresses_reconnect() {
    init_tracing();
    let config = AdapterConfig {
        auto_reconnect: true,
        reconnect_delay_ms: 50,
        ..test_config()
    };
    let (_transport, driver) = connected_driver(config).await;

    driver.disconnect().await;
    assert!(!driver.is_connected());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!driver.is_connected());
    assert_eq!(driver.metrics().reconnect_attempts, 0);

    // Idempotent
    driver.disconnect().await;
}

#[tokio::test]
async fn test_commands_rejected_when_not_connected() {
    init_tracing();
    let transport = Arc::new(MockTransport::new(MockConfig::default()));
    let driver = Elm327Driver::new(transport, test_config());

    let err = driver.send_command("ATRV", None).await.unwrap_err();
    assert!(matches!(err, DriverError::NotConnected));

    let dtcs = driver.read_dtcs().await;
    assert!(!dtcs.ok);
}
