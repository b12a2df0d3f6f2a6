//! Driver and transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport selection, tagged for TOML/JSON config files
///
/// The transport is chosen once at startup; the driver never probes for an
/// implementation at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// WiFi ELM327 dongle reachable over TCP
    Tcp(TcpConfig),
    /// In-process simulated adapter for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// TCP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Adapter hostname or IP (WiFi dongles usually sit at 192.168.0.10)
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl TcpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Mock transport settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated round-trip latency per command
    #[serde(default)]
    pub latency_ms: u64,
}

/// Adapter discovery and protocol settings for the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Expected adapter name, matched as a keyword against advertisements
    #[serde(default)]
    pub device_name: Option<String>,
    /// Expected adapter address; an address match wins over everything else
    #[serde(default)]
    pub device_address: Option<String>,
    /// 16-bit service id advertised by the adapter
    #[serde(default)]
    pub service_id: Option<String>,
    /// Preferred write endpoint id; falls back to capability flags
    #[serde(default)]
    pub write_endpoint: Option<String>,
    /// Preferred notify endpoint id; falls back to capability flags
    #[serde(default)]
    pub notify_endpoint: Option<String>,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How long to keep scanning after the first usable candidate, in case a
    /// better one shows up
    #[serde(default = "default_candidate_settle_ms")]
    pub candidate_settle_ms: u64,
    /// Settle delay after ATZ before the next init command
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    /// Schedule a single reconnect attempt when the link drops unexpectedly
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Send AT#2 during init to enable the adapter's CAN-FD mode
    #[serde(default)]
    pub extended_mode: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            device_address: None,
            service_id: None,
            write_endpoint: None,
            notify_endpoint: None,
            discovery_timeout_ms: default_discovery_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            candidate_settle_ms: default_candidate_settle_ms(),
            reset_delay_ms: default_reset_delay_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            auto_reconnect: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            extended_mode: false,
        }
    }
}

impl AdapterConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn candidate_settle(&self) -> Duration {
        Duration::from_millis(self.candidate_settle_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_tcp_port() -> u16 {
    35000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_discovery_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_candidate_settle_ms() -> u64 {
    500
}

fn default_reset_delay_ms() -> u64 {
    1_000
}

fn default_watchdog_interval_ms() -> u64 {
    15_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_config_default_is_mock() {
        assert!(matches!(TransportConfig::default(), TransportConfig::Mock(_)));
    }

    #[test]
    fn test_transport_config_from_toml() {
        let cfg: TransportConfig = toml::from_str(
            r#"
            type = "tcp"
            host = "192.168.0.10"
            "#,
        )
        .unwrap();
        match cfg {
            TransportConfig::Tcp(tcp) => {
                assert_eq!(tcp.host, "192.168.0.10");
                assert_eq!(tcp.port, 35000);
            }
            other => panic!("expected tcp config, got {:?}", other),
        }
    }

    #[test]
    fn test_adapter_config_defaults() {
        let cfg: AdapterConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.discovery_timeout_ms, 10_000);
        assert_eq!(cfg.command_timeout_ms, 5_000);
        assert!(!cfg.auto_reconnect);
    }
}
