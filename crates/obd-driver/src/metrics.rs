//! Driver command and connection metrics
//!
//! Updated on every command settlement and connection event. Averages are
//! kept as running totals so a snapshot is a plain clone.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::discovery::ConnectPhase;

/// Snapshot of driver activity
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverMetrics {
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    pub timeouts: u64,
    /// Mean latency over all settled commands
    pub average_latency_ms: f64,
    /// Mean latency over successful commands only
    pub average_success_latency_ms: f64,
    /// Mean latency over failed commands only
    pub average_error_latency_ms: f64,
    pub last_command: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub connection_attempts: u64,
    pub last_connect_phase: Option<ConnectPhase>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub reconnect_failures: u64,
    pub queue_depth: u32,
    pub max_queue_depth_observed: u32,
    pub watchdog_triggers: u64,
    pub last_reconnect_at: Option<DateTime<Utc>>,
    pub last_watchdog_trigger_at: Option<DateTime<Utc>>,
    pub last_command_completed_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    latency_total_ms: f64,
    #[serde(skip)]
    success_latency_total_ms: f64,
    #[serde(skip)]
    error_latency_total_ms: f64,
}

impl DriverMetrics {
    pub(crate) fn record_command_started(&mut self, command: &str) {
        self.total_commands += 1;
        self.last_command = Some(command.to_string());
    }

    pub(crate) fn record_success(&mut self, duration_ms: u64) {
        self.successful_commands += 1;
        self.success_latency_total_ms += duration_ms as f64;
        self.average_success_latency_ms =
            self.success_latency_total_ms / self.successful_commands as f64;
        self.settle(duration_ms);
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, duration_ms: u64, error: &str, timed_out: bool) {
        self.failed_commands += 1;
        if timed_out {
            self.timeouts += 1;
        }
        self.error_latency_total_ms += duration_ms as f64;
        self.average_error_latency_ms = self.error_latency_total_ms / self.failed_commands as f64;
        self.settle(duration_ms);
        self.last_error = Some(error.to_string());
    }

    fn settle(&mut self, duration_ms: u64) {
        let settled = self.successful_commands + self.failed_commands;
        self.latency_total_ms += duration_ms as f64;
        if settled > 0 {
            self.average_latency_ms = self.latency_total_ms / settled as f64;
        }
        self.last_duration_ms = Some(duration_ms);
        self.last_command_completed_at = Some(Utc::now());
    }

    pub(crate) fn record_bytes_sent(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub(crate) fn record_bytes_received(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub(crate) fn set_queue_depth(&mut self, depth: u32) {
        self.queue_depth = depth;
        if depth > self.max_queue_depth_observed {
            self.max_queue_depth_observed = depth;
        }
    }

    pub(crate) fn record_connection_attempt(&mut self, reconnect: bool) {
        self.connection_attempts += 1;
        if reconnect {
            self.reconnect_attempts += 1;
        }
    }

    pub(crate) fn record_connect_outcome(&mut self, reconnect: bool, success: bool) {
        if reconnect {
            if success {
                self.reconnect_successes += 1;
                self.last_reconnect_at = Some(Utc::now());
            } else {
                self.reconnect_failures += 1;
            }
        }
    }

    pub(crate) fn record_watchdog_trigger(&mut self) {
        self.watchdog_triggers += 1;
        self.last_watchdog_trigger_at = Some(Utc::now());
    }
}
