//! Event-store trait for historical summaries
//!
//! The session manager offers every timeline event to an injected store and
//! delegates `historical_summary` to it. Storage backends live outside this
//! workspace; the trait is the only contract. Store failures never disturb a
//! running session.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeline::TimelineEvent;

/// Errors surfaced by an event store. Callers log and continue.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store write failed: {0}")]
    WriteFailed(String),
    #[error("event store query failed: {0}")]
    QueryFailed(String),
}

/// Query window for a historical summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryOptions {
    /// Only events at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Cap on events considered, newest first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Aggregate view over stored events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoricalSummary {
    pub total_events: u64,
    pub successes: u64,
    pub failures: u64,
    /// Event counts keyed by operation label
    pub by_operation: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Sink and query interface for session timeline events
#[async_trait]
pub trait DiagnosticsEventStore: Send + Sync {
    /// Whether the store accepts events at all; a disabled store is skipped
    /// without logging
    fn enabled(&self) -> bool;

    /// Record one event. Called on the session's hot path, so implementations
    /// should enqueue rather than block.
    fn record(&self, event: &TimelineEvent) -> Result<(), StoreError>;

    /// Summarize stored events within the given window
    async fn summarize(&self, options: &SummaryOptions) -> Result<HistoricalSummary, StoreError>;
}

/// Store that drops everything; the default when persistence is not wired up
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventStore;

#[async_trait]
impl DiagnosticsEventStore for NullEventStore {
    fn enabled(&self) -> bool {
        false
    }

    fn record(&self, _event: &TimelineEvent) -> Result<(), StoreError> {
        Ok(())
    }

    async fn summarize(&self, _options: &SummaryOptions) -> Result<HistoricalSummary, StoreError> {
        Ok(HistoricalSummary::default())
    }
}
