//! Diagnostic session manager

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use obd_core::{
    ConnectionState, ConnectionSummary, DiagnosticOperation, DiagnosticState,
    DiagnosticsEventStore, HistoricalSummary, SummaryOptions, TaskOutcome, TimelineEvent,
    TimelineEventKind,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::insights::{self, SessionInsights};
use super::{
    ActiveOperation, OperationMetrics, OperationOptions, SessionConfig, SessionLastError,
    SessionMetrics, SessionStatus, StateTransition,
};
use crate::connection::{ConnectionSnapshot, SnapshotSource};
use crate::error::SessionError;
use crate::listeners::{ListenerRegistry, Subscription};

const TIMELINE_CAPACITY: usize = 64;
const HISTORY_CAPACITY: usize = 32;
const DEFAULT_RECENT_FAILURES: usize = 10;

#[derive(Debug, Default, Clone)]
struct OpStats {
    success: u64,
    failure: u64,
    total_duration_ms: u64,
}

struct SessionCore {
    state: DiagnosticState,
    since: chrono::DateTime<Utc>,
    active: Option<ActiveOperation>,
    last_error: Option<SessionLastError>,
    history: VecDeque<StateTransition>,
    timeline: VecDeque<TimelineEvent>,
    seq: u64,
    stats: BTreeMap<DiagnosticOperation, OpStats>,
    connection: Option<ConnectionSnapshot>,
    reconnect_attempts: u32,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            state: DiagnosticState::Disconnected,
            since: Utc::now(),
            active: None,
            last_error: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            timeline: VecDeque::with_capacity(TIMELINE_CAPACITY),
            seq: 0,
            stats: BTreeMap::new(),
            connection: None,
            reconnect_attempts: 0,
        }
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |c| c.state == ConnectionState::Connected)
    }

    fn connection_summary(&self) -> Option<ConnectionSummary> {
        self.connection.as_ref().map(|c| ConnectionSummary {
            state: c.state,
            adapter_name: c.adapter_name.clone(),
            last_error: c.last_error.clone(),
        })
    }

    fn record_event(&mut self, kind: TimelineEventKind) -> TimelineEvent {
        let event = TimelineEvent::new(self.seq, kind);
        self.seq += 1;
        self.timeline.push_back(event.clone());
        while self.timeline.len() > TIMELINE_CAPACITY {
            self.timeline.pop_front();
        }
        event
    }

    /// Move to `to`, recording history and a state-change event. A no-op
    /// when the state is unchanged and no reason is given.
    fn transition(&mut self, to: DiagnosticState, reason: Option<String>) -> Option<TimelineEvent> {
        if to == self.state && reason.is_none() {
            return None;
        }
        let from = self.state;
        self.history.push_back(StateTransition {
            from,
            to,
            reason: reason.clone(),
            at: Utc::now(),
        });
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
        let event = self.record_event(TimelineEventKind::StateChange {
            from,
            to,
            reason,
            reconnect_attempts: self.reconnect_attempts,
            connection: self.connection_summary(),
        });
        self.state = to;
        self.since = event.at;
        Some(event)
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            since: self.since,
            active_operation: self.active.clone(),
            last_error: self.last_error.clone(),
            connection: self.connection_summary(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

struct SessionInner {
    config: SessionConfig,
    store: Arc<dyn DiagnosticsEventStore>,
    core: Mutex<SessionCore>,
    listeners: ListenerRegistry<SessionStatus>,
}

impl SessionInner {
    /// Offer events to the store and push the status to listeners, both
    /// outside the core lock
    fn after_mutation(&self, events: Vec<TimelineEvent>, status: Option<SessionStatus>) {
        for event in &events {
            self.persist(event);
        }
        if let Some(status) = status {
            self.listeners.notify(&status);
        }
    }

    fn persist(&self, event: &TimelineEvent) {
        if !self.store.enabled() {
            return;
        }
        if let Err(e) = self.store.record(event) {
            debug!(error = %e, "Event store rejected event");
        }
    }

    fn apply_snapshot(&self, snap: &ConnectionSnapshot) {
        let (events, status) = {
            let mut core = self.core.lock();
            core.connection = Some(snap.clone());
            core.reconnect_attempts = snap.reconnect_attempts;

            let event = match snap.state {
                ConnectionState::Connected => {
                    if matches!(
                        core.state,
                        DiagnosticState::Disconnected
                            | DiagnosticState::Connecting
                            | DiagnosticState::Error
                    ) {
                        core.transition(
                            DiagnosticState::Ready,
                            Some("connection_ready".to_string()),
                        )
                    } else {
                        None
                    }
                }
                ConnectionState::Connecting => {
                    if !core.state.is_busy() && core.state != DiagnosticState::Connecting {
                        core.transition(
                            DiagnosticState::Connecting,
                            Some("connection_connecting".to_string()),
                        )
                    } else {
                        None
                    }
                }
                ConnectionState::Disconnected => {
                    core.active = None;
                    if core.state != DiagnosticState::Disconnected {
                        core.transition(
                            DiagnosticState::Disconnected,
                            Some("connection_lost".to_string()),
                        )
                    } else {
                        None
                    }
                }
            };
            let status = event.as_ref().map(|_| core.status());
            (event.into_iter().collect::<Vec<_>>(), status)
        };
        self.after_mutation(events, status);
    }
}

/// Session manager: state machine, retrying operation runner, timeline,
/// metrics and insights
pub struct DiagnosticSessionManager {
    inner: Arc<SessionInner>,
    connection_sub: Mutex<Option<Subscription>>,
}

impl DiagnosticSessionManager {
    /// Build a session manager fed by `source`. The source's immediate
    /// listener replay seeds the initial connection view.
    pub fn new(
        source: &dyn SnapshotSource,
        store: Arc<dyn DiagnosticsEventStore>,
        config: SessionConfig,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            config,
            store,
            core: Mutex::new(SessionCore::new()),
            listeners: ListenerRegistry::new(),
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        let subscription = source.subscribe_snapshots(Box::new(move |snap| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_snapshot(snap);
            }
        }));

        Self {
            inner,
            connection_sub: Mutex::new(Some(subscription)),
        }
    }

    pub fn state(&self) -> DiagnosticState {
        self.inner.core.lock().state
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.core.lock().status()
    }

    /// Bounded transition history, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.core.lock().history.iter().cloned().collect()
    }

    /// Run a diagnostic task under the session.
    ///
    /// A task that resolves with a typed failure (`TaskOutcome::failure`) is
    /// recorded once and handed back without retrying; a task that raises is
    /// retried with linear backoff (`base_delay * attempt`) and, once
    /// attempts are exhausted, the last error is re-raised as
    /// [`SessionError::Exhausted`]. Rejected up front when not connected.
    pub async fn run_operation<T, F, Fut>(
        &self,
        operation: DiagnosticOperation,
        mut task: F,
        options: OperationOptions<T>,
    ) -> Result<T, SessionError>
    where
        T: TaskOutcome,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.inner.config.max_attempts)
            .max(1);
        let base_delay = Duration::from_millis(
            options
                .base_delay_ms
                .unwrap_or(self.inner.config.base_delay_ms),
        );

        {
            let mut core = self.inner.core.lock();
            if !core.is_connected() {
                return Err(SessionError::NotConnected);
            }
            core.active = Some(ActiveOperation {
                operation,
                started_at: Utc::now(),
                attempt: 1,
                max_attempts,
            });
            let connection = options
                .capture_snapshot
                .then(|| core.connection_summary())
                .flatten();
            let started_event = core.record_event(TimelineEventKind::OperationStarted {
                operation,
                attempt: 1,
                attempts_allowed: max_attempts,
                connection,
            });
            let busy = if operation == DiagnosticOperation::ClearDtc {
                DiagnosticState::Clearing
            } else {
                DiagnosticState::Reading
            };
            let transition_event = core.transition(busy, Some(format!("{operation}_started")));
            let status = core.status();
            let events: Vec<TimelineEvent> = std::iter::once(started_event)
                .chain(transition_event)
                .collect();
            drop(core);
            self.inner.after_mutation(events, Some(status));
        }

        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 1;
        loop {
            match task().await {
                Ok(value) => {
                    if let Some(message) = value.failure() {
                        let message = message.to_string();
                        let summary = options.summarize_failure.as_ref().map(|f| f(&value));
                        self.register_failure(
                            operation,
                            started.elapsed(),
                            attempt,
                            max_attempts,
                            &message,
                            summary,
                            options.capture_snapshot,
                        );
                        return Ok(value);
                    }
                    let summary = options.summarize_success.as_ref().map(|f| f(&value));
                    self.finish_success(
                        operation,
                        started.elapsed(),
                        max_attempts,
                        summary,
                        options.capture_snapshot,
                    );
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= max_attempts {
                        let message = error.to_string();
                        self.register_failure(
                            operation,
                            started.elapsed(),
                            attempt,
                            max_attempts,
                            &message,
                            None,
                            options.capture_snapshot,
                        );
                        return Err(SessionError::Exhausted {
                            operation,
                            attempts: attempt,
                            source: error,
                        });
                    }
                    warn!(
                        operation = %operation,
                        attempt,
                        error = %error,
                        "Operation attempt failed, retrying"
                    );
                    {
                        let mut core = self.inner.core.lock();
                        if let Some(active) = core.active.as_mut() {
                            active.attempt = attempt + 1;
                        }
                        let status = core.status();
                        drop(core);
                        self.inner.listeners.notify(&status);
                    }
                    tokio::time::sleep(base_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    fn finish_success(
        &self,
        operation: DiagnosticOperation,
        duration: Duration,
        attempts_allowed: u32,
        summary: Option<serde_json::Value>,
        capture_snapshot: bool,
    ) {
        let duration_ms = duration.as_millis() as u64;
        let (events, status) = {
            let mut core = self.inner.core.lock();
            let stats = core.stats.entry(operation).or_default();
            stats.success += 1;
            stats.total_duration_ms += duration_ms;
            let connection = capture_snapshot.then(|| core.connection_summary()).flatten();
            let event = core.record_event(TimelineEventKind::OperationSucceeded {
                operation,
                duration_ms,
                attempts_allowed,
                summary,
                connection,
            });
            core.active = None;
            core.last_error = None;
            let transition = core.transition(DiagnosticState::Ready, Some(format!("{operation}_ok")));
            let status = core.status();
            (
                std::iter::once(event).chain(transition).collect::<Vec<_>>(),
                status,
            )
        };
        info!(operation = %operation, duration_ms, "Operation succeeded");
        self.inner.after_mutation(events, Some(status));
    }

    fn register_failure(
        &self,
        operation: DiagnosticOperation,
        duration: Duration,
        attempt: u32,
        attempts_allowed: u32,
        message: &str,
        summary: Option<serde_json::Value>,
        capture_snapshot: bool,
    ) {
        let duration_ms = duration.as_millis() as u64;
        let (events, status) = {
            let mut core = self.inner.core.lock();
            let stats = core.stats.entry(operation).or_default();
            stats.failure += 1;
            let connection = capture_snapshot.then(|| core.connection_summary()).flatten();
            let event = core.record_event(TimelineEventKind::OperationFailed {
                operation,
                duration_ms,
                attempt,
                attempts_allowed,
                error: message.to_string(),
                summary,
                connection,
            });
            core.last_error = Some(SessionLastError {
                message: message.to_string(),
                at: Utc::now(),
                operation: Some(operation),
            });
            core.active = None;
            let transition =
                core.transition(DiagnosticState::Error, Some(format!("{operation}_failed")));
            let status = core.status();
            (
                std::iter::once(event).chain(transition).collect::<Vec<_>>(),
                status,
            )
        };
        warn!(operation = %operation, attempt, error = message, "Operation failed");
        self.inner.after_mutation(events, Some(status));
    }

    /// Clear a recorded error and return to ready. Only valid in the error
    /// state.
    pub fn acknowledge_error(&self) -> bool {
        let (events, status) = {
            let mut core = self.inner.core.lock();
            if core.state != DiagnosticState::Error {
                return false;
            }
            core.last_error = None;
            let transition = core.transition(
                DiagnosticState::Ready,
                Some("error_acknowledged".to_string()),
            );
            (transition.into_iter().collect::<Vec<_>>(), core.status())
        };
        self.inner.after_mutation(events, Some(status));
        true
    }

    /// Timeline events, oldest first.
    ///
    /// With `newer_than_id` set to a known event id, only events after it are
    /// returned; an unknown id falls back to the newest `limit` events. The
    /// limit is clamped to the buffer capacity.
    pub fn timeline(&self, newer_than_id: Option<&str>, limit: Option<usize>) -> Vec<TimelineEvent> {
        let limit = limit.unwrap_or(TIMELINE_CAPACITY).clamp(1, TIMELINE_CAPACITY);
        let core = self.inner.core.lock();
        if let Some(id) = newer_than_id {
            if let Some(pos) = core.timeline.iter().position(|e| e.id == id) {
                return core
                    .timeline
                    .iter()
                    .skip(pos + 1)
                    .take(limit)
                    .cloned()
                    .collect();
            }
        }
        let skip = core.timeline.len().saturating_sub(limit);
        core.timeline.iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> SessionMetrics {
        let core = self.inner.core.lock();
        let mut metrics = SessionMetrics::default();
        let mut total_success = 0u64;
        let mut total_failure = 0u64;
        let mut total_duration = 0u64;
        for (op, stats) in &core.stats {
            total_success += stats.success;
            total_failure += stats.failure;
            total_duration += stats.total_duration_ms;
            metrics.operations.insert(
                op.label().to_string(),
                OperationMetrics {
                    success: stats.success,
                    failure: stats.failure,
                    total: stats.success + stats.failure,
                    average_duration_ms: if stats.success > 0 {
                        stats.total_duration_ms / stats.success
                    } else {
                        0
                    },
                },
            );
        }
        metrics.totals = OperationMetrics {
            success: total_success,
            failure: total_failure,
            total: total_success + total_failure,
            average_duration_ms: if total_success > 0 {
                total_duration / total_success
            } else {
                0
            },
        };
        metrics
    }

    /// Reliability insights derived from the in-memory timeline.
    ///
    /// With `window` set, only events inside the trailing window are
    /// replayed and the per-operation counts are derived from that replay
    /// instead of the lifetime counters.
    pub fn insights(
        &self,
        window: Option<Duration>,
        recent_limit: Option<usize>,
    ) -> SessionInsights {
        let core = self.inner.core.lock();
        let timeline: Vec<TimelineEvent> = core.timeline.iter().cloned().collect();
        let stats: BTreeMap<DiagnosticOperation, (u64, u64)> = core
            .stats
            .iter()
            .map(|(op, s)| (*op, (s.success, s.failure)))
            .collect();
        drop(core);
        let now = Utc::now();
        let window_start =
            window.map(|w| now - chrono::Duration::milliseconds(w.as_millis() as i64));
        insights::compute_insights(
            &timeline,
            &stats,
            window_start,
            recent_limit.unwrap_or(DEFAULT_RECENT_FAILURES),
            now,
        )
    }

    /// Long-horizon summary from the injected event store. `None` when the
    /// store is disabled or the query fails.
    pub async fn historical_summary(&self, options: &SummaryOptions) -> Option<HistoricalSummary> {
        if !self.inner.store.enabled() {
            return None;
        }
        match self.inner.store.summarize(options).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Event store summary failed");
                None
            }
        }
    }

    /// Register a status listener; it fires immediately with the current
    /// status
    pub fn add_listener(
        &self,
        listener: Box<dyn Fn(&SessionStatus) + Send + Sync>,
    ) -> Subscription {
        let current = self.status();
        listener(&current);
        self.inner.listeners.add(listener)
    }

    /// Detach from the connection manager and drop all listeners
    pub fn dispose(&self) {
        if let Some(sub) = self.connection_sub.lock().take() {
            sub.unsubscribe();
        }
        self.inner.listeners.clear();
    }
}

impl Drop for DiagnosticSessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
