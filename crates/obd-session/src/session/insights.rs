//! Derived reliability insights, computed by replaying the timeline

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use obd_core::{DiagnosticOperation, DiagnosticState, TimelineEvent, TimelineEventKind};
use serde::Serialize;

const ERROR_KEY_MAX_LEN: usize = 80;

/// Totals and success rate for one operation
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationInsight {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// `None` until the operation has run at least once
    pub success_rate: Option<f64>,
}

/// One failure, as remembered by the timeline
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub operation: DiagnosticOperation,
    pub error: String,
    pub at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A contiguous stretch spent in one state
#[derive(Debug, Clone, Serialize)]
pub struct StateSegment {
    pub state: DiagnosticState,
    pub entered_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Reliability view over the session's bounded timeline
#[derive(Debug, Clone, Serialize)]
pub struct SessionInsights {
    pub generated_at: DateTime<Utc>,
    pub operations: BTreeMap<String, OperationInsight>,
    pub failures_by_operation: BTreeMap<String, u64>,
    /// Failure counts keyed by normalized error message
    pub failures_by_error: BTreeMap<String, u64>,
    /// Most recent failures, newest first
    pub recent_failures: Vec<FailureRecord>,
    /// Mean gap between consecutive failures; `None` with fewer than two
    pub mean_time_between_failures_ms: Option<u64>,
    /// Mean time from each failure to the next later success, so a streak of
    /// failures weighs in once per failure; `None` when no failure has
    /// recovered yet
    pub mean_time_to_recovery_ms: Option<u64>,
    /// Consecutive failures since the last success
    pub current_failure_streak: u32,
    pub state_segments: Vec<StateSegment>,
    /// Time spent in `Ready` over total observed time; `None` before the
    /// first state change
    pub uptime_ratio: Option<f64>,
}

/// Fold a free-form error message into a stable aggregation key
pub(crate) fn normalize_error(message: &str) -> String {
    let mut key = message.trim().to_lowercase();
    if key.len() > ERROR_KEY_MAX_LEN {
        key.truncate(ERROR_KEY_MAX_LEN);
    }
    key
}

pub(crate) fn compute_insights(
    timeline: &[TimelineEvent],
    operations: &BTreeMap<DiagnosticOperation, (u64, u64)>,
    window_start: Option<DateTime<Utc>>,
    recent_limit: usize,
    now: DateTime<Utc>,
) -> SessionInsights {
    let timeline: Vec<&TimelineEvent> = timeline
        .iter()
        .filter(|e| window_start.map_or(true, |start| e.at >= start))
        .collect();

    // Lifetime counters survive timeline eviction; inside a trailing window
    // the counts come from replaying the filtered events instead
    let counters: BTreeMap<DiagnosticOperation, (u64, u64)> = match window_start {
        None => operations.clone(),
        Some(_) => {
            let mut counters: BTreeMap<DiagnosticOperation, (u64, u64)> = BTreeMap::new();
            for event in &timeline {
                match &event.kind {
                    TimelineEventKind::OperationSucceeded { operation, .. } => {
                        counters.entry(*operation).or_default().0 += 1;
                    }
                    TimelineEventKind::OperationFailed { operation, .. } => {
                        counters.entry(*operation).or_default().1 += 1;
                    }
                    _ => {}
                }
            }
            counters
        }
    };

    let mut op_insights = BTreeMap::new();
    let mut failures_by_operation = BTreeMap::new();
    for (op, (success, failure)) in &counters {
        let total = success + failure;
        op_insights.insert(
            op.label().to_string(),
            OperationInsight {
                total,
                success: *success,
                failure: *failure,
                success_rate: if total > 0 {
                    Some(*success as f64 / total as f64)
                } else {
                    None
                },
            },
        );
        if *failure > 0 {
            failures_by_operation.insert(op.label().to_string(), *failure);
        }
    }

    let mut failures_by_error: BTreeMap<String, u64> = BTreeMap::new();
    let mut failure_times: Vec<DateTime<Utc>> = Vec::new();
    let mut recoveries: Vec<i64> = Vec::new();
    let mut unrecovered: Vec<DateTime<Utc>> = Vec::new();

    for event in &timeline {
        match &event.kind {
            TimelineEventKind::OperationFailed { error, .. } => {
                *failures_by_error.entry(normalize_error(error)).or_insert(0) += 1;
                failure_times.push(event.at);
                unrecovered.push(event.at);
            }
            TimelineEventKind::OperationSucceeded { .. } => {
                // Every outstanding failure recovers at this success
                for failed_at in unrecovered.drain(..) {
                    recoveries.push((event.at - failed_at).num_milliseconds().max(0));
                }
            }
            _ => {}
        }
    }

    let mean_time_between_failures_ms = if failure_times.len() >= 2 {
        let gaps: Vec<i64> = failure_times
            .windows(2)
            .map(|w| (w[1] - w[0]).num_milliseconds().max(0))
            .collect();
        Some((gaps.iter().sum::<i64>() / gaps.len() as i64) as u64)
    } else {
        None
    };

    let mean_time_to_recovery_ms = if recoveries.is_empty() {
        None
    } else {
        Some((recoveries.iter().sum::<i64>() / recoveries.len() as i64) as u64)
    };

    let recent_failures: Vec<FailureRecord> = timeline
        .iter()
        .rev()
        .filter_map(|event| match &event.kind {
            TimelineEventKind::OperationFailed {
                operation,
                duration_ms,
                error,
                ..
            } => Some(FailureRecord {
                operation: *operation,
                error: error.clone(),
                at: event.at,
                duration_ms: *duration_ms,
            }),
            _ => None,
        })
        .take(recent_limit)
        .collect();

    let mut current_failure_streak = 0u32;
    for event in timeline.iter().rev() {
        match &event.kind {
            TimelineEventKind::OperationFailed { .. } => current_failure_streak += 1,
            TimelineEventKind::OperationSucceeded { .. } => break,
            _ => {}
        }
    }

    let changes: Vec<(&TimelineEvent, DiagnosticState)> = timeline
        .iter()
        .filter_map(|event| match &event.kind {
            TimelineEventKind::StateChange { to, .. } => Some((*event, *to)),
            _ => None,
        })
        .collect();

    let mut state_segments = Vec::with_capacity(changes.len());
    for (i, (event, state)) in changes.iter().enumerate() {
        let end = changes
            .get(i + 1)
            .map(|(next, _)| next.at)
            .unwrap_or(now);
        state_segments.push(StateSegment {
            state: *state,
            entered_at: event.at,
            duration_ms: (end - event.at).num_milliseconds().max(0) as u64,
        });
    }

    let uptime_ratio = changes.first().and_then(|(first, _)| {
        let total = (now - first.at).num_milliseconds().max(0) as f64;
        if total <= 0.0 {
            return None;
        }
        let ready: u64 = state_segments
            .iter()
            .filter(|s| s.state == DiagnosticState::Ready)
            .map(|s| s.duration_ms)
            .sum();
        Some(ready as f64 / total)
    });

    SessionInsights {
        generated_at: now,
        operations: op_insights,
        failures_by_operation,
        failures_by_error,
        recent_failures,
        mean_time_between_failures_ms,
        mean_time_to_recovery_ms,
        current_failure_streak,
        state_segments,
        uptime_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use obd_core::{ConnectionState, ConnectionSummary};

    fn event_at(seq: u64, at: DateTime<Utc>, kind: TimelineEventKind) -> TimelineEvent {
        let mut e = TimelineEvent::new(seq, kind);
        e.at = at;
        e
    }

    fn failed(seq: u64, at: DateTime<Utc>, error: &str) -> TimelineEvent {
        event_at(
            seq,
            at,
            TimelineEventKind::OperationFailed {
                operation: DiagnosticOperation::ReadDtc,
                duration_ms: 50,
                attempt: 1,
                attempts_allowed: 3,
                error: error.to_string(),
                summary: None,
                connection: None,
            },
        )
    }

    fn succeeded(seq: u64, at: DateTime<Utc>) -> TimelineEvent {
        event_at(
            seq,
            at,
            TimelineEventKind::OperationSucceeded {
                operation: DiagnosticOperation::ReadDtc,
                duration_ms: 40,
                attempts_allowed: 3,
                summary: None,
                connection: None,
            },
        )
    }

    #[test]
    fn test_normalize_error_lowercases_and_truncates() {
        assert_eq!(normalize_error("  Command TIMED out  "), "command timed out");
        let long = "x".repeat(200);
        assert_eq!(normalize_error(&long).len(), ERROR_KEY_MAX_LEN);
    }

    #[test]
    fn test_mtbf_needs_two_failures() {
        let t0 = Utc::now();
        let one = vec![failed(0, t0, "a")];
        let insights = compute_insights(&one, &BTreeMap::new(), None, 10, t0);
        assert_eq!(insights.mean_time_between_failures_ms, None);

        let two = vec![failed(0, t0, "a"), failed(1, t0 + Duration::seconds(4), "b")];
        let insights =
            compute_insights(&two, &BTreeMap::new(), None, 10, t0 + Duration::seconds(5));
        assert_eq!(insights.mean_time_between_failures_ms, Some(4_000));
    }

    #[test]
    fn test_mttr_measures_failure_to_next_success() {
        let t0 = Utc::now();
        let timeline = vec![
            failed(0, t0, "a"),
            succeeded(1, t0 + Duration::seconds(2)),
            failed(2, t0 + Duration::seconds(10), "b"),
        ];
        let insights =
            compute_insights(&timeline, &BTreeMap::new(), None, 10, t0 + Duration::seconds(11));
        assert_eq!(insights.mean_time_to_recovery_ms, Some(2_000));
        assert_eq!(insights.current_failure_streak, 1);
    }

    #[test]
    fn test_mttr_counts_every_failure_in_a_streak() {
        let t0 = Utc::now();
        let timeline = vec![
            failed(0, t0, "a"),
            failed(1, t0 + Duration::seconds(1), "b"),
            succeeded(2, t0 + Duration::seconds(3)),
        ];
        let insights =
            compute_insights(&timeline, &BTreeMap::new(), None, 10, t0 + Duration::seconds(4));
        // 3000 ms for the first failure, 2000 ms for the second
        assert_eq!(insights.mean_time_to_recovery_ms, Some(2_500));
    }

    #[test]
    fn test_window_restricts_the_replay() {
        let t0 = Utc::now();
        let timeline = vec![
            failed(0, t0, "old fault"),
            succeeded(1, t0 + Duration::seconds(2)),
            failed(2, t0 + Duration::seconds(10), "new fault"),
        ];
        // Lifetime counters cover all three runs
        let mut lifetime = BTreeMap::new();
        lifetime.insert(DiagnosticOperation::ReadDtc, (1u64, 2u64));

        let insights = compute_insights(
            &timeline,
            &lifetime,
            Some(t0 + Duration::seconds(5)),
            10,
            t0 + Duration::seconds(11),
        );
        // Only the late failure is inside the window
        assert_eq!(insights.failures_by_error.get("old fault"), None);
        assert_eq!(insights.failures_by_error["new fault"], 1);
        assert_eq!(insights.recent_failures.len(), 1);
        let read_dtc = &insights.operations["read_dtc"];
        assert_eq!(read_dtc.total, 1);
        assert_eq!(read_dtc.failure, 1);

        // Without a window the lifetime counters are reported as-is
        let all = compute_insights(&timeline, &lifetime, None, 10, t0 + Duration::seconds(11));
        assert_eq!(all.operations["read_dtc"].total, 3);
    }

    #[test]
    fn test_recent_failures_newest_first() {
        let t0 = Utc::now();
        let timeline = vec![
            failed(0, t0, "first"),
            failed(1, t0 + Duration::seconds(1), "second"),
            failed(2, t0 + Duration::seconds(2), "third"),
        ];
        let insights =
            compute_insights(&timeline, &BTreeMap::new(), None, 2, t0 + Duration::seconds(3));
        assert_eq!(insights.recent_failures.len(), 2);
        assert_eq!(insights.recent_failures[0].error, "third");
        assert_eq!(insights.recent_failures[1].error, "second");
        assert_eq!(insights.current_failure_streak, 3);
    }

    #[test]
    fn test_uptime_ratio_counts_ready_time() {
        let t0 = Utc::now();
        let change = |seq, at, to| {
            event_at(
                seq,
                at,
                TimelineEventKind::StateChange {
                    from: DiagnosticState::Disconnected,
                    to,
                    reason: None,
                    reconnect_attempts: 0,
                    connection: Some(ConnectionSummary {
                        state: ConnectionState::Connected,
                        adapter_name: None,
                        last_error: None,
                    }),
                },
            )
        };
        let timeline = vec![
            change(0, t0, DiagnosticState::Ready),
            change(1, t0 + Duration::seconds(8), DiagnosticState::Disconnected),
        ];
        let insights =
            compute_insights(&timeline, &BTreeMap::new(), None, 10, t0 + Duration::seconds(10));
        assert_eq!(insights.state_segments.len(), 2);
        assert_eq!(insights.state_segments[0].duration_ms, 8_000);
        let ratio = insights.uptime_ratio.unwrap();
        assert!((ratio - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_uptime_ratio_none_without_state_changes() {
        let insights = compute_insights(&[], &BTreeMap::new(), None, 10, Utc::now());
        assert_eq!(insights.uptime_ratio, None);
        assert!(insights.state_segments.is_empty());
    }
}
