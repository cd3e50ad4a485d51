use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::classify::ErrorCode;
use crate::session::SessionId;
use crate::state::StreamMetrics;

/// Most recent per-session durations kept for inspection. The average is
/// computed over every session regardless.
const MAX_RECORDED_DURATIONS: usize = 1024;

#[derive(Default)]
struct Counters {
    total_sessions: u64,
    successful_sessions: u64,
    error_counts: BTreeMap<ErrorCode, u64>,
    total_retries: u64,
    durations: VecDeque<Duration>,
    duration_sum: Duration,
    timed_sessions: u64,
}

impl Counters {
    fn bump_error(&mut self, code: ErrorCode) {
        *self.error_counts.entry(code).or_insert(0) += 1;
    }
}

/// Aggregates outcomes across concurrently running sessions.
///
/// Construct one per process (or per tenant) and share it through an `Arc`.
#[derive(Default)]
pub struct TelemetryCollector {
    counters: Mutex<Counters>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // counters stay consistent even if a holder panicked mid-update
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts one error outside of session finalization.
    pub fn record_error(&self, code: ErrorCode) {
        self.lock().bump_error(code);
    }

    /// Counts one retry issued by `session_id`.
    pub fn record_retry(&self, session_id: &SessionId) {
        let total = {
            let mut counters = self.lock();
            counters.total_retries += 1;
            counters.total_retries
        };
        debug!(session_id = %session_id, total_retries = total, "retry recorded");
    }

    /// Ingests the final metrics of a session. Called exactly once per
    /// session; also counts every error the session observed.
    pub fn record_session(&self, metrics: &StreamMetrics) {
        let mut counters = self.lock();
        counters.total_sessions += 1;
        if metrics.completion_marker_received {
            counters.successful_sessions += 1;
        }
        for code in &metrics.observed_errors {
            counters.bump_error(*code);
        }
        if let Some(duration) = metrics.duration() {
            counters.duration_sum += duration;
            counters.timed_sessions += 1;
            if counters.durations.len() == MAX_RECORDED_DURATIONS {
                counters.durations.pop_front();
            }
            counters.durations.push_back(duration);
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let counters = self.lock();
        TelemetrySnapshot {
            total_sessions: counters.total_sessions,
            successful_sessions: counters.successful_sessions,
            error_counts: counters.error_counts.clone(),
            total_retries: counters.total_retries,
            durations: counters.durations.iter().copied().collect(),
            average_duration: counters
                .duration_sum
                .checked_div(u32::try_from(counters.timed_sessions).unwrap_or(u32::MAX)),
        }
    }
}

/// Consistent read of the collector's counters.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct TelemetrySnapshot {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub error_counts: BTreeMap<ErrorCode, u64>,
    pub total_retries: u64,
    /// Most recent session durations, oldest first.
    pub durations: Vec<Duration>,
    pub average_duration: Option<Duration>,
}

impl TelemetrySnapshot {
    /// Fraction of sessions that completed successfully; `0.0` before any
    /// session finished.
    pub fn success_rate(&self) -> f64 {
        if self.total_sessions == 0 {
            return 0.0;
        }
        self.successful_sessions as f64 / self.total_sessions as f64
    }

    pub fn error_count(&self, code: ErrorCode) -> u64 {
        self.error_counts.get(&code).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::NormalizedError;
    use crate::state::{EventKind, StreamTracker};
    use std::sync::Arc;

    fn completed_metrics() -> StreamMetrics {
        let mut tracker = StreamTracker::new(SessionId::new("ok"));
        tracker.mark_connected().expect("connect");
        tracker.record_event(EventKind::Data, true).expect("event");
        tracker.mark_completed().expect("complete");
        tracker.into_metrics()
    }

    fn failed_metrics() -> StreamMetrics {
        let mut tracker = StreamTracker::new(SessionId::new("bad"));
        tracker
            .observe_error(&NormalizedError::for_code(ErrorCode::Overloaded, "503"))
            .expect("observe");
        tracker
            .mark_error(NormalizedError::for_code(ErrorCode::Timeout, "timeout"))
            .expect("error");
        tracker.into_metrics()
    }

    #[test]
    fn empty_snapshot_has_zero_success_rate() {
        let snapshot = TelemetryCollector::new().snapshot();
        assert_eq!(snapshot.total_sessions, 0);
        assert_eq!(snapshot.success_rate(), 0.0);
        assert_eq!(snapshot.average_duration, None);
    }

    #[test]
    fn records_sessions_errors_and_retries() {
        let collector = TelemetryCollector::new();
        collector.record_session(&completed_metrics());
        collector.record_retry(&SessionId::new("bad"));
        collector.record_session(&failed_metrics());
        collector.record_error(ErrorCode::Generic);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_sessions, 2);
        assert_eq!(snapshot.successful_sessions, 1);
        assert_eq!(snapshot.total_retries, 1);
        assert_eq!(snapshot.error_count(ErrorCode::Overloaded), 1);
        assert_eq!(snapshot.error_count(ErrorCode::Timeout), 1);
        assert_eq!(snapshot.error_count(ErrorCode::Generic), 1);
        assert_eq!(snapshot.success_rate(), 0.5);
        assert_eq!(snapshot.durations.len(), 2);
        assert!(snapshot.average_duration.is_some());
    }

    #[test]
    fn snapshot_serializes_codes_as_keys() {
        let collector = TelemetryCollector::new();
        collector.record_error(ErrorCode::RateLimited);
        let value = serde_json::to_value(collector.snapshot()).expect("serialize");
        assert_eq!(value["error_counts"]["429"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        let collector = Arc::new(TelemetryCollector::new());
        let mut handles = Vec::new();
        for task in 0..8 {
            let collector = collector.clone();
            handles.push(tokio::spawn(async move {
                let session_id = SessionId::new(format!("task-{task}"));
                for _ in 0..100 {
                    collector.record_retry(&session_id);
                    collector.record_session(&completed_metrics());
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_sessions, 800);
        assert_eq!(snapshot.successful_sessions, 800);
        assert_eq!(snapshot.total_retries, 800);
        assert_eq!(snapshot.durations.len(), 800);
    }
}
