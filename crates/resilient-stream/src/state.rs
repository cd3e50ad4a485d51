use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::classify::{ErrorCode, NormalizedError};
use crate::errors::TransitionError;
use crate::session::SessionId;

/// Lifecycle of one wrapped stream.
///
/// `Completed`, `Error`, and `Terminated` are absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Initializing,
    Connected,
    Receiving,
    Completed,
    Error,
    Terminated,
}

impl StreamState {
    /// Returns true for absorbing states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Terminated)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of a forwarded upstream line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Payload-bearing line.
    Data,
    /// Framing line (comment, `event:`, `id:`, `retry:`).
    Meta,
}

/// Running counters for one session.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StreamMetrics {
    /// Events forwarded during the current attempt.
    pub total_events: u64,
    /// Content-bearing events forwarded during the current attempt.
    pub content_events: u64,
    /// Error events observed across all attempts.
    pub error_events: u64,
    /// Set once any content reached the consumer; never cleared.
    pub content_received: bool,
    /// Upstream sent its own completion marker.
    pub completion_marker_received: bool,
    /// Upstream attempts made so far, including the first.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<NormalizedError>,
    /// Codes of every error observed, in order.
    pub observed_errors: Vec<ErrorCode>,
}

impl StreamMetrics {
    fn new() -> Self {
        Self {
            total_events: 0,
            content_events: 0,
            error_events: 0,
            content_received: false,
            completion_marker_received: false,
            attempts: 1,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
            observed_errors: Vec::new(),
        }
    }

    /// Wall-clock duration of the session, once finalized.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|ended| (ended - self.started_at).to_std().ok())
    }
}

/// Per-session lifecycle state machine and metrics.
#[derive(Clone, Debug)]
pub struct StreamTracker {
    session_id: SessionId,
    state: StreamState,
    metrics: StreamMetrics,
}

impl StreamTracker {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: StreamState::Initializing,
            metrics: StreamMetrics::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    /// Upstream channel was established for the current attempt.
    pub fn mark_connected(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if self.state != StreamState::Initializing {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: StreamState::Connected,
            });
        }
        self.state = StreamState::Connected;
        Ok(())
    }

    /// Counts a forwarded event. The first event moves the stream into
    /// `Receiving`.
    pub fn record_event(&mut self, kind: EventKind, has_content: bool) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if matches!(self.state, StreamState::Initializing | StreamState::Connected) {
            self.state = StreamState::Receiving;
        }
        self.metrics.total_events += 1;
        if has_content {
            self.metrics.content_events += 1;
            self.metrics.content_received = true;
        }
        trace!(session_id = %self.session_id, ?kind, has_content, total = self.metrics.total_events, "recorded event");
        Ok(())
    }

    /// Records an error that was surfaced but did not end the session
    /// (a retry follows).
    pub fn observe_error(&mut self, err: &NormalizedError) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.note_error(err);
        Ok(())
    }

    /// Upstream sent its completion marker.
    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if !matches!(self.state, StreamState::Receiving | StreamState::Connected) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: StreamState::Completed,
            });
        }
        self.metrics.completion_marker_received = true;
        self.finish(StreamState::Completed);
        Ok(())
    }

    /// Session ends with a classified error.
    pub fn mark_error(&mut self, err: NormalizedError) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.note_error(&err);
        self.finish(StreamState::Error);
        Ok(())
    }

    /// Upstream was exhausted without a completion marker or error payload.
    pub fn mark_terminated(&mut self, err: NormalizedError) -> Result<(), TransitionError> {
        self.ensure_open()?;
        if !matches!(self.state, StreamState::Receiving | StreamState::Connected) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to: StreamState::Terminated,
            });
        }
        self.note_error(&err);
        self.finish(StreamState::Terminated);
        Ok(())
    }

    /// Ends the session on the error last passed to `observe_error`,
    /// without counting it again.
    pub fn settle_observed_error(&mut self, terminated: bool) -> Result<(), TransitionError> {
        self.ensure_open()?;
        let to = if terminated {
            StreamState::Terminated
        } else {
            StreamState::Error
        };
        let channel_open = matches!(self.state, StreamState::Receiving | StreamState::Connected);
        if self.metrics.last_error.is_none() || (terminated && !channel_open) {
            return Err(TransitionError::Invalid {
                from: self.state,
                to,
            });
        }
        self.finish(to);
        Ok(())
    }

    /// Prepares the tracker for a fresh upstream attempt.
    ///
    /// Per-attempt counters and the completion flag are cleared; the sticky
    /// content flag, error history and start time are kept.
    pub fn reset_for_retry(&mut self) -> Result<(), TransitionError> {
        self.ensure_open()?;
        self.state = StreamState::Initializing;
        self.metrics.total_events = 0;
        self.metrics.content_events = 0;
        self.metrics.completion_marker_received = false;
        self.metrics.attempts = self.metrics.attempts.saturating_add(1);
        Ok(())
    }

    /// Structured summary for logging. Never fails.
    pub fn to_log_record(&self) -> serde_json::Value {
        let m = &self.metrics;
        serde_json::json!({
            "session_id": self.session_id.as_str(),
            "state": self.state.as_str(),
            "attempts": m.attempts,
            "total_events": m.total_events,
            "content_events": m.content_events,
            "error_events": m.error_events,
            "content_received": m.content_received,
            "completion_marker_received": m.completion_marker_received,
            "started_at": m.started_at.to_rfc3339(),
            "ended_at": m.ended_at.map(|t| t.to_rfc3339()),
            "duration_ms": m.duration().map(|d| d.as_millis() as u64),
            "last_error_code": m.last_error.as_ref().map(|e| e.code.as_u16()),
            "last_error": m.last_error.as_ref().map(|e| e.technical_message.as_str()),
        })
    }

    pub(crate) fn into_metrics(self) -> StreamMetrics {
        self.metrics
    }

    fn ensure_open(&self) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::AlreadyTerminal { state: self.state });
        }
        Ok(())
    }

    fn note_error(&mut self, err: &NormalizedError) {
        self.metrics.error_events += 1;
        self.metrics.observed_errors.push(err.code);
        self.metrics.last_error = Some(err.clone());
    }

    fn finish(&mut self, state: StreamState) {
        self.state = state;
        if self.metrics.ended_at.is_none() {
            self.metrics.ended_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StreamTracker {
        StreamTracker::new(SessionId::new("s-1"))
    }

    #[test]
    fn first_event_moves_to_receiving_and_sets_sticky_flag() {
        let mut t = tracker();
        t.mark_connected().expect("connect");
        t.record_event(EventKind::Meta, false).expect("meta");
        assert_eq!(t.state(), StreamState::Receiving);
        assert!(!t.metrics().content_received);

        t.record_event(EventKind::Data, true).expect("data");
        assert_eq!(t.metrics().total_events, 2);
        assert_eq!(t.metrics().content_events, 1);
        assert!(t.metrics().content_received);
    }

    #[test]
    fn zero_content_success_from_connected() {
        let mut t = tracker();
        t.mark_connected().expect("connect");
        t.mark_completed().expect("complete");
        assert_eq!(t.state(), StreamState::Completed);
        assert!(t.metrics().completion_marker_received);
        assert!(t.metrics().ended_at.is_some());
    }

    #[test]
    fn completion_before_connect_is_rejected() {
        let mut t = tracker();
        assert_eq!(
            t.mark_completed(),
            Err(TransitionError::Invalid {
                from: StreamState::Initializing,
                to: StreamState::Completed,
            })
        );
        assert_eq!(t.state(), StreamState::Initializing);
    }

    #[test]
    fn terminal_transitions_cannot_repeat() {
        let mut t = tracker();
        t.mark_error(NormalizedError::for_code(ErrorCode::Generic, "boom"))
            .expect("error");
        let ended = t.metrics().ended_at;

        assert_eq!(
            t.mark_error(NormalizedError::for_code(ErrorCode::Generic, "again")),
            Err(TransitionError::AlreadyTerminal {
                state: StreamState::Error
            })
        );
        assert!(t.mark_completed().is_err());
        assert!(t.mark_terminated(NormalizedError::terminated()).is_err());
        assert!(t.record_event(EventKind::Data, true).is_err());
        assert!(t.reset_for_retry().is_err());
        assert_eq!(t.metrics().ended_at, ended);
        assert_eq!(t.metrics().error_events, 1);
    }

    #[test]
    fn terminated_requires_an_open_channel() {
        let mut t = tracker();
        assert!(t.mark_terminated(NormalizedError::terminated()).is_err());
        t.mark_connected().expect("connect");
        t.record_event(EventKind::Data, true).expect("data");
        t.mark_terminated(NormalizedError::terminated())
            .expect("terminate");
        assert_eq!(t.state(), StreamState::Terminated);
        assert_eq!(t.metrics().observed_errors, vec![ErrorCode::Terminated]);
    }

    #[test]
    fn settling_an_observed_error_counts_it_once() {
        let mut t = tracker();
        assert!(t.settle_observed_error(false).is_err());

        t.mark_connected().expect("connect");
        t.observe_error(&NormalizedError::terminated())
            .expect("observe");
        t.settle_observed_error(true).expect("settle");
        assert_eq!(t.state(), StreamState::Terminated);
        assert_eq!(t.metrics().error_events, 1);
        assert_eq!(t.metrics().observed_errors, vec![ErrorCode::Terminated]);
        assert!(t.metrics().ended_at.is_some());
    }

    #[test]
    fn reset_for_retry_keeps_sticky_flag_and_errors() {
        let mut t = tracker();
        t.mark_connected().expect("connect");
        t.record_event(EventKind::Data, true).expect("data");
        t.observe_error(&NormalizedError::for_code(ErrorCode::Overloaded, "503"))
            .expect("observe");
        t.reset_for_retry().expect("reset");

        let m = t.metrics();
        assert_eq!(t.state(), StreamState::Initializing);
        assert_eq!(m.total_events, 0);
        assert_eq!(m.content_events, 0);
        assert!(m.content_received);
        assert_eq!(m.error_events, 1);
        assert_eq!(m.attempts, 2);
    }

    #[test]
    fn log_record_is_available_in_every_state() {
        let mut t = tracker();
        assert_eq!(t.to_log_record()["state"], "initializing");
        t.mark_error(NormalizedError::for_code(ErrorCode::Timeout, "timeout"))
            .expect("error");
        let record = t.to_log_record();
        assert_eq!(record["state"], "error");
        assert_eq!(record["last_error_code"], 504);
        assert_eq!(record["session_id"], "s-1");
    }
}
