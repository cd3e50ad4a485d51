use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::classify::{ErrorCode, NormalizedError, RawSignal, normalize};
use crate::config::WrapperConfig;
use crate::errors::{TransitionError, UpstreamError, WrapperError};
use crate::retry::{RetryController, RetryPolicy, RetryState};
use crate::session::{AttemptRequest, SessionId, SessionReport, StreamRequest};
use crate::state::{EventKind, StreamTracker};
use crate::stream::{StreamEvent, UpstreamLine, parse_line};
use crate::telemetry::TelemetryCollector;
use crate::upstream::{LineStream, Upstream};

/// Handle used to request cancellation of a wrapped stream.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// Observed at the next line read, send, or retry sleep. No further
    /// events are delivered after that point.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

pub(crate) struct WrapperInner {
    upstream: Arc<dyn Upstream>,
    config: WrapperConfig,
    controller: RetryController,
    telemetry: Arc<TelemetryCollector>,
}

/// Wraps one upstream integration so every stream it hands out ends with
/// exactly one completion marker.
///
/// Cheap to clone; all clones share the upstream and telemetry collector.
#[derive(Clone)]
pub struct StreamWrapper {
    inner: Arc<WrapperInner>,
}

impl StreamWrapper {
    /// Starts a builder for the given upstream.
    pub fn builder(upstream: Arc<dyn Upstream>) -> StreamWrapperBuilder {
        StreamWrapperBuilder {
            upstream,
            config: WrapperConfig::default(),
            telemetry: None,
        }
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.inner.config
    }

    /// Collector that receives the final metrics of every session.
    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.inner.telemetry
    }

    /// Validates the request and spawns the session task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(&self, request: StreamRequest) -> Result<WrappedStream, WrapperError> {
        if request.session_id.as_str().trim().is_empty() {
            return Err(WrapperError::Validation(
                "session id must not be empty".into(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.inner.config.stream_buffer_capacity);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);
        let session_id = request.session_id.clone();

        let driver = SessionDriver {
            inner: self.inner.clone(),
            tracker: StreamTracker::new(request.session_id.clone()),
            retry_state: RetryState::default(),
            retries: 0,
            request,
            tx,
            abort_rx,
        };
        tokio::spawn(async move {
            let report = driver.drive().await;
            let _ = final_tx.send(report);
        });

        Ok(WrappedStream {
            session_id,
            rx,
            final_rx,
            abort_handle: AbortHandle { tx: abort_tx },
            saw_terminal: false,
        })
    }
}

/// Builder for a `StreamWrapper`.
pub struct StreamWrapperBuilder {
    upstream: Arc<dyn Upstream>,
    config: WrapperConfig,
    telemetry: Option<Arc<TelemetryCollector>>,
}

impl StreamWrapperBuilder {
    /// Replaces the whole wrapper configuration.
    pub fn config(mut self, config: WrapperConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides only the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Shares an existing collector instead of creating a private one.
    pub fn telemetry(mut self, telemetry: Arc<TelemetryCollector>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates the configuration and builds the wrapper.
    pub fn build(self) -> Result<StreamWrapper, WrapperError> {
        self.config.validate()?;
        Ok(StreamWrapper {
            inner: Arc::new(WrapperInner {
                upstream: self.upstream,
                controller: RetryController::new(self.config.retry.clone()),
                config: self.config,
                telemetry: self.telemetry.unwrap_or_default(),
            }),
        })
    }
}

/// Consumer side of a wrapped stream.
///
/// Use `next_event()` to consume events as they arrive and `finish()` to
/// obtain the session report after the completion marker. Dropping the
/// handle cancels the session.
pub struct WrappedStream {
    session_id: SessionId,
    rx: mpsc::Receiver<StreamEvent>,
    final_rx: oneshot::Receiver<SessionReport>,
    abort_handle: AbortHandle,
    saw_terminal: bool,
}

impl WrappedStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Returns a handle that can cancel the stream.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for and returns the next event.
    ///
    /// Returns `None` once the stream is over (after `Done`, or after
    /// cancellation).
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if let Some(StreamEvent::Done { .. }) = &event {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains the stream (if needed) and returns the session report.
    pub async fn finish(mut self) -> Result<SessionReport, WrapperError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(StreamEvent::Done { .. }) => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        self.final_rx.await.map_err(|_| {
            WrapperError::protocol_msg(format!(
                "session {} ended without a report",
                self.session_id
            ))
        })
    }

    /// Collects every remaining event together with the session report.
    pub async fn collect_events(mut self) -> Result<(Vec<StreamEvent>, SessionReport), WrapperError> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        let report = self.finish().await?;
        Ok((events, report))
    }
}

enum AttemptOutcome {
    Completed,
    Failed {
        error: NormalizedError,
        terminated: bool,
    },
    Cancelled,
}

struct SessionDriver {
    inner: Arc<WrapperInner>,
    request: StreamRequest,
    tracker: StreamTracker,
    retry_state: RetryState,
    retries: u32,
    tx: mpsc::Sender<StreamEvent>,
    abort_rx: watch::Receiver<bool>,
}

impl SessionDriver {
    async fn drive(mut self) -> SessionReport {
        let session_id = self.request.session_id.clone();
        info!(session_id = %session_id, upstream = self.inner.upstream.name(), "wrapped stream started");

        loop {
            match self.attempt().await {
                AttemptOutcome::Completed => {
                    self.emit(StreamEvent::Done { synthetic: false }).await;
                    break;
                }
                AttemptOutcome::Cancelled => {
                    self.cancel();
                    break;
                }
                AttemptOutcome::Failed { error, terminated } => {
                    warn!(
                        session_id = %session_id,
                        attempt = self.retry_state.attempt_number,
                        code = %error.code,
                        transient = error.is_transient,
                        "{}",
                        error.technical_message
                    );
                    // counted before the send; a cancelled send must still reach telemetry
                    let observed = self.tracker.observe_error(&error);
                    self.check(observed);
                    if !self.emit(StreamEvent::Error { error: error.clone() }).await {
                        self.cancel();
                        break;
                    }
                    if !self.retry_allowed(&error) {
                        let settled = self.tracker.settle_observed_error(terminated);
                        self.check(settled);
                        self.emit(StreamEvent::Done { synthetic: true }).await;
                        break;
                    }

                    self.inner.telemetry.record_retry(&session_id);
                    self.inner.controller.record_attempt(&mut self.retry_state);
                    self.retries += 1;
                    let delay = retry_delay(
                        &self.inner.config,
                        &self.inner.controller,
                        &self.retry_state,
                        &error,
                    );
                    info!(session_id = %session_id, retry = self.retry_state.attempt_number, delay_ms = delay.as_millis() as u64, "retrying upstream");

                    if !self.sleep(delay).await {
                        self.cancel();
                        break;
                    }
                    let reset = self.tracker.reset_for_retry();
                    self.check(reset);
                }
            }
        }

        self.finalize()
    }

    async fn attempt(&mut self) -> AttemptOutcome {
        let request = AttemptRequest {
            session_id: self.request.session_id.clone(),
            attempt: self.retry_state.attempt_number,
            body: self.request.body.clone(),
        };
        let connect_timeout = self.inner.config.connect_timeout;
        let opened = tokio::select! {
            biased;
            _ = consumer_gone(&mut self.abort_rx, &self.tx) => return AttemptOutcome::Cancelled,
            opened = tokio::time::timeout(connect_timeout, self.inner.upstream.open(request)) => opened,
        };
        let mut lines: LineStream = match opened {
            Ok(Ok(lines)) => lines,
            Ok(Err(err)) => return failed(normalize(&err.signal())),
            Err(_) => {
                return failed(normalize(&RawSignal::text(format!(
                    "upstream connect timeout after {connect_timeout:?}"
                ))));
            }
        };
        let connected = self.tracker.mark_connected();
        self.check(connected);
        debug!(session_id = %self.request.session_id, attempt = self.retry_state.attempt_number, "upstream connected");

        let read_timeout = self.inner.config.read_timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = consumer_gone(&mut self.abort_rx, &self.tx) => return AttemptOutcome::Cancelled,
                next = tokio::time::timeout(read_timeout, lines.next()) => next,
            };
            let line = match next {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(err))) => return mid_stream_failure(&err),
                Ok(None) => {
                    return AttemptOutcome::Failed {
                        error: NormalizedError::terminated(),
                        terminated: true,
                    };
                }
                Err(_) => {
                    return failed(normalize(&RawSignal::text(format!(
                        "upstream read timeout after {read_timeout:?}"
                    ))));
                }
            };

            let (kind, event) = match parse_line(&line) {
                UpstreamLine::Blank => continue,
                UpstreamLine::Completion => {
                    let completed = self.tracker.mark_completed();
                    self.check(completed);
                    return AttemptOutcome::Completed;
                }
                UpstreamLine::Error(signal) => return failed(normalize(&signal)),
                UpstreamLine::Meta => (EventKind::Meta, StreamEvent::Meta { line }),
                UpstreamLine::Content => (EventKind::Data, StreamEvent::Content { line }),
            };
            if !self.emit(event).await {
                return AttemptOutcome::Cancelled;
            }
            let recorded = self.tracker.record_event(kind, kind == EventKind::Data);
            self.check(recorded);
        }
    }

    fn retry_allowed(&self, error: &NormalizedError) -> bool {
        let session_id = &self.request.session_id;
        if !self.request.idempotent {
            debug!(session_id = %session_id, "retry disabled for non-idempotent request");
            return false;
        }
        if self.tracker.metrics().content_received && !self.inner.config.allow_retry_after_content {
            debug!(session_id = %session_id, "retry refused: content already delivered");
            return false;
        }
        self.inner
            .controller
            .should_retry(&self.retry_state, error)
    }

    /// Sends one event unless the consumer cancelled first.
    async fn emit(&mut self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            _ = aborted(&mut self.abort_rx) => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Retry backoff; false when cancelled while waiting.
    async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = consumer_gone(&mut self.abort_rx, &self.tx) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn cancel(&mut self) {
        info!(session_id = %self.request.session_id, "wrapped stream cancelled by consumer");
        if !self.tracker.state().is_terminal() {
            let settled = self.tracker.mark_error(NormalizedError::cancelled());
            self.check(settled);
        }
    }

    fn check(&self, result: Result<(), TransitionError>) {
        if let Err(err) = result {
            warn!(session_id = %self.request.session_id, error = %err, "unexpected stream state transition");
        }
    }

    fn finalize(mut self) -> SessionReport {
        self.inner.controller.reset(&mut self.retry_state);
        let record = self.tracker.to_log_record();
        info!(session_id = %self.request.session_id, state = %self.tracker.state(), retries = self.retries, %record, "wrapped stream finished");

        let state = self.tracker.state();
        let metrics = self.tracker.into_metrics();
        self.inner.telemetry.record_session(&metrics);
        SessionReport {
            session_id: self.request.session_id,
            state,
            metrics,
            retries: self.retries,
        }
    }
}

fn failed(error: NormalizedError) -> AttemptOutcome {
    AttemptOutcome::Failed {
        error,
        terminated: false,
    }
}

/// A transport failure after the channel was established is a dropped
/// connection unless its text classifies as something more specific.
fn mid_stream_failure(err: &UpstreamError) -> AttemptOutcome {
    let error = normalize(&err.signal());
    if matches!(err, UpstreamError::Transport { .. }) && error.code == ErrorCode::Generic {
        return AttemptOutcome::Failed {
            error: NormalizedError::for_code(ErrorCode::Terminated, err.to_string()),
            terminated: true,
        };
    }
    failed(error)
}

/// Wait before the next attempt: the controller's backoff, raised to the
/// error's hint when configured (the hint itself is capped at `max_delay`).
fn retry_delay(
    config: &WrapperConfig,
    controller: &RetryController,
    state: &RetryState,
    error: &NormalizedError,
) -> Duration {
    let backoff = controller.compute_delay(state);
    match error.retry_after_hint_seconds {
        Some(hint) if config.honor_retry_after_hint => {
            backoff.max(Duration::from_secs(hint).min(config.retry.max_delay))
        }
        _ => backoff,
    }
}

async fn aborted(abort_rx: &mut watch::Receiver<bool>) {
    if abort_rx.wait_for(|aborted| *aborted).await.is_err() {
        // every AbortHandle is gone; only the channel can signal now
        std::future::pending::<()>().await;
    }
}

async fn consumer_gone(abort_rx: &mut watch::Receiver<bool>, tx: &mpsc::Sender<StreamEvent>) {
    tokio::select! {
        _ = aborted(abort_rx) => {}
        _ = tx.closed() => {}
    }
}
