//! Resilient wrapper around line-oriented upstream event streams.
//!
//! A [`StreamWrapper`] opens an [`Upstream`], forwards its lines to the
//! consumer, normalizes failures into [`NormalizedError`]s, retries transient
//! failures with exponential backoff, and guarantees that every stream ends
//! with exactly one completion marker (`data: [DONE]`).
//!
//! Upstream integrations live under `vendors::*`.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use resilient_stream::prelude::*;
//! use resilient_stream::vendors::http::HttpUpstream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), WrapperError> {
//! let wrapper = StreamWrapper::builder(Arc::new(HttpUpstream::from_env()?))
//!     .config(WrapperConfig::from_env()?)
//!     .build()?;
//!
//! let mut stream = wrapper
//!     .start(StreamRequest::new(SessionId::generate(), serde_json::json!({"prompt": "hi"})))
//!     .await?;
//! while let Some(event) = stream.next_event().await {
//!     println!("{}", event.to_line());
//! }
//! let report = stream.finish().await?;
//! println!("{} after {} retries", report.state, report.retries);
//! # Ok(())
//! # }
//! ```

/// Error codes, raw upstream signals, and classification into normalized errors.
pub mod classify;
/// Wrapper configuration and environment loading.
pub mod config;
/// Public error types.
pub mod errors;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Retry policy and backoff computation.
pub mod retry;
/// Session identifiers, requests, and reports.
pub mod session;
/// Per-session lifecycle state machine and metrics.
pub mod state;
/// Consumer-facing events and upstream line parsing.
pub mod stream;
/// Aggregate counters across sessions.
pub mod telemetry;
/// Contract implemented by upstream integrations.
pub mod upstream;
/// Concrete upstream integrations.
pub mod vendors;
/// Wrapper entry point, session driver, and stream handle.
pub mod wrapper;

pub use classify::{ErrorCode, NormalizedError, RawSignal, normalize};
pub use config::WrapperConfig;
pub use errors::{TransitionError, UpstreamError, WrapperError};
pub use observability::init_observability;
pub use retry::{RetryController, RetryPolicy, RetryState};
pub use session::{AttemptRequest, SessionId, SessionReport, StreamRequest};
pub use state::{StreamMetrics, StreamState, StreamTracker};
pub use stream::{COMPLETION_MARKER, StreamEvent, UpstreamLine, parse_line};
pub use telemetry::{TelemetryCollector, TelemetrySnapshot};
pub use upstream::{LineStream, Upstream};
pub use wrapper::{AbortHandle, StreamWrapper, StreamWrapperBuilder, WrappedStream};
