use std::pin::Pin;

use crate::errors::UpstreamError;
use crate::session::AttemptRequest;

/// Incrementally delivered upstream lines, without trailing newlines.
pub type LineStream =
    Pin<Box<dyn futures::Stream<Item = Result<String, UpstreamError>> + Send + 'static>>;

/// Contract implemented by every upstream integration.
///
/// `open` is called once per attempt; a retry always opens a fresh stream.
/// Errors returned from `open` are connection-level failures, errors yielded
/// by the stream are mid-stream failures.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Establishes the channel for one attempt.
    async fn open(&self, request: AttemptRequest) -> Result<LineStream, UpstreamError>;
}
