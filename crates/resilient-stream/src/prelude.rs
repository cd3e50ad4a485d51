//! Common imports for wrapping a stream and consuming its events.
pub use crate::{
    AbortHandle, ErrorCode, NormalizedError, RetryPolicy, SessionId, SessionReport, StreamEvent,
    StreamRequest, StreamState, StreamWrapper, TelemetrySnapshot, Upstream, WrappedStream,
    WrapperConfig, WrapperError,
};
