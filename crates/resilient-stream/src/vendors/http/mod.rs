//! HTTP upstream integration.
//!
//! Posts the request body as JSON and treats the streamed response body as
//! line-oriented upstream output (SSE or plain lines).
mod adapter;
mod config;
pub(crate) mod transport;

pub use adapter::HttpUpstream;
pub use config::HttpUpstreamConfig;
