/// Streaming HTTP upstream.
pub mod http;
