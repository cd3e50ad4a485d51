use std::time::Duration;

use crate::errors::WrapperError;

const ENV_URL: &str = "RESILIENT_STREAM_UPSTREAM_URL";
const ENV_TOKEN: &str = "RESILIENT_STREAM_UPSTREAM_TOKEN";

/// Configuration for the HTTP upstream client.
#[derive(Clone, Debug)]
pub struct HttpUpstreamConfig {
    /// Endpoint that accepts the request body and streams lines back.
    pub url: String,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// TCP/TLS connect timeout. The body itself is bounded by the wrapper's
    /// read timeout, not here.
    pub connect_timeout: Duration,
}

impl HttpUpstreamConfig {
    /// Creates a config for `url` with sensible defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Builds a config from `RESILIENT_STREAM_UPSTREAM_URL` and the optional
    /// `RESILIENT_STREAM_UPSTREAM_TOKEN`.
    pub fn from_env() -> Result<Self, WrapperError> {
        let url = std::env::var(ENV_URL).unwrap_or_default();
        if url.trim().is_empty() {
            return Err(WrapperError::Config(format!(
                "missing {ENV_URL} for HTTP upstream"
            )));
        }
        let config = Self::new(url);
        Ok(match std::env::var(ENV_TOKEN) {
            Ok(token) if !token.trim().is_empty() => config.bearer_token(token),
            _ => config,
        })
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
