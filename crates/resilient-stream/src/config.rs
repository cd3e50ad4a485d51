use std::str::FromStr;
use std::time::Duration;

use crate::errors::WrapperError;
use crate::retry::RetryPolicy;

const ENV_MAX_RETRIES: &str = "RESILIENT_STREAM_MAX_RETRIES";
const ENV_BASE_DELAY_MS: &str = "RESILIENT_STREAM_BASE_DELAY_MS";
const ENV_MAX_DELAY_MS: &str = "RESILIENT_STREAM_MAX_DELAY_MS";
const ENV_MULTIPLIER: &str = "RESILIENT_STREAM_MULTIPLIER";
const ENV_JITTER: &str = "RESILIENT_STREAM_JITTER";
const ENV_CONNECT_TIMEOUT_MS: &str = "RESILIENT_STREAM_CONNECT_TIMEOUT_MS";
const ENV_READ_TIMEOUT_MS: &str = "RESILIENT_STREAM_READ_TIMEOUT_MS";

/// Wrapper behavior options, fixed at construction.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    pub retry: RetryPolicy,
    /// Bound on opening the upstream channel for one attempt.
    pub connect_timeout: Duration,
    /// Bound on the gap between two upstream lines.
    pub read_timeout: Duration,
    /// Bounded event buffer size used by the downstream channel.
    pub stream_buffer_capacity: usize,
    /// Permit retries after content already reached the consumer. Off by
    /// default: a fresh attempt would repeat that content.
    pub allow_retry_after_content: bool,
    /// Wait at least the error's retry hint (capped at `max_delay`).
    pub honor_retry_after_hint: bool,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            stream_buffer_capacity: 128,
            allow_retry_after_content: false,
            honor_retry_after_hint: false,
        }
    }
}

impl WrapperConfig {
    /// Builds a config from `RESILIENT_STREAM_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self, WrapperError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WrapperError> {
        let mut config = Self::default();
        if let Some(value) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES)? {
            config.retry.max_retries = value;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MAX_DELAY_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(value) = parse_var::<f64>(&lookup, ENV_MULTIPLIER)? {
            config.retry.multiplier = value;
        }
        if let Some(raw) = lookup(ENV_JITTER) {
            config.retry.jitter_enabled = parse_bool(&raw).ok_or_else(|| {
                WrapperError::Config(format!("{ENV_JITTER} must be a boolean (got {raw:?})"))
            })?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_READ_TIMEOUT_MS)? {
            config.read_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn allow_retry_after_content(mut self, allow: bool) -> Self {
        self.allow_retry_after_content = allow;
        self
    }

    pub fn honor_retry_after_hint(mut self, honor: bool) -> Self {
        self.honor_retry_after_hint = honor;
        self
    }

    pub fn validate(&self) -> Result<(), WrapperError> {
        if self.stream_buffer_capacity == 0 {
            return Err(WrapperError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(WrapperError::Config(
                "connect_timeout and read_timeout must be greater than 0".into(),
            ));
        }
        self.retry.validate()
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, WrapperError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| WrapperError::Config(format!("invalid {key}={raw:?}: {e}")))
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}
