//! Error detection and normalization.
//!
//! Every raw failure the wrapper observes (a transport error, a non-success
//! status, or an error payload embedded in the upstream stream) is mapped to
//! exactly one [`NormalizedError`]. The mapping is pure: no shared state, no
//! I/O, and the same signal always yields the same value.

use std::fmt;

const OVERLOAD_KEYWORDS: &[&str] = &["503", "overloaded", "unavailable", "server error"];
const RATE_LIMIT_KEYWORDS: &[&str] = &["429", "rate limit", "too many requests"];
const TIMEOUT_KEYWORDS: &[&str] = &["timeout"];

/// Codes that may be marked transient. A `NormalizedError` with
/// `is_transient == true` always carries one of these.
pub const TRANSIENT_CODES: &[ErrorCode] = &[
    ErrorCode::Overloaded,
    ErrorCode::RateLimited,
    ErrorCode::Terminated,
];

/// Technical message used when the upstream closes without a completion marker.
pub const TERMINATED_MESSAGE: &str = "stream terminated unexpectedly";

/// Small integer classification carried by every normalized error.
///
/// Serialized as its numeric value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    /// Upstream is overloaded or unavailable (503).
    Overloaded,
    /// Upstream rejected the request due to rate limiting (429).
    RateLimited,
    /// The attempt took too long (504).
    Timeout,
    /// Anything that matched no other category (500).
    Generic,
    /// Upstream ended the stream without a completion marker (502).
    Terminated,
    /// The consumer went away before the stream finished (499).
    Cancelled,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Overloaded => 503,
            Self::RateLimited => 429,
            Self::Timeout => 504,
            Self::Generic => 500,
            Self::Terminated => 502,
            Self::Cancelled => 499,
        }
    }

    /// Maps an explicit code reported by the upstream, if it is one the
    /// normalizer recognizes. Unrecognized codes fall through to text
    /// classification.
    pub fn from_upstream_code(code: i64) -> Option<Self> {
        match code {
            503 | 529 => Some(Self::Overloaded),
            429 => Some(Self::RateLimited),
            504 | 408 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Whether errors with this code are eligible for retry at all.
    pub fn is_transient(self) -> bool {
        TRANSIENT_CODES.contains(&self)
    }

    fn user_message(self) -> &'static str {
        match self {
            Self::Overloaded => "The service is temporarily busy. Please wait a moment.",
            Self::RateLimited => "The rate limit was reached. Please try again shortly.",
            Self::Timeout => "The request took too long to complete.",
            Self::Generic => "An error occurred while generating the response.",
            Self::Terminated => "The response ended unexpectedly.",
            Self::Cancelled => "The request was cancelled.",
        }
    }

    fn retry_after_hint_seconds(self) -> Option<u64> {
        match self {
            Self::Overloaded => Some(10),
            Self::RateLimited => Some(30),
            Self::Timeout => Some(5),
            Self::Generic | Self::Terminated | Self::Cancelled => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.as_u16()
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            503 => Ok(Self::Overloaded),
            429 => Ok(Self::RateLimited),
            504 => Ok(Self::Timeout),
            500 => Ok(Self::Generic),
            502 => Ok(Self::Terminated),
            499 => Ok(Self::Cancelled),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

/// Canonical error forwarded to consumers and recorded in telemetry.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("[{code}] {technical_message}")]
pub struct NormalizedError {
    /// Classification code.
    pub code: ErrorCode,
    /// Original or diagnostic text.
    pub technical_message: String,
    /// Short, non-technical description safe to show to end users.
    pub user_message: String,
    /// Eligible for retry.
    pub is_transient: bool,
    /// Suggested minimum wait before trying again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_hint_seconds: Option<u64>,
}

impl NormalizedError {
    /// Builds the canonical error for `code` with the given diagnostic text.
    pub fn for_code(code: ErrorCode, technical_message: impl Into<String>) -> Self {
        Self {
            code,
            technical_message: technical_message.into(),
            user_message: code.user_message().to_string(),
            is_transient: code.is_transient(),
            retry_after_hint_seconds: code.retry_after_hint_seconds(),
        }
    }

    /// Error emitted when the upstream closes without a completion marker.
    pub fn terminated() -> Self {
        Self::for_code(ErrorCode::Terminated, TERMINATED_MESSAGE)
    }

    /// Error recorded (never forwarded) when the consumer cancels.
    pub fn cancelled() -> Self {
        Self::for_code(ErrorCode::Cancelled, "consumer cancelled the stream")
    }
}

/// Raw failure signal before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawSignal {
    /// Payload that already carries an explicit code/message pair.
    Structured { code: Option<i64>, message: String },
    /// Unstructured exception or text.
    Text(String),
}

impl RawSignal {
    /// Creates a structured signal.
    pub fn structured(code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Structured {
            code,
            message: message.into(),
        }
    }

    /// Creates an unstructured text signal.
    pub fn text(message: impl Into<String>) -> Self {
        Self::Text(message.into())
    }

    /// Diagnostic text carried by the signal.
    pub fn message(&self) -> &str {
        match self {
            Self::Structured { message, .. } | Self::Text(message) => message,
        }
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    keywords.iter().any(|keyword| lowered.contains(keyword))
}

/// True if `text` looks like an overload / unavailable / server error.
pub fn classify_overload(text: &str) -> bool {
    contains_any(text, OVERLOAD_KEYWORDS)
}

/// True if `text` looks like a rate-limit rejection.
pub fn classify_rate_limited(text: &str) -> bool {
    contains_any(text, RATE_LIMIT_KEYWORDS)
}

/// True if `text` looks like a timeout.
pub fn classify_timeout(text: &str) -> bool {
    contains_any(text, TIMEOUT_KEYWORDS)
}

/// Maps any raw signal to exactly one `NormalizedError`.
///
/// A recognized explicit code wins. Otherwise the text classifiers run in
/// order (overload, rate limit, timeout) and anything left over becomes a
/// generic, non-transient error.
pub fn normalize(signal: &RawSignal) -> NormalizedError {
    let text = signal.message();
    if let RawSignal::Structured {
        code: Some(raw_code),
        ..
    } = signal
        && let Some(code) = ErrorCode::from_upstream_code(*raw_code)
    {
        return NormalizedError::for_code(code, text);
    }

    let code = if classify_overload(text) {
        ErrorCode::Overloaded
    } else if classify_rate_limited(text) {
        ErrorCode::RateLimited
    } else if classify_timeout(text) {
        ErrorCode::Timeout
    } else {
        ErrorCode::Generic
    };
    NormalizedError::for_code(code, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifiers_are_case_insensitive() {
        assert!(classify_overload("Service UNAVAILABLE"));
        assert!(classify_overload("Internal Server Error"));
        assert!(classify_rate_limited("Too Many Requests"));
        assert!(classify_rate_limited("hit the Rate Limit"));
        assert!(classify_timeout("read TIMEOUT after 30s"));
        assert!(!classify_timeout("all good"));
    }

    #[test]
    fn overload_wins_over_later_classifiers() {
        let err = normalize(&RawSignal::text("503 after timeout"));
        assert_eq!(err.code, ErrorCode::Overloaded);
        assert!(err.is_transient);
        assert_eq!(err.retry_after_hint_seconds, Some(10));
    }

    #[test]
    fn rate_limit_and_timeout_categories() {
        let rate = normalize(&RawSignal::text("429 Too Many Requests"));
        assert_eq!(rate.code, ErrorCode::RateLimited);
        assert!(rate.is_transient);
        assert_eq!(rate.retry_after_hint_seconds, Some(30));

        let timeout = normalize(&RawSignal::text("upstream timeout"));
        assert_eq!(timeout.code, ErrorCode::Timeout);
        assert!(!timeout.is_transient);
        assert_eq!(timeout.retry_after_hint_seconds, Some(5));
    }

    #[test]
    fn recognized_structured_code_wins_over_text() {
        let err = normalize(&RawSignal::structured(Some(429), "server error"));
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.technical_message, "server error");
    }

    #[test]
    fn unrecognized_structured_code_falls_back_to_text() {
        let err = normalize(&RawSignal::structured(Some(418), "model overloaded"));
        assert_eq!(err.code, ErrorCode::Overloaded);

        let err = normalize(&RawSignal::structured(Some(418), "teapot"));
        assert_eq!(err.code, ErrorCode::Generic);
    }

    #[test]
    fn unmatched_text_is_generic_and_not_transient() {
        let err = normalize(&RawSignal::text("something broke"));
        assert_eq!(err.code, ErrorCode::Generic);
        assert!(!err.is_transient);
        assert_eq!(err.retry_after_hint_seconds, None);
        assert_eq!(
            err.user_message,
            "An error occurred while generating the response."
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let signal = RawSignal::structured(None, "Overloaded, try later");
        assert_eq!(normalize(&signal), normalize(&signal));
    }

    #[test]
    fn transient_errors_always_carry_transient_codes() {
        for text in ["503", "429", "timeout", "boom", "unavailable"] {
            let err = normalize(&RawSignal::text(text));
            if err.is_transient {
                assert!(TRANSIENT_CODES.contains(&err.code));
            }
        }
        assert!(NormalizedError::terminated().is_transient);
        assert!(!NormalizedError::cancelled().is_transient);
    }

    #[test]
    fn serializes_code_as_number() {
        let value = serde_json::to_value(NormalizedError::terminated()).expect("serialize");
        assert_eq!(value["code"], serde_json::json!(502));
        assert_eq!(value["is_transient"], serde_json::json!(true));
        assert!(value.get("retry_after_hint_seconds").is_none());

        let back: NormalizedError = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, NormalizedError::terminated());
    }
}
