use std::fmt;

use crate::state::{StreamMetrics, StreamState};

/// Opaque caller-supplied identifier used to correlate logs and telemetry.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a session id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a random id for callers that have none of their own.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the session id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// One request to wrap: what to send upstream on every attempt.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamRequest {
    pub session_id: SessionId,
    /// Opaque payload handed to the upstream adapter unchanged.
    pub body: serde_json::Value,
    /// Repeating the upstream interaction has no external side effects.
    /// When `false`, no attempt is ever retried.
    pub idempotent: bool,
}

impl StreamRequest {
    /// Creates an idempotent request for `session_id`.
    pub fn new(session_id: impl Into<SessionId>, body: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            body,
            idempotent: true,
        }
    }

    /// Marks whether the upstream interaction is safe to repeat.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }
}

/// What an upstream adapter receives for one attempt.
#[derive(Clone, Debug)]
pub struct AttemptRequest {
    pub session_id: SessionId,
    /// `0` for the initial try, `n` for the n-th retry.
    pub attempt: u32,
    pub body: serde_json::Value,
}

/// Final outcome of a wrapped stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub state: StreamState,
    pub metrics: StreamMetrics,
    /// Retries issued during the session.
    pub retries: u32,
}

impl SessionReport {
    /// True when the upstream delivered its own completion marker.
    pub fn is_success(&self) -> bool {
        self.state == StreamState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn requests_default_to_idempotent() {
        let request = StreamRequest::new("s", serde_json::json!({"q": 1}));
        assert!(request.idempotent);
        assert!(!request.idempotent(false).idempotent);
    }
}
