use crate::classify::RawSignal;
use crate::state::StreamState;

/// Errors returned by an upstream adapter before they are normalized for the
/// downstream stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status (HTTP status, gRPC-like code, etc.).
    #[error("upstream returned status {status}: {message}")]
    Status { status: u16, message: String },
    /// Transport or stream I/O failed.
    #[error("upstream transport error: {message}")]
    Transport { message: String },
    /// Upstream response shape was invalid.
    #[error("upstream protocol error: {message}")]
    Protocol { message: String },
}

impl UpstreamError {
    /// Creates a status-level error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a transport-level error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Status { message, .. }
            | Self::Transport { message }
            | Self::Protocol { message } => message,
        }
    }

    /// Converts this error into the raw signal fed to the normalizer.
    ///
    /// Status errors carry their code as a structured signal; the others are
    /// classified from their rendered text.
    pub fn signal(&self) -> RawSignal {
        match self {
            Self::Status { status, message } => {
                RawSignal::structured(Some(i64::from(*status)), message.clone())
            }
            Self::Transport { .. } | Self::Protocol { .. } => RawSignal::text(self.to_string()),
        }
    }
}

/// Illegal lifecycle transition requested on a `StreamTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The tracker already reached an absorbing state.
    #[error("stream already finished in state {state}")]
    AlreadyTerminal { state: StreamState },
    /// The requested transition is not valid from the current state.
    #[error("cannot move from {from} to {to}")]
    Invalid { from: StreamState, to: StreamState },
}

/// Top-level error type for the public wrapper API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WrapperError {
    /// Invalid wrapper, policy, or upstream configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid input to the request builder.
    #[error("validation error: {0}")]
    Validation(String),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl WrapperError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
