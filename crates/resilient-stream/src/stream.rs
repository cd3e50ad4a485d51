use serde_json::{Map, Value};

use crate::classify::{NormalizedError, RawSignal};

/// Line that signals a normal end of stream.
pub const COMPLETION_MARKER: &str = "data: [DONE]";

const DONE_PAYLOAD: &str = "[DONE]";
const META_PREFIXES: &[&str] = &["event:", "id:", "retry:"];
const CODE_KEYS: &[&str] = &["code", "status", "status_code"];
const MESSAGE_KEYS: &[&str] = &["message", "technical_message", "detail"];
const LABEL_KEYS: &[&str] = &["code", "type"];

/// Events delivered to the consumer of a wrapped stream.
///
/// Exactly one `Done` is delivered per wrapped stream, always last.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Opaque upstream line, forwarded verbatim.
    Content { line: String },
    /// Framing line (comment, `event:`, ...) forwarded verbatim.
    Meta { line: String },
    /// Normalized error. Transient errors may be followed by more content
    /// from a retried attempt.
    Error { error: NormalizedError },
    /// Completion marker; `synthetic` when the wrapper injected it.
    Done { synthetic: bool },
}

impl StreamEvent {
    /// Returns true for the final event of a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Renders the event in the same line shape the upstream uses.
    pub fn to_line(&self) -> String {
        match self {
            Self::Content { line } | Self::Meta { line } => line.clone(),
            Self::Error { error } => render_error_line(error),
            Self::Done { .. } => COMPLETION_MARKER.to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a NormalizedError,
}

fn render_error_line(error: &NormalizedError) -> String {
    match serde_json::to_string(&ErrorEnvelope { error }) {
        Ok(json) => format!("data: {json}"),
        Err(_) => format!(
            "data: {{\"error\":{{\"code\":{},\"user_message\":{:?}}}}}",
            error.code.as_u16(),
            error.user_message
        ),
    }
}

/// Classification of one upstream line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpstreamLine {
    /// Normal end of stream.
    Completion,
    /// Embedded error payload.
    Error(RawSignal),
    /// Framing line without content.
    Meta,
    /// Anything else.
    Content,
    /// Frame separator; dropped.
    Blank,
}

/// Recognizes sentinel shapes in one upstream line.
pub fn parse_line(line: &str) -> UpstreamLine {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return UpstreamLine::Blank;
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => {
            if line.starts_with(':') || META_PREFIXES.iter().any(|p| line.starts_with(p)) {
                return UpstreamLine::Meta;
            }
            line
        }
    };

    if payload.trim() == DONE_PAYLOAD {
        return UpstreamLine::Completion;
    }
    match error_signal(payload) {
        Some(signal) => UpstreamLine::Error(signal),
        None => UpstreamLine::Content,
    }
}

fn error_signal(payload: &str) -> Option<RawSignal> {
    let payload = payload.trim();
    if !payload.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    let object = value.as_object()?;

    let error = object
        .get("error")
        .filter(|v| !v.is_null() && *v != &Value::Bool(false));
    let typed_error = object.get("type").and_then(Value::as_str) == Some("error");

    match error {
        Some(Value::Object(inner)) => Some(structured_signal(inner, payload)),
        Some(Value::String(message)) => Some(RawSignal::structured(
            numeric_code(object),
            message.clone(),
        )),
        Some(_) => Some(structured_signal(object, payload)),
        None if typed_error => Some(structured_signal(object, payload)),
        None => None,
    }
}

fn structured_signal(fields: &Map<String, Value>, raw: &str) -> RawSignal {
    let message = MESSAGE_KEYS
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .unwrap_or(raw);
    let label = LABEL_KEYS.iter().find_map(|key| {
        fields
            .get(*key)
            .and_then(Value::as_str)
            .filter(|s| s.parse::<i64>().is_err() && *s != "error")
    });
    let message = match label {
        Some(label) => format!("{label}: {message}"),
        None => message.to_string(),
    };
    RawSignal::structured(numeric_code(fields), message)
}

fn numeric_code(fields: &Map<String, Value>) -> Option<i64> {
    CODE_KEYS.iter().find_map(|key| match fields.get(*key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorCode, normalize};

    #[test]
    fn recognizes_completion_marker_variants() {
        assert_eq!(parse_line("data: [DONE]"), UpstreamLine::Completion);
        assert_eq!(parse_line("data:[DONE]\r"), UpstreamLine::Completion);
        assert_eq!(parse_line("[DONE]"), UpstreamLine::Completion);
        assert_eq!(parse_line("data: [DONE] later"), UpstreamLine::Content);
    }

    #[test]
    fn blank_meta_and_content_lines() {
        assert_eq!(parse_line(""), UpstreamLine::Blank);
        assert_eq!(parse_line("  \r"), UpstreamLine::Blank);
        assert_eq!(parse_line(": keep-alive"), UpstreamLine::Meta);
        assert_eq!(parse_line("event: message"), UpstreamLine::Meta);
        assert_eq!(parse_line("Starting..."), UpstreamLine::Content);
        assert_eq!(
            parse_line(r#"data: {"type":"delta","text":"hi"}"#),
            UpstreamLine::Content
        );
        assert_eq!(parse_line(r#"data: {"error": null}"#), UpstreamLine::Content);
        assert_eq!(parse_line("data: {not json"), UpstreamLine::Content);
    }

    #[test]
    fn extracts_structured_error_objects() {
        let line = r#"data: {"error": {"code": 503, "message": "backend busy"}}"#;
        assert_eq!(
            parse_line(line),
            UpstreamLine::Error(RawSignal::structured(Some(503), "backend busy"))
        );

        let line = r#"{"error": {"status": "429", "message": "slow down"}}"#;
        assert_eq!(
            parse_line(line),
            UpstreamLine::Error(RawSignal::structured(Some(429), "slow down"))
        );
    }

    #[test]
    fn keeps_string_codes_as_classifiable_text() {
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let UpstreamLine::Error(signal) = parse_line(line) else {
            panic!("expected error line");
        };
        assert_eq!(signal.message(), "overloaded_error: Overloaded");
        assert_eq!(normalize(&signal).code, ErrorCode::Overloaded);
    }

    #[test]
    fn string_and_flag_error_fields() {
        assert_eq!(
            parse_line(r#"data: {"error": "Request timeout", "code": 504}"#),
            UpstreamLine::Error(RawSignal::structured(Some(504), "Request timeout"))
        );
        let UpstreamLine::Error(signal) = parse_line(r#"data: {"error": true, "message": "x"}"#)
        else {
            panic!("expected error line");
        };
        assert_eq!(signal.message(), "x");
    }

    #[test]
    fn rendered_error_lines_are_recognized_by_another_wrapper() {
        let error = NormalizedError::for_code(ErrorCode::RateLimited, "429 from backend");
        let line = StreamEvent::Error {
            error: error.clone(),
        }
        .to_line();
        assert!(line.starts_with("data: {\"error\":"));

        let UpstreamLine::Error(signal) = parse_line(&line) else {
            panic!("expected error line");
        };
        assert_eq!(normalize(&signal), error);
    }

    #[test]
    fn done_renders_marker_and_is_terminal() {
        let done = StreamEvent::Done { synthetic: true };
        assert!(done.is_terminal());
        assert_eq!(done.to_line(), COMPLETION_MARKER);
        assert!(
            !StreamEvent::Content {
                line: "x".into()
            }
            .is_terminal()
        );
    }
}
