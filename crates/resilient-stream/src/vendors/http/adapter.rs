use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{UpstreamError, WrapperError};
use crate::session::AttemptRequest;
use crate::upstream::{LineStream, Upstream};

use super::config::HttpUpstreamConfig;
use super::transport::LineDecoder;

const HTTP_UPSTREAM: &str = "http";

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Upstream that POSTs the request body as JSON and reads the response body
/// as a stream of lines.
pub struct HttpUpstream {
    client: reqwest::Client,
    config: HttpUpstreamConfig,
}

impl HttpUpstream {
    /// Creates an upstream from explicit client configuration.
    pub fn new(config: HttpUpstreamConfig) -> Result<Self, WrapperError> {
        if config.url.trim().is_empty() {
            return Err(WrapperError::Config(
                "HTTP upstream url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| WrapperError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates an upstream using `RESILIENT_STREAM_UPSTREAM_URL`.
    pub fn from_env() -> Result<Self, WrapperError> {
        Self::new(HttpUpstreamConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        HTTP_UPSTREAM
    }

    async fn open(&self, request: AttemptRequest) -> Result<LineStream, UpstreamError> {
        debug!(session_id = %request.session_id, attempt = request.attempt, url = %self.config.url, "opening HTTP upstream");

        let mut http_req = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header("x-session-id", request.session_id.as_str())
            .header("x-attempt", request.attempt.to_string())
            .json(&request.body);
        if let Some(token) = &self.config.bearer_token {
            http_req = http_req.bearer_auth(token);
        }

        let response = http_req.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::transport(format!("connect timeout: {e}"))
            } else {
                UpstreamError::transport(format!("request failed: {e}"))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(UpstreamError::status(
                status.as_u16(),
                format!("{status}: {body}"),
            ));
        }

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(line_stream(bytes_stream)))
    }
}

fn line_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<String, UpstreamError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: LineDecoder,
        pending: VecDeque<String>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: LineDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.pending.pop_front() {
                    return Ok(Some((line, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        let lines = state.decoder.push_chunk(&chunk);
                        state.pending.extend(lines);
                    }
                    Some(Err(e)) => {
                        return Err(UpstreamError::transport(format!(
                            "upstream read failed: {e}"
                        )));
                    }
                    None => {
                        state.pending.extend(state.decoder.finish());
                        state.done = true;
                    }
                }
            }
        },
    )
}
