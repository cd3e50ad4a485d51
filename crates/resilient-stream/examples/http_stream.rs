use std::sync::Arc;

use resilient_stream::prelude::*;
use resilient_stream::vendors::http::HttpUpstream;

// RESILIENT_STREAM_UPSTREAM_URL=http://localhost:8080/stream cargo run --example http_stream
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), WrapperError> {
    resilient_stream::init_observability();

    let wrapper = StreamWrapper::builder(Arc::new(HttpUpstream::from_env()?))
        .config(WrapperConfig::from_env()?)
        .build()?;

    let body = serde_json::json!({ "prompt": "Stream a greeting." });
    let mut stream = wrapper
        .start(StreamRequest::new(SessionId::generate(), body))
        .await?;

    while let Some(event) = stream.next_event().await {
        match &event {
            StreamEvent::Error { error } => eprintln!("{}", error.user_message),
            _ => println!("{}", event.to_line()),
        }
    }

    let report = stream.finish().await?;
    eprintln!(
        "session {} ended {} after {} retries",
        report.session_id, report.state, report.retries
    );
    let snapshot = wrapper.telemetry().snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).map_err(|e| WrapperError::Protocol(e.to_string()))?
    );
    Ok(())
}
