use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool;

const ENV_ENABLED: [&str; 2] = [
    "RESILIENT_STREAM_OBSERVABILITY_ENABLED",
    "RESILIENT_STREAM_OBSERVABILITY",
];
const ENV_LOG_LEVEL: &str = "RESILIENT_STREAM_LOG_LEVEL";
const ENV_JSON_LOG_PATH: &str = "RESILIENT_STREAM_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "resilient-stream.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, PartialEq, Eq)]
struct LogSettings {
    enabled: bool,
    level: Option<String>,
    json_path: Option<PathBuf>,
}

impl LogSettings {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = ENV_ENABLED
            .iter()
            .find_map(|key| lookup(key))
            .map(|value| parse_bool(&value).unwrap_or(true))
            .unwrap_or(true);
        Self {
            enabled,
            level: lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()),
            json_path: lookup(ENV_JSON_LOG_PATH)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
        {
            return filter;
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

/// Installs a global tracing subscriber once per process.
///
/// Environment variables:
/// - `RESILIENT_STREAM_OBSERVABILITY_ENABLED` / `RESILIENT_STREAM_OBSERVABILITY`: enable flag (default enabled).
/// - `RESILIENT_STREAM_LOG_LEVEL`: filter override (`info`, `resilient_stream=debug`, ...).
/// - `RESILIENT_STREAM_JSON_LOG_PATH`: write JSONL session logs to this file instead of the console.
/// - `RUST_LOG`: fallback filter.
///
/// Does nothing if the application already installed a subscriber.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = LogSettings::from_lookup(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }

        let env_filter = settings.env_filter();
        match &settings.json_path {
            Some(path) => {
                let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(parent) => {
                        let _ = std::fs::create_dir_all(parent);
                        parent.to_path_buf()
                    }
                    None => PathBuf::from("."),
                };
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_LOG_FILE);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            None => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
