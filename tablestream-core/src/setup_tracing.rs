//! Subscriber setup for hosts embedding the sink. The library itself only emits `tracing` events.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

/// Env var switching to debug level and human readable logs.
pub const ENV_DEBUG: &str = "TABLESTREAM_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Flattened JSON events at `info`.
    Json,
    /// Human readable events at `debug`.
    Text,
}

impl LogFormat {
    /// [LogFormat::Text] when [ENV_DEBUG] is `true`.
    pub fn from_env() -> Self {
        match std::env::var(ENV_DEBUG) {
            Ok(v) if v.eq_ignore_ascii_case("true") => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }

    fn default_level(self) -> LevelFilter {
        match self {
            LogFormat::Json => LevelFilter::INFO,
            LogFormat::Text => LevelFilter::DEBUG,
        }
    }
}

/// Installs the subscriber and a panic hook logging panics as events. `RUST_LOG` overrides the
/// default level of the format. Returns `false`, changing nothing, if a subscriber is already
/// installed.
pub fn register(format: LogFormat) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(format.default_level().into())
        .from_env_lossy();

    let layer = match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok();
    if installed {
        std::panic::set_hook(Box::new(|info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
            tracing::error!(location, %info, "Panicked");
        }));
    }
    installed
}
