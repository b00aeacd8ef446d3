use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mesh internals at debug, everything else quiet
const DEFAULT_FILTER: &str = "warn,gobchat_mesh=debug,gobchat_sim=info";

/// How simulation output is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, for piping into jq or a collector
    Json,
    /// Multi-line human readable output
    Pretty,
    /// One line per event
    Compact,
}

impl LogFormat {
    /// Read `SIM_LOG_FORMAT`, defaulting to compact output
    pub fn from_env() -> Result<Self> {
        match std::env::var("SIM_LOG_FORMAT") {
            Ok(value) => value.parse(),
            Err(_) => Ok(LogFormat::Compact),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" | "" => Ok(LogFormat::Compact),
            other => bail!(
                "unknown SIM_LOG_FORMAT {:?} (expected json, pretty or compact)",
                other
            ),
        }
    }
}

/// Install the global subscriber. RUST_LOG overrides the default filter.
pub fn init(format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .json()
                    .with_current_span(true),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .pretty(),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .compact(),
            )
            .init(),
    }

    tracing::info!(?format, "Logging initialized");
}
