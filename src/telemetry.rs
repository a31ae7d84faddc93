//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level when it is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::TelemetryError;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self, TelemetryError> {
        match value.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(TelemetryError::Init(format!(
                "unsupported log format '{}'",
                other
            ))),
        }
    }
}

/// Build the level filter from `RUST_LOG` or the configured level
pub fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    if let Ok(directives) = std::env::var(EnvFilter::DEFAULT_ENV) {
        if !directives.trim().is_empty() {
            return EnvFilter::try_new(&directives)
                .map_err(|e| TelemetryError::Filter(e.to_string()));
        }
    }
    filter_from_level(level)
}

fn filter_from_level(level: &str) -> Result<EnvFilter, TelemetryError> {
    let level = level.trim().to_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => {}
        _ => return Err(TelemetryError::Filter(format!("unknown level '{}'", level))),
    }
    EnvFilter::try_new(&level).map_err(|e| TelemetryError::Filter(e.to_string()))
}

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(&config.level)?;
    let format = LogFormat::parse(&config.format)?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
    };

    result.map_err(|e| TelemetryError::Init(e.to_string()))
}
