use super::config::{LogFormat, LogLevel};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Chatty dependencies kept at warn unless RUST_LOG says otherwise.
const DEFAULT_DIRECTIVES: &[&str] = &["hyper=warn", "reqwest=warn", "h2=warn", "rusqlite=warn"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to install global subscriber: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

pub fn build_filter_string(level: LogLevel) -> String {
    let mut parts = Vec::with_capacity(DEFAULT_DIRECTIVES.len() + 1);
    parts.push(level.as_str());
    parts.extend_from_slice(DEFAULT_DIRECTIVES);
    parts.join(",")
}

/// `RUST_LOG` wins when set; otherwise the configured level plus the
/// default directives.
pub fn build_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    let filter = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| build_filter_string(level));
    EnvFilter::try_new(&filter).map_err(|source| LoggingError::InvalidFilter { filter, source })
}

pub fn setup_logging(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_thread_names(true)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()?,
    }
    Ok(())
}
