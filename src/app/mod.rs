//! The `trace-streamer` binary: reads NDJSON events and streams them to the
//! backend through a [`Streamer`].

pub mod config;
pub mod logging_system;

pub use config::{Config, ConfigError, LogFormat, LogLevel};
pub use logging_system::{LoggingError, setup_logging};

use crate::domain::{Message, MessageError, Payload};
use crate::reliability::ConnectionProbe;
use crate::sender::HttpMessageProcessor;
use crate::streamer::{DisabledUploads, Streamer};
use anyhow::Context;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: usize,
    pub accepted: usize,
    pub malformed: usize,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Message>, MessageError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let payload: Payload = serde_json::from_str(line)?;
    Ok(Some(Message::new(payload)))
}

/// Feeds every well-formed line to the streamer. Malformed lines are logged
/// and skipped; read errors abort.
pub fn ingest<R: BufRead>(reader: R, streamer: &Streamer) -> io::Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        summary.lines += 1;
        match parse_line(&line) {
            Ok(Some(message)) => {
                streamer.put(message);
                summary.accepted += 1;
            }
            Ok(None) => {}
            Err(e) => {
                summary.malformed += 1;
                warn!(line = index + 1, error = %e, "Skipping malformed input line");
            }
        }
    }
    Ok(summary)
}

pub fn build_streamer(config: &Config) -> anyhow::Result<Streamer> {
    let processor = HttpMessageProcessor::new(config.to_processor_config())
        .context("Failed to create HTTP processor")?;
    let probe: Arc<dyn ConnectionProbe> = Arc::new(processor.health_probe()?);
    let streamer = Streamer::with_probe(
        config.to_streamer_config(),
        Arc::new(processor),
        Arc::new(DisabledUploads::new()),
        Some(probe),
    )
    .context("Failed to start streamer")?;
    Ok(streamer)
}

/// Streams the configured input and closes. Returns whether everything was
/// drained before the close timeout.
pub fn run(config: &Config) -> anyhow::Result<bool> {
    let streamer = build_streamer(config)?;

    let summary = match &config.input {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            ingest(BufReader::new(file), &streamer)
        }
        None => ingest(io::stdin().lock(), &streamer),
    };
    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            streamer.close(config.close_timeout());
            return Err(e).context("Failed to read input");
        }
    };
    info!(
        lines = summary.lines,
        accepted = summary.accepted,
        malformed = summary.malformed,
        "Input consumed"
    );

    let drained = streamer.close(config.close_timeout());
    let stats = streamer.stats();
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        rejected = stats.rejected,
        discarded = stats.discarded,
        replayed = stats.replayed,
        drained,
        "Streamer closed"
    );
    Ok(drained)
}

pub fn main() -> anyhow::Result<()> {
    let config = match Config::from_args_and_env(std::env::args_os()) {
        Ok(config) => config,
        Err(ConfigError::ArgumentError(e)) => e.exit(),
        Err(e) => return Err(e).context("Invalid configuration"),
    };
    setup_logging(config.log_level, config.log_format)?;
    info!(
        version = crate::VERSION,
        endpoint = %config.endpoint,
        "Starting trace-streamer"
    );

    if !run(&config)? {
        anyhow::bail!(
            "Not all messages were delivered within {}s",
            config.close_timeout_secs
        );
    }
    Ok(())
}
