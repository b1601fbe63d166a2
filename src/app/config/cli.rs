use super::groups::RetrySettings;
use super::{ConfigError, LogFormat, LogLevel};
use crate::buffer::{BatchConfig, BatchingConfig};
use crate::reliability::{MonitorConfig, ReplayConfig, StoreConfig};
use crate::sender::HttpProcessorConfig;
use crate::streamer::StreamerConfig;
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[command(name = "trace-streamer")]
#[command(about = "Streams trace, span and feedback events to a tracking backend")]
#[command(version)]
#[serde(default)]
pub struct Config {
    /// Base URL of the tracking backend API
    #[arg(long, env = "STREAMER_ENDPOINT", default_value = "http://localhost:5173/api/")]
    pub endpoint: String,

    /// API key sent in the authorization header
    #[arg(long, env = "STREAMER_API_KEY")]
    pub api_key: Option<String>,

    /// Workspace sent with every request
    #[arg(long, env = "STREAMER_WORKSPACE")]
    pub workspace: Option<String>,

    /// NDJSON input file; stdin when absent
    #[arg(long, short, env = "STREAMER_INPUT")]
    pub input: Option<PathBuf>,

    /// TOML configuration file. Replaces every other option except --input.
    #[serde(skip)]
    #[arg(long, env = "STREAMER_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "STREAMER_LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "STREAMER_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Maximum queued messages; 0 leaves the queue unbounded
    #[arg(long, env = "STREAMER_QUEUE_MAX_LENGTH", default_value = "100000")]
    pub queue_max_length: usize,

    /// Number of delivery threads
    #[arg(long, env = "STREAMER_CONSUMERS", default_value = "1")]
    pub consumers: usize,

    /// Merge spans, traces and feedback into batch messages
    #[arg(long, env = "STREAMER_BATCHING", default_value_t = true, action = ArgAction::Set)]
    pub batching: bool,

    /// Maximum items per batch message
    #[arg(long, env = "STREAMER_BATCH_SIZE", default_value = "1000")]
    pub batch_size: usize,

    /// Maximum age of a pending batch in milliseconds
    #[arg(long, env = "STREAMER_FLUSH_INTERVAL_MS", default_value = "1000")]
    pub flush_interval_ms: u64,

    /// Payload budget of span and trace batches in megabytes
    #[arg(long, env = "STREAMER_MAX_PAYLOAD_MB", default_value = "50")]
    pub max_payload_mb: f64,

    /// Consecutive failures before the connection is considered lost
    #[arg(long, env = "STREAMER_FAILURE_THRESHOLD", default_value = "3")]
    pub failure_threshold: u32,

    /// Minimum time between health probes in milliseconds
    #[arg(long, env = "STREAMER_HEALTH_PROBE_INTERVAL_MS", default_value = "5000")]
    pub health_probe_interval_ms: u64,

    /// How often the replay thread checks the connection, in milliseconds
    #[arg(long, env = "STREAMER_REPLAY_TICK_MS", default_value = "300")]
    pub replay_tick_ms: u64,

    /// Rows fetched per replay page
    #[arg(long, env = "STREAMER_REPLAY_BATCH_SIZE", default_value = "200")]
    pub replay_batch_size: usize,

    /// Parent directory of the replay database; system temp dir when absent
    #[arg(long, env = "STREAMER_REPLAY_DIR")]
    pub replay_dir: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, env = "STREAMER_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    /// Gzip request bodies at or above this many bytes; 0 disables
    #[arg(long, env = "STREAMER_COMPRESSION_THRESHOLD", default_value = "16384")]
    pub compression_threshold: usize,

    /// Time allowed for draining on exit, in seconds
    #[arg(long, env = "STREAMER_CLOSE_TIMEOUT_SECS", default_value = "10")]
    pub close_timeout_secs: u64,

    /// Retry policy (config file only)
    #[arg(skip)]
    pub retry: RetrySettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:5173/api/".to_string(),
            api_key: None,
            workspace: None,
            input: None,
            config_file: None,
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            queue_max_length: 100_000,
            consumers: 1,
            batching: true,
            batch_size: 1000,
            flush_interval_ms: 1000,
            max_payload_mb: 50.0,
            failure_threshold: 3,
            health_probe_interval_ms: 5000,
            replay_tick_ms: 300,
            replay_batch_size: 200,
            replay_dir: None,
            request_timeout_secs: 30,
            compression_threshold: 16 * 1024,
            close_timeout_secs: 10,
            retry: RetrySettings::default(),
        }
    }
}

impl Config {
    /// Parses arguments (with environment fallbacks), loads the config file
    /// if one is named, and validates the result.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Config::try_parse_from(args)?;
        let config = match &cli.config_file {
            Some(path) => {
                let file = Self::read_file(path)?;
                Config {
                    input: cli.input.clone().or(file.input),
                    config_file: cli.config_file.clone(),
                    ..file
                }
            }
            None => cli,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn to_streamer_config(&self) -> StreamerConfig {
        let flush_interval = Duration::from_millis(self.flush_interval_ms);
        let plain = BatchConfig {
            max_batch_size: self.batch_size,
            flush_interval,
            max_payload_mb: None,
        };
        let size_limited = BatchConfig {
            max_payload_mb: Some(self.max_payload_mb),
            ..plain.clone()
        };

        StreamerConfig {
            queue_max_length: (self.queue_max_length > 0).then_some(self.queue_max_length),
            consumer_count: self.consumers,
            use_batching: self.batching,
            batching: BatchingConfig {
                spans: size_limited.clone(),
                traces: size_limited,
                feedback_scores: plain.clone(),
                guardrails: plain.clone(),
                experiment_items: plain,
                ..BatchingConfig::default()
            },
            monitor: MonitorConfig {
                failure_threshold: self.failure_threshold,
                probe_interval: Duration::from_millis(self.health_probe_interval_ms),
            },
            replay: ReplayConfig {
                tick_interval: Duration::from_millis(self.replay_tick_ms),
                store: StoreConfig {
                    base_dir: self.replay_dir.clone(),
                    replay_batch_size: self.replay_batch_size,
                    ..StoreConfig::default()
                },
            },
            ..StreamerConfig::default()
        }
    }

    pub fn to_processor_config(&self) -> HttpProcessorConfig {
        HttpProcessorConfig {
            base_url: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            workspace: self.workspace.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            compression_threshold: (self.compression_threshold > 0)
                .then_some(self.compression_threshold),
            retry: (&self.retry).into(),
            ..HttpProcessorConfig::default()
        }
    }
}
