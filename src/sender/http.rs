use super::serialization::{EncodedBody, RequestEncoder};
use super::{MessageProcessor, ProcessError};
use crate::domain::Message;
use crate::reliability::{ConnectionProbe, RetryConfig, RetryManager};
use reqwest::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER,
};
use reqwest::{Client, ClientBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;
use url::Url;

const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
const WORKSPACE_HEADER: HeaderName = HeaderName::from_static("comet-workspace");

#[derive(Error, Debug)]
pub enum HttpProcessorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Failed to start HTTP runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HttpProcessorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub workspace: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Request bodies at or above this size are gzipped; `None` disables.
    pub compression_threshold: Option<usize>,
    pub health_path: String,
    pub retry: RetryConfig,
    pub runtime_threads: usize,
}

impl Default for HttpProcessorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5173/api/".to_string(),
            api_key: None,
            workspace: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("trace-streamer/", env!("CARGO_PKG_VERSION")).to_string(),
            compression_threshold: Some(super::serialization::DEFAULT_COMPRESSION_THRESHOLD),
            health_path: "/is-alive/ping".to_string(),
            retry: RetryConfig::default(),
            runtime_threads: 2,
        }
    }
}

enum Attempt {
    Done(Result<(), ProcessError>),
    Retryable(String),
}

/// Sends messages to the REST backend from consumer threads.
///
/// Owns a small tokio runtime; each `process` call blocks the calling
/// consumer thread on it.
pub struct HttpMessageProcessor {
    client: Client,
    base_url: Url,
    encoder: RequestEncoder,
    retry: RetryManager,
    runtime: Arc<Runtime>,
    config: HttpProcessorConfig,
}

impl HttpMessageProcessor {
    pub fn new(config: HttpProcessorConfig) -> Result<Self, HttpProcessorError> {
        let base_url = parse_base_url(&config.base_url)?;
        config
            .retry
            .validate()
            .map_err(|e| HttpProcessorError::InvalidConfiguration(e.to_string()))?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = &config.api_key {
            headers.insert(AUTHORIZATION, header_value(api_key, "api key")?);
        }
        if let Some(workspace) = &config.workspace {
            headers.insert(WORKSPACE_HEADER, header_value(workspace, "workspace")?);
        }

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .build()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads.max(1))
            .thread_name("http-processor")
            .enable_all()
            .build()?;

        Ok(Self {
            client,
            base_url,
            encoder: RequestEncoder::new(config.compression_threshold),
            retry: RetryManager::new(config.retry.clone()),
            runtime: Arc::new(runtime),
            config,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Probe for the connection monitor, sharing this processor's client.
    pub fn health_probe(&self) -> Result<HttpHealthProbe, HttpProcessorError> {
        let url = join(&self.base_url, &self.config.health_path)?;
        Ok(HttpHealthProbe {
            client: self.client.clone(),
            runtime: self.runtime.clone(),
            url,
        })
    }

    fn send_once(&self, url: &Url, request: &EncodedBody) -> Attempt {
        let mut builder = self
            .client
            .request(request.method.clone(), url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        if request.gzipped {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }

        let response = match self.runtime.block_on(builder.send()) {
            Ok(response) => response,
            Err(e) => return Attempt::Retryable(e.to_string()),
        };

        let status = response.status();
        if status.is_success() {
            return Attempt::Done(Ok(()));
        }
        match status {
            StatusCode::CONFLICT => Attempt::Done(Err(ProcessError::Conflict(status.to_string()))),
            StatusCode::TOO_MANY_REQUESTS => Attempt::Done(Err(ProcessError::RateLimited {
                retry_after: retry_after(response.headers()),
            })),
            StatusCode::REQUEST_TIMEOUT => Attempt::Retryable(status.to_string()),
            s if s.is_client_error() => {
                Attempt::Done(Err(ProcessError::Rejected(status.to_string())))
            }
            _ => Attempt::Retryable(status.to_string()),
        }
    }
}

impl MessageProcessor for HttpMessageProcessor {
    fn process(&self, message: &Message) -> Result<(), ProcessError> {
        let request = self
            .encoder
            .encode(message)
            .map_err(|e| ProcessError::Rejected(e.to_string()))?;
        let url = join(&self.base_url, &request.path)
            .map_err(|e| ProcessError::Rejected(e.to_string()))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.send_once(&url, &request) {
                Attempt::Done(result) => return result,
                Attempt::Retryable(reason) if self.retry.should_retry(attempts) => {
                    let delay = self.retry.calculate_delay(attempts - 1);
                    tracing::debug!(
                        message_type = %message.message_type(),
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %reason,
                        "Retrying delivery"
                    );
                    std::thread::sleep(delay);
                }
                Attempt::Retryable(reason) => {
                    return Err(ProcessError::Connection(format!(
                        "{reason} after {attempts} attempts"
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for HttpMessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpMessageProcessor")
            .field("base_url", &self.base_url.as_str())
            .field("retry", self.retry.config())
            .finish()
    }
}

/// Pings the backend's liveness endpoint.
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: Client,
    runtime: Arc<Runtime>,
    url: Url,
}

impl ConnectionProbe for HttpHealthProbe {
    fn check(&self) -> bool {
        let request = self.client.get(self.url.clone()).send();
        match self.runtime.block_on(request) {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, url = %self.url, "Health probe failed");
                false
            }
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, HttpProcessorError> {
    let mut url = Url::parse(raw)
        .map_err(|e| HttpProcessorError::InvalidConfiguration(format!("Invalid base URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(HttpProcessorError::InvalidConfiguration(format!(
            "Unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn join(base: &Url, path: &str) -> Result<Url, HttpProcessorError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| HttpProcessorError::InvalidConfiguration(format!("Invalid path {path}: {e}")))
}

fn header_value(value: &str, what: &str) -> Result<HeaderValue, HttpProcessorError> {
    HeaderValue::from_str(value)
        .map_err(|_| HttpProcessorError::InvalidConfiguration(format!("Invalid {what} header value")))
}

/// Delay requested by a 429 response: `Retry-After`, then `RateLimit-Reset`,
/// both in seconds.
pub fn retry_after(headers: &HeaderMap) -> Duration {
    [RETRY_AFTER, RATE_LIMIT_RESET]
        .iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_RATE_LIMIT_DELAY)
}
