//! HTTP ingest storage backend.
//!
//! Posts every query as JSON to an ingest endpoint, with connection pooling,
//! retry logic with exponential backoff, and per-request timeouts. Settings:
//!
//! - `url`: ingest endpoint (required)
//! - `request_timeout_ms`: per-request timeout (default 30000)
//! - `max_retries`: retry attempts for transient failures (default 3)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Connection, Query, StorageError, StorageFactory};
use crate::config::DeviceEntry;

/// Adapter type name served by this backend.
pub const HTTP_ADAPTER_TYPE: &str = "JsonAdapter";

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Default request timeout (in milliseconds).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default number of retries.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Response from the ingest endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    /// Status message from the API
    pub status: String,

    /// Number of records accepted
    #[serde(default)]
    pub accepted: u64,

    /// Optional error message
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HttpSettings {
    url: String,
    #[serde(default = "default_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Outcome of one HTTP attempt.
#[derive(Debug)]
enum Attempt {
    Accepted(IngestResponse),
    Status { code: StatusCode, body: String },
    Transport(reqwest::Error),
    Parse(String),
}

impl Attempt {
    /// Connection errors, timeouts, 5xx and 429 are worth retrying.
    fn is_retryable(&self) -> bool {
        match self {
            Attempt::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Attempt::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            Attempt::Accepted(_) | Attempt::Parse(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Attempt::Accepted(r) => format!("accepted ({})", r.status),
            Attempt::Status { code, body } => format!("server error ({}): {}", code, body),
            Attempt::Transport(e) if e.is_timeout() => "request timed out".to_string(),
            Attempt::Transport(e) => format!("http request failed: {}", e),
            Attempt::Parse(e) => format!("failed to parse response: {}", e),
        }
    }
}

/// Factory for the HTTP ingest backend.
#[derive(Debug, Default)]
pub struct HttpStorageFactory {
    settings: Option<HttpSettings>,
}

impl HttpStorageFactory {
    /// Create an uninitialized factory.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageFactory for HttpStorageFactory {
    fn initialize_layer(&mut self, settings: &serde_json::Value) -> Result<(), StorageError> {
        let settings: HttpSettings = serde_json::from_value(settings.clone())
            .map_err(|e| StorageError::InvalidSettings(e.to_string()))?;

        let url = settings.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StorageError::InvalidSettings(format!(
                "'{}' is not an http(s) url",
                settings.url
            )));
        }
        if settings.request_timeout_ms == 0 {
            return Err(StorageError::InvalidSettings(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        debug!(url = %url, max_retries = settings.max_retries, "HTTP storage layer initialized");
        self.settings = Some(HttpSettings {
            url: url.to_string(),
            ..settings
        });
        Ok(())
    }

    fn create_connection(&self) -> Result<Box<dyn Connection>, StorageError> {
        let settings = self.settings.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(Box::new(HttpConnection::with_settings(
            settings.url.clone(),
            Duration::from_millis(settings.request_timeout_ms),
            settings.max_retries,
        )))
    }

    fn adapter_type_name(&self, _device: &DeviceEntry) -> String {
        HTTP_ADAPTER_TYPE.to_string()
    }
}

/// Connection to an HTTP ingest endpoint.
///
/// The underlying client is built on `connect` and reused for connection
/// pooling until `disconnect`.
#[derive(Debug)]
pub struct HttpConnection {
    client: Option<Client>,
    ingest_url: String,
    timeout: Duration,
    max_retries: u32,
    last_response: String,
}

impl HttpConnection {
    /// Create a closed connection with explicit settings.
    pub fn with_settings(ingest_url: impl Into<String>, timeout: Duration, max_retries: u32) -> Self {
        Self {
            client: None,
            ingest_url: ingest_url.into(),
            timeout,
            max_retries,
            last_response: String::new(),
        }
    }

    /// Get the configured ingest URL.
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Get the maximum number of retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a single HTTP request without retry logic.
    async fn send_request(&self, client: &Client, query: &Query) -> Attempt {
        let response = match client
            .post(&self.ingest_url)
            .timeout(self.timeout)
            .json(query)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Attempt::Transport(e),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Attempt::Transport(e),
        };

        if status.is_success() {
            match serde_json::from_str::<IngestResponse>(&body) {
                Ok(parsed) => Attempt::Accepted(parsed),
                Err(e) => Attempt::Parse(e.to_string()),
            }
        } else {
            Attempt::Status { code: status, body }
        }
    }

    /// Calculate the backoff delay for a given retry attempt.
    ///
    /// delay = min(base_delay * 2^attempt + jitter, max_delay)
    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponential_delay = DEFAULT_BASE_DELAY_MS.saturating_mul(1 << attempt.min(10));

        // Add jitter (up to 25% of the delay)
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn connect(&mut self) -> Result<(), StorageError> {
        if self.client.is_some() {
            return Ok(());
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        self.client = Some(client);
        debug!(url = %self.ingest_url, "HTTP connection opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        if self.client.take().is_some() {
            debug!(url = %self.ingest_url, "HTTP connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn execute_query(&mut self, query: &Query) -> Result<bool, StorageError> {
        let client = self.client.clone().ok_or(StorageError::NotConnected)?;
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt);
                warn!(
                    attempt = attempt,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis(),
                    request = %query.id(),
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }

            let outcome = self.send_request(&client, query).await;
            self.last_response = outcome.describe();

            match outcome {
                Attempt::Accepted(response) => {
                    debug!(request = %query.id(), accepted = response.accepted, "Query accepted");
                    return Ok(true);
                }
                failed if failed.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                }
                failed => {
                    if failed.is_retryable() {
                        self.last_response = format!(
                            "all {} attempts exhausted, last error: {}",
                            attempt + 1,
                            self.last_response
                        );
                    }
                    return Ok(false);
                }
            }
        }
    }

    fn last_response(&self) -> String {
        self.last_response.clone()
    }
}
