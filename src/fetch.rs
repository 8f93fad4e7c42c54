//! Shared outbound HTTP primitive: timeout, bounded retries with exponential
//! backoff, and classification of failures into retryable and terminal.
//!
//! Every source adapter goes through [`Fetcher`]; none of them carries its
//! own retry loop.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use thiserror::Error;

use crate::error::{EnrichError, ErrorClass};
use crate::rate_limit::RateLimiter;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Network(String),

    #[error("request could not be built: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Network(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            TransportError::Network(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// The raw network call, separated out so retry behaviour can be exercised
/// without a network.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<RawResponse, TransportError>;

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, EnrichError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, user_agent(env!("CARGO_PKG_VERSION"))?);
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| {
                EnrichError::upstream(
                    "http",
                    FetchError::Request {
                        url: String::new(),
                        message: err.to_string(),
                    },
                )
            })?;
        Ok(Self { client })
    }
}

pub fn user_agent(version: &str) -> Result<HeaderValue, EnrichError> {
    HeaderValue::from_str(&format!("taxon-enricher/{version}")).map_err(|err| {
        EnrichError::upstream(
            "http",
            FetchError::Request {
                url: String::new(),
                message: format!("invalid user agent: {err}"),
            },
        )
    })
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<RawResponse, TransportError> {
        let response = self.client.get(url).query(query).send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok(RawResponse { status, body })
    }

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<RawResponse, TransportError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Ok(RawResponse { status, body })
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("rate limited after {attempts} attempts: {url}")]
    RateLimited { url: String, attempts: u32 },

    #[error("rejected with status {status}: {url}")]
    Rejected { url: String, status: u16 },

    #[error("gave up after {attempts} attempts: {cause}")]
    Transient { attempts: u32, cause: String },

    #[error("invalid request to {url}: {message}")]
    Request { url: String, message: String },

    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    fn from_transport(url: &str, err: TransportError) -> Self {
        FetchError::Request {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::RateLimited { .. } | FetchError::Transient { .. } => ErrorClass::Transient,
            FetchError::NotFound { .. }
            | FetchError::Rejected { .. }
            | FetchError::Request { .. }
            | FetchError::Decode { .. } => ErrorClass::Terminal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

enum Retry {
    RateLimited,
    Transient(String),
}

#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            limiter: None,
        }
    }

    pub fn http(timeout: Duration, policy: RetryPolicy) -> Result<Self, EnrichError> {
        Ok(Self::new(Arc::new(HttpTransport::new(timeout)?), policy))
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn get_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.acquire(url);
            }

            let retry = match self.transport.get(url, query) {
                Ok(resp) if (200..300).contains(&resp.status) => return Ok(resp.body),
                Ok(resp) if matches!(resp.status, 404 | 410) => {
                    return Err(FetchError::NotFound {
                        url: url.to_string(),
                    });
                }
                Ok(resp) if resp.status == 429 => Retry::RateLimited,
                Ok(resp) if resp.status >= 500 => {
                    Retry::Transient(format!("server returned status {}", resp.status))
                }
                Ok(resp) => {
                    return Err(FetchError::Rejected {
                        url: url.to_string(),
                        status: resp.status,
                    });
                }
                Err(err) if err.is_retryable() => Retry::Transient(err.to_string()),
                Err(err) => return Err(FetchError::from_transport(url, err)),
            };

            if attempt >= max_attempts {
                return Err(match retry {
                    Retry::RateLimited => FetchError::RateLimited {
                        url: url.to_string(),
                        attempts: attempt,
                    },
                    Retry::Transient(cause) => FetchError::Transient {
                        attempts: attempt,
                        cause,
                    },
                });
            }

            let delay = self.policy.delay_after(attempt);
            match &retry {
                Retry::RateLimited => {
                    tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, "rate limited; backing off")
                }
                Retry::Transient(cause) => {
                    tracing::debug!(url, attempt, delay_ms = delay.as_millis() as u64, %cause, "retrying request")
                }
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }

    pub fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, FetchError> {
        let body = self.get_text(url, query)?;
        serde_json::from_str(&body).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    /// Single-attempt POST; returns the response status.
    pub fn post_json(
        &self,
        url: &str,
        body: &Value,
        bearer: Option<&str>,
    ) -> Result<u16, FetchError> {
        let response = self
            .transport
            .post_json(url, body, bearer)
            .map_err(|err| match err {
                err if err.is_retryable() => FetchError::Transient {
                    attempts: 1,
                    cause: err.to_string(),
                },
                err => FetchError::from_transport(url, err),
            })?;
        if (200..300).contains(&response.status) {
            Ok(response.status)
        } else {
            Err(FetchError::Rejected {
                url: url.to_string(),
                status: response.status,
            })
        }
    }
}
