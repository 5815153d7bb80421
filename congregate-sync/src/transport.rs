//! Retrying HTTP transport shared by both connectors.
//!
//! Retry rules, applied per request:
//!
//! | response                 | handling                                          |
//! |--------------------------|---------------------------------------------------|
//! | 2xx                      | return the response                               |
//! | 429                      | wait `Retry-After + 1` s, retry; budget untouched |
//! | 5xx / connection failure | wait `backoff * 2^attempt`, retry up to `retries` |
//! | other 4xx                | permanent failure with method, URL, status, body  |
//!
//! The wire itself sits behind [`HttpClient`] so tests script responses and
//! never open a socket. Waits go through an injectable [`Sleeper`].

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use congregate_core::config::TransportConfig;

use crate::error::{SyncError, TransportError};

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// A request carrying a JSON body; sets `Content-Type`.
    pub fn json(method: Method, url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(body.to_string()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Raw `Retry-After` header, when present.
    pub retry_after: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// One HTTP exchange. `Err` means no complete response was received.
pub trait HttpClient: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

// ---------------------------------------------------------------------------
// ureq client
// ---------------------------------------------------------------------------

/// Blocking client over a keep-alive `ureq::Agent`.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl HttpClient for UreqClient {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        let mut call = self.agent.request(request.method.as_str(), &request.url);
        for (name, value) in &request.headers {
            call = call.set(name, value);
        }
        let result = match &request.body {
            Some(body) => call.send_string(body),
            None => call.call(),
        };
        match result {
            Ok(response) => read_response(response),
            // ureq reports 4xx/5xx as errors; they are still responses here.
            Err(ureq::Error::Status(_, response)) => read_response(response),
            Err(ureq::Error::Transport(err)) => Err(err.to_string()),
        }
    }
}

/// Largest body accepted, matching ureq's `into_string` cap.
const BODY_LIMIT: u64 = 10 * 1024 * 1024;

fn read_response(response: ureq::Response) -> Result<HttpResponse, String> {
    let status = response.status();
    let retry_after = response.header("retry-after").map(str::to_string);
    let body = read_body(response.into_reader(), BODY_LIMIT)
        .map_err(|e| format!("failed to read {status} response body: {e}"))?;
    Ok(HttpResponse {
        status,
        retry_after,
        body,
    })
}

fn read_body(reader: impl Read, limit: u64) -> Result<String, String> {
    let mut bytes = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| e.to_string())?;
    if bytes.len() as u64 > limit {
        return Err(format!("body exceeds {limit} bytes"));
    }
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry ceiling for transient failures. 429 waits do not count.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            retries: config.retries,
            backoff: config.backoff(),
        }
    }

    /// Wait before retry number `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Cheap to clone; clones share the underlying client and its connection pool.
#[derive(Clone)]
pub struct Transport {
    client: Arc<dyn HttpClient>,
    policy: RetryPolicy,
    sleeper: Sleeper,
}

impl Transport {
    pub fn new(client: Arc<dyn HttpClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Production transport: ureq agent with the configured timeout and retries.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Arc::new(UreqClient::new(config.timeout())),
            RetryPolicy::from_config(config),
        )
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `request`, retrying per the table in the module docs.
    pub fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut attempt = 0u32;
        loop {
            let failure = match self.client.execute(request) {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) if response.status == 429 => {
                    let wait = rate_limit_wait(response.retry_after.as_deref());
                    warn!(
                        method = request.method.as_str(),
                        url = %request.url,
                        wait_secs = wait.as_secs(),
                        "rate limited"
                    );
                    (self.sleeper)(wait);
                    continue;
                }
                Ok(response) if response.status >= 500 => TransportError::Transient {
                    method: request.method.as_str().to_string(),
                    url: request.url.clone(),
                    status: Some(response.status),
                    detail: response.body,
                },
                Ok(response) => {
                    return Err(TransportError::Permanent {
                        method: request.method.as_str().to_string(),
                        url: request.url.clone(),
                        status: Some(response.status),
                        detail: response.body,
                    })
                }
                Err(message) => TransportError::Transient {
                    method: request.method.as_str().to_string(),
                    url: request.url.clone(),
                    status: None,
                    detail: message,
                },
            };

            if attempt >= self.policy.retries {
                return Err(failure.into_permanent());
            }
            let wait = self.policy.delay(attempt);
            debug!(
                attempt = attempt + 1,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "retrying"
            );
            (self.sleeper)(wait);
            attempt += 1;
        }
    }

    /// [`send`](Self::send) and decode the body as JSON.
    pub fn send_json<T: DeserializeOwned>(
        &self,
        system: &'static str,
        request: &HttpRequest,
    ) -> Result<T, SyncError> {
        let response = self.send(request)?;
        serde_json::from_str(&response.body).map_err(|e| {
            SyncError::decode(
                system,
                format!("{} {}: {e}", request.method.as_str(), request.url),
            )
        })
    }
}

/// `Retry-After` seconds plus one; unparseable or missing values count as one second.
fn rate_limit_wait(retry_after: Option<&str>) -> Duration {
    let secs = retry_after
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(1);
    Duration::from_secs(secs.saturating_add(1))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
