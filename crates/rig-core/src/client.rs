use crate::endpoint::{Method, Operation};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A response that made it back from the service, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    /// Decoded JSON body; `None` when the body was empty or not JSON.
    pub body: Option<Value>,
}

impl Response {
    pub fn new(status: u16, body: Option<Value>) -> Self {
        Self { status, body }
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.as_ref().and_then(|b| b.get(name))
    }

    /// Non-empty string field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// No HTTP response was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Outcome tag for this failure.
    pub fn tag(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            _ => "transport_error",
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Trait for adapters that carry an operation to the service.
pub trait ServiceClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        op: &'a Operation,
    ) -> BoxFuture<'a, std::result::Result<Response, TransportError>>;
}

/// HTTP/JSON client for the agent API.
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpClient {
    /// An empty token sends no `Authorization` header; the service will answer 401/403.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, target: &str) -> String {
        if target.starts_with('/') {
            format!("{}{}", self.base_url, target)
        } else {
            format!("{}/{}", self.base_url, target)
        }
    }
}

impl ServiceClient for HttpClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        op: &'a Operation,
    ) -> BoxFuture<'a, std::result::Result<Response, TransportError>> {
        Box::pin(async move {
            let url = self.url(&op.target);
            let mut request = match op.method {
                Method::Get => self.client.get(&url),
                Method::Post => self.client.post(&url),
                Method::Delete => self.client.delete(&url),
            };
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = &op.body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await?;

            Ok(Response::new(status, decode_body(&bytes)))
        })
    }
}

fn decode_body(bytes: &[u8]) -> Option<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    serde_json::from_slice(bytes).ok()
}

/// In-process stand-in for the agent API (fixed delay, every job finishes `done`).
pub struct MockClient {
    delay_ms: u64,
    next_job: AtomicU64,
}

impl MockClient {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            next_job: AtomicU64::new(1),
        }
    }

    fn respond(&self, op: &Operation) -> Response {
        let path = op.path();
        match op.method {
            Method::Post if path == "/clients/issue" => {
                let id = self.next_job.fetch_add(1, Ordering::Relaxed);
                Response::json(
                    202,
                    json!({ "status": "queued", "job_id": format!("mock-{id}"), "deduped": false }),
                )
            }
            Method::Post if path == "/xray/restore" => {
                let total = op
                    .body
                    .as_ref()
                    .and_then(|b| b.get("items"))
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Response::json(200, json!({ "total": total, "added": total, "errors": 0 }))
            }
            Method::Post => Response::json(200, json!({ "ok": true, "detail": "added" })),
            Method::Delete if op.target.contains("async=true") => {
                let id = self.next_job.fetch_add(1, Ordering::Relaxed);
                Response::json(200, json!({ "job_id": format!("mock-{id}") }))
            }
            Method::Delete => Response::json(200, json!({ "result": true })),
            Method::Get if path.starts_with("/jobs/") => {
                let id = path.trim_start_matches("/jobs/");
                Response::json(200, json!({ "id": id, "state": "done", "ts": 0 }))
            }
            Method::Get if path.ends_with("/users/count") => {
                Response::json(200, json!({ "result": 0 }))
            }
            Method::Get if path.ends_with("/emails") => Response::json(200, json!({ "result": [] })),
            Method::Get => Response::json(200, json!({ "ok": true })),
        }
    }
}

impl ServiceClient for MockClient {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        op: &'a Operation,
    ) -> BoxFuture<'a, std::result::Result<Response, TransportError>> {
        Box::pin(async move {
            sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(self.respond(op))
        })
    }
}
