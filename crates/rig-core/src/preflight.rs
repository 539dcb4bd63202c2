use crate::client::ServiceClient;
use crate::endpoint::Operation;
use crate::outcome::{is_success, TRANSPORT_FAILURE_STATUS};
use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::warn;

/// Slow best-effort checks warn but never fail.
pub const SLOW_CHECK_WARN_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub label: String,
    pub target: String,
    /// 0 when no response arrived.
    pub status: u16,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        is_success(self.status)
    }

    pub fn line(&self) -> String {
        match &self.error {
            Some(_) => format!("GET {:<28} -> ERROR ({}ms)", self.target, self.latency_ms),
            None => format!(
                "GET {:<28} -> {} ({}ms)",
                self.target, self.status, self.latency_ms
            ),
        }
    }
}

/// The base URL must be plain http(s) with no credentials, query or fragment.
pub fn validate_base_url(raw: &str) -> Result<url::Url> {
    let url = url::Url::parse(raw).with_context(|| format!("Invalid URL: {raw}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("Base URL must be http:// or https:// (got {raw})");
    }
    if !url.username().is_empty() || url.password().is_some() {
        bail!("Base URL must not include credentials (got {raw})");
    }
    if url.host_str().is_none() {
        bail!("Base URL must include a hostname (got {raw})");
    }
    if url.query().is_some() || url.fragment().is_some() {
        bail!("Base URL must not include query/fragment (got {raw})");
    }

    Ok(url)
}

/// One timed plain attempt, classified into a [`CheckResult`].
async fn run_check(client: &dyn ServiceClient, op: &Operation) -> CheckResult {
    let start = Instant::now();
    let result = client.execute(op).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let (status, error) = match result {
        Ok(r) => (r.status, None),
        Err(e) => (TRANSPORT_FAILURE_STATUS, Some(e.to_string())),
    };
    CheckResult {
        label: op.label.clone(),
        target: op.target.clone(),
        status,
        latency_ms,
        error,
    }
}

/// One plain attempt against `op`. Request failures are reported, not returned.
pub async fn check_required(client: &dyn ServiceClient, op: &Operation) -> CheckResult {
    let check = run_check(client, op).await;
    if !check.passed() {
        match &check.error {
            Some(e) => warn!("Required endpoint request failed: {} error={}", op.target, e),
            None => warn!("Required endpoint returned non-2xx: {} {}", op.target, check.status),
        }
    }
    check
}

/// Like [`check_required`], but only warns.
pub async fn check_best_effort(client: &dyn ServiceClient, op: &Operation) -> CheckResult {
    let check = run_check(client, op).await;
    if check.latency_ms > SLOW_CHECK_WARN_MS {
        warn!(
            "{} is slow: {}ms (threshold {}ms)",
            op.target, check.latency_ms, SLOW_CHECK_WARN_MS
        );
    }
    if let Some(e) = &check.error {
        warn!("{} request failed (best-effort): {}", op.target, e);
    } else if !check.passed() {
        warn!("{} returned {} (best-effort)", op.target, check.status);
    }
    check
}

/// Abort unless the aggregate health endpoint answers 2xx.
pub async fn health_gate(client: &dyn ServiceClient, health: &Operation) -> Result<CheckResult> {
    let check = check_required(client, health).await;
    if !check.passed() {
        match &check.error {
            Some(e) => bail!("Health check {} failed: {}", health.target, e),
            None => bail!("Health check {} returned {}", health.target, check.status),
        }
    }
    Ok(check)
}
