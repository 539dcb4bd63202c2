use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Delete => f.write_str("DELETE"),
        }
    }
}

/// One unit of work against the service. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub label: String,
    pub method: Method,
    /// Path plus query, relative to the base URL.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Run through the rate-limit retry policy instead of a single plain attempt.
    pub retry_on_throttle: bool,
}

impl Operation {
    pub fn get(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            method: Method::Get,
            target: target.into(),
            body: None,
            retry_on_throttle: false,
        }
    }

    pub fn post(label: impl Into<String>, target: impl Into<String>, body: Value) -> Self {
        Self {
            label: label.into(),
            method: Method::Post,
            target: target.into(),
            body: Some(body),
            retry_on_throttle: true,
        }
    }

    pub fn delete(label: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            method: Method::Delete,
            target: target.into(),
            body: None,
            retry_on_throttle: true,
        }
    }

    /// Target without its query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }
}

/// Endpoints of the agent API the mixed-traffic run can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Health,
    Status,
    Count,
    Emails,
    Issue,
    Remove,
    Restore,
    Add,
}

impl Endpoint {
    pub const ALL: [Endpoint; 8] = [
        Endpoint::Health,
        Endpoint::Status,
        Endpoint::Count,
        Endpoint::Emails,
        Endpoint::Issue,
        Endpoint::Remove,
        Endpoint::Restore,
        Endpoint::Add,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Endpoint::Health => "health",
            Endpoint::Status => "status",
            Endpoint::Count => "count",
            Endpoint::Emails => "emails",
            Endpoint::Issue => "issue",
            Endpoint::Remove => "remove",
            Endpoint::Restore => "restore",
            Endpoint::Add => "add",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Endpoint::Health | Endpoint::Status | Endpoint::Count | Endpoint::Emails
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        Endpoint::ALL
            .into_iter()
            .find(|e| e.label() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Endpoint::ALL.iter().map(|e| e.label()).collect();
                anyhow::anyhow!("unknown endpoint label '{}', expected one of {:?}", s, known)
            })
    }
}

/// Builds operations for a fixed group tag.
#[derive(Debug, Clone)]
pub struct OperationFactory {
    group_tag: String,
    identity_base: u64,
    async_remove: bool,
    restore_batch: usize,
    restore_concurrency: u32,
}

impl OperationFactory {
    pub fn new(group_tag: impl Into<String>, identity_base: u64) -> Self {
        Self {
            group_tag: group_tag.into(),
            identity_base,
            async_remove: true,
            restore_batch: 5,
            restore_concurrency: 20,
        }
    }

    pub fn with_async_remove(mut self, async_remove: bool) -> Self {
        self.async_remove = async_remove;
        self
    }

    pub fn with_restore(mut self, batch: usize, concurrency: u32) -> Self {
        self.restore_batch = batch.max(1);
        self.restore_concurrency = concurrency.max(1);
        self
    }

    pub fn group_tag(&self) -> &str {
        &self.group_tag
    }

    /// Simulated identity (numeric string) for sequence number `seq`.
    pub fn identity(&self, seq: u64) -> String {
        self.identity_base.saturating_add(seq).to_string()
    }

    pub fn build(&self, endpoint: Endpoint, seq: u64) -> Operation {
        let tag = &self.group_tag;
        match endpoint {
            Endpoint::Health => Operation::get(endpoint.label(), "/health/full"),
            Endpoint::Status => Operation::get(endpoint.label(), "/xray/status"),
            Endpoint::Count => {
                Operation::get(endpoint.label(), format!("/inbounds/{tag}/users/count"))
            }
            Endpoint::Emails => Operation::get(endpoint.label(), format!("/inbounds/{tag}/emails")),
            Endpoint::Issue => self.issue(&self.identity(seq)),
            Endpoint::Remove => self.remove(&self.identity(seq)),
            Endpoint::Restore => {
                let items: Vec<Value> = (0..self.restore_batch as u64)
                    .map(|i| {
                        json!({
                            "email": self.identity(seq.saturating_mul(self.restore_batch as u64) + i),
                            "uuid": uuid::Uuid::new_v4().to_string(),
                        })
                    })
                    .collect();
                Operation::post(
                    endpoint.label(),
                    "/xray/restore",
                    json!({
                        "inbound_tag": tag,
                        "items": items,
                        "precheck": true,
                        "concurrency": self.restore_concurrency,
                    }),
                )
            }
            Endpoint::Add => Operation::post(
                endpoint.label(),
                "/xray/add_user",
                json!({
                    "inbound_tag": tag,
                    "email": self.identity(seq),
                    "uuid": uuid::Uuid::new_v4().to_string(),
                    "precheck": true,
                }),
            ),
        }
    }

    /// Asynchronous job submission for one identity.
    pub fn issue(&self, identity: &str) -> Operation {
        Operation::post(
            Endpoint::Issue.label(),
            "/clients/issue?async=true",
            json!({ "telegram_id": identity, "inbound_tag": self.group_tag }),
        )
    }

    pub fn remove(&self, identity: &str) -> Operation {
        let mut target = format!("/clients/{}?inbound_tag={}", identity, self.group_tag);
        if self.async_remove {
            target.push_str("&async=true");
        }
        Operation::delete(Endpoint::Remove.label(), target)
    }
}

/// Job status lookup. Read-only, never retried.
pub fn job_status(job_id: &str) -> Operation {
    Operation::get("job", format!("/jobs/{job_id}"))
}
