use crate::client::{HttpClient, MockClient, ServiceClient};
use crate::dispatcher::DispatchPlan;
use crate::endpoint::{Endpoint, OperationFactory};
use crate::mix::TrafficMix;
use crate::orchestrator::BulkSettings;
use crate::preflight::validate_base_url;
use crate::retry::RetryPolicy;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Run configuration. Every field has a default, so an empty file (or no file) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub target: TargetConfig,
    pub load: LoadConfig,
    pub jobs: JobsConfig,
    pub retry: RetryConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p)
                .with_context(|| format!("Failed to load config from {:?}", p)),
            None => Ok(Self::default()),
        }
    }

    fn validate_common(&self) -> anyhow::Result<()> {
        validate_base_url(&self.target.base_url)
            .with_context(|| format!("Invalid target.base_url: {}", self.target.base_url))?;
        if self.target.timeout_ms == 0 {
            bail!("target.timeout_ms must be non-zero");
        }
        if self.output.fail_fast && self.target.token.trim().is_empty() {
            bail!("fail-fast mode requires a bearer token (target.token)");
        }
        if self.retry.max_backoff_ms < self.retry.min_backoff_ms {
            bail!("retry.max_backoff_ms must not be below retry.min_backoff_ms");
        }
        Ok(())
    }

    fn validate_polling(&self) -> anyhow::Result<()> {
        if self.jobs.poll_concurrency == 0 {
            bail!("jobs.poll_concurrency must be non-zero");
        }
        if self.jobs.poll_interval_ms == 0 {
            bail!("jobs.poll_interval_ms must be non-zero");
        }
        if self.jobs.poll_timeout_ms == 0 {
            bail!("jobs.poll_timeout_ms must be non-zero");
        }
        Ok(())
    }

    /// Checks for a mixed-traffic run. Fails before any request is issued.
    pub fn validate_load(&self) -> anyhow::Result<()> {
        self.validate_common()?;
        if self.load.concurrency == 0 {
            bail!("load.concurrency must be non-zero");
        }
        self.traffic_mix()?;
        // Issue and async remove operations start jobs that are polled after dispatch.
        self.validate_polling()?;
        Ok(())
    }

    /// Checks for a bulk job run.
    pub fn validate_jobs(&self) -> anyhow::Result<()> {
        self.validate_common()?;
        if self.jobs.submit_concurrency == 0 {
            bail!("jobs.submit_concurrency must be non-zero");
        }
        if self.jobs.cleanup && self.jobs.cleanup_concurrency == 0 {
            bail!("jobs.cleanup_concurrency must be non-zero when cleanup is enabled");
        }
        self.validate_polling()
    }

    pub fn traffic_mix(&self) -> anyhow::Result<TrafficMix<Endpoint>> {
        let mut entries = Vec::with_capacity(self.load.mix.len());
        for (label, weight) in &self.load.mix {
            let endpoint: Endpoint = label.parse().context("Invalid load.mix entry")?;
            entries.push((endpoint, *weight));
        }
        TrafficMix::new(entries)
    }

    /// Replace the mix from a `label=weight,...` string.
    pub fn set_mix(&mut self, raw: &str) -> anyhow::Result<()> {
        let mix: TrafficMix<Endpoint> = TrafficMix::parse(raw)?;
        self.load.mix = mix
            .entries()
            .iter()
            .map(|(e, w)| (e.label().to_string(), *w))
            .collect();
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            fallback_delay: Duration::from_millis(self.retry.fallback_backoff_ms),
            min_delay: Duration::from_millis(self.retry.min_backoff_ms),
            max_delay: Duration::from_millis(self.retry.max_backoff_ms),
            throttle_status: self.retry.throttle_status,
            hint_field: self.retry.hint_field.clone(),
        }
    }

    pub fn operation_factory(&self) -> OperationFactory {
        OperationFactory::new(self.target.group_tag.clone(), self.scenario.identity_base)
            .with_async_remove(self.jobs.async_remove)
            .with_restore(self.load.restore_batch, self.load.restore_concurrency)
    }

    pub fn bulk_settings(&self) -> BulkSettings {
        BulkSettings {
            submit_concurrency: self.jobs.submit_concurrency,
            poll_concurrency: self.jobs.poll_concurrency,
            cleanup_concurrency: self.jobs.cleanup_concurrency,
            cleanup: self.jobs.cleanup,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.jobs.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.jobs.poll_timeout_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.scenario.run_timeout_ms.map(Duration::from_millis)
    }

    /// Unmeasured phase ahead of the measured run; `None` when `load.warmup` is 0.
    pub fn warmup_plan(&self) -> Option<DispatchPlan> {
        (self.load.warmup > 0).then(|| DispatchPlan {
            total: self.load.warmup,
            first_seq: 0,
            seed: self.scenario.seed.wrapping_add(1),
            run_timeout: None,
            progress_every: 0,
        })
    }

    /// Measured phase. Identities continue after the warmup ones.
    pub fn dispatch_plan(&self) -> DispatchPlan {
        DispatchPlan {
            total: self.load.total,
            first_seq: self.load.warmup,
            seed: self.scenario.seed,
            run_timeout: self.run_timeout(),
            progress_every: self.load.progress_every,
        }
    }

    /// Build the service client for `mode` (`http` or `mock`).
    pub fn connect(&self, mode: &str) -> anyhow::Result<Arc<dyn ServiceClient>> {
        match mode {
            "http" => Ok(Arc::new(
                HttpClient::new(
                    &self.target.base_url,
                    Some(self.target.token.clone()),
                    Duration::from_millis(self.target.timeout_ms),
                )
                .context("Failed to create HTTP client")?,
            )),
            "mock" => Ok(Arc::new(MockClient::new(self.target.mock_delay_ms))),
            other => bail!("Invalid mode: {}, must be 'mock' or 'http'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Seed for the traffic-mix draw
    pub seed: u64,
    /// Simulated identities are `identity_base + sequence`
    pub identity_base: u64,
    /// Optional overall cap on the dispatch phase in milliseconds
    pub run_timeout_ms: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            identity_base: 990_000_000,
            run_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub base_url: String,
    /// Bearer credential; empty sends no Authorization header
    pub token: String,
    /// Default inbound/group tag used in paths and bodies
    pub group_tag: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Simulated latency of the mock client
    pub mock_delay_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:18000".to_string(),
            token: String::new(),
            group_tag: "vless-in".to_string(),
            timeout_ms: 20_000,
            mock_delay_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Operations in the measured phase
    pub total: u64,
    /// Maximum in-flight operations
    pub concurrency: usize,
    /// Unmeasured operations run first
    pub warmup: u64,
    /// Log progress every N completed operations
    pub progress_every: u64,
    /// Endpoint label -> weight; weights must sum to 100
    pub mix: BTreeMap<String, u32>,
    /// Items per restore request
    pub restore_batch: usize,
    /// Concurrency hint sent with restore requests
    pub restore_concurrency: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        let mix = [("health", 5), ("status", 25), ("count", 40), ("emails", 5), ("issue", 25)]
            .into_iter()
            .map(|(l, w)| (l.to_string(), w))
            .collect();
        Self {
            total: 200,
            concurrency: 20,
            warmup: 0,
            progress_every: 100,
            mix,
            restore_batch: 5,
            restore_concurrency: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Units of bulk work (one job per simulated identity)
    pub count: u64,
    pub submit_concurrency: usize,
    pub poll_concurrency: usize,
    pub poll_interval_ms: u64,
    /// Per-job deadline in milliseconds
    pub poll_timeout_ms: u64,
    /// Remove every issued identity after polling
    pub cleanup: bool,
    pub cleanup_concurrency: usize,
    /// Use `async=true` on removal calls
    pub async_remove: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            count: 100,
            submit_concurrency: 10,
            poll_concurrency: 40,
            poll_interval_ms: 1_000,
            poll_timeout_ms: 60_000,
            cleanup: false,
            cleanup_concurrency: 10,
            async_remove: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub fallback_backoff_ms: u64,
    pub min_backoff_ms: u64,
    /// Ceiling on server-supplied hints
    pub max_backoff_ms: u64,
    pub throttle_status: u16,
    pub hint_field: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            fallback_backoff_ms: policy.fallback_delay.as_millis() as u64,
            min_backoff_ms: policy.min_delay.as_millis() as u64,
            max_backoff_ms: policy.max_delay.as_millis() as u64,
            throttle_status: policy.throttle_status,
            hint_field: policy.hint_field,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write per-label `status,latency_ms,tag` CSV files under this directory
    pub csv_dir: Option<PathBuf>,
    /// Abort before load when aggregate health is not 2xx
    pub fail_fast: bool,
}
