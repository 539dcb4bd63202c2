use anyhow::Result;
use clap::builder::FalseyValueParser;
use clap::Parser;
use rig_core::{
    outcome_channel, render_bulk_report, render_label_table, stats_by_label, write_csv,
    BulkOrchestrator, Config, Endpoint, JobPoller, WorkUnit,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bulk-issue")]
#[command(about = "Submit async client-issue jobs, poll them to a terminal state and optionally clean up")]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(long, env = "RIG_CONFIG")]
    config: Option<PathBuf>,

    /// Client mode: mock or http
    #[arg(long, env = "RIG_MODE", default_value = "http")]
    mode: String,

    /// Agent base URL
    #[arg(long, env = "RIG_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "RIG_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Inbound tag the clients are issued into
    #[arg(long, env = "RIG_TAG")]
    tag: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "RIG_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Number of jobs (one per simulated identity)
    #[arg(long, env = "RIG_COUNT")]
    count: Option<u64>,

    /// First simulated identity; job N uses `identity_base + N`
    #[arg(long, env = "RIG_IDENTITY_BASE")]
    identity_base: Option<u64>,

    #[arg(long, env = "RIG_SUBMIT_CONCURRENCY")]
    submit_concurrency: Option<usize>,

    #[arg(long, env = "RIG_POLL_CONCURRENCY")]
    poll_concurrency: Option<usize>,

    /// Delay between status reads of one job
    #[arg(long, env = "RIG_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Per-job deadline
    #[arg(long, env = "RIG_POLL_TIMEOUT_MS")]
    poll_timeout_ms: Option<u64>,

    /// Remove every issued client after polling
    #[arg(long, env = "RIG_CLEANUP", value_parser = FalseyValueParser::new())]
    cleanup: bool,

    /// Remove clients synchronously instead of through removal jobs
    #[arg(long, env = "RIG_SYNC_REMOVE", value_parser = FalseyValueParser::new())]
    sync_remove: bool,

    #[arg(long, env = "RIG_CLEANUP_CONCURRENCY")]
    cleanup_concurrency: Option<usize>,

    /// Retries after a rate-limited first attempt
    #[arg(long, env = "RIG_RETRY_MAX")]
    retry_max: Option<u32>,

    /// Backoff when a rate-limited response carries no hint
    #[arg(long, env = "RIG_RETRY_FALLBACK_MS")]
    retry_fallback_ms: Option<u64>,

    /// Ceiling applied to server-supplied hints
    #[arg(long, env = "RIG_RETRY_MAX_MS")]
    retry_max_ms: Option<u64>,

    /// Body field carrying the millisecond retry hint
    #[arg(long, env = "RIG_RETRY_HINT_FIELD")]
    retry_hint_field: Option<String>,

    /// Write per-label CSV files under this directory
    #[arg(long, env = "RIG_CSV_DIR")]
    csv_dir: Option<PathBuf>,

    /// Abort before submitting unless /health/full answers 2xx
    #[arg(long, env = "RIG_FAIL_FAST", value_parser = FalseyValueParser::new())]
    fail_fast: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = &self.base_url {
            config.target.base_url = v.clone();
        }
        if let Some(v) = &self.token {
            config.target.token = v.clone();
        }
        if let Some(v) = &self.tag {
            config.target.group_tag = v.clone();
        }
        if let Some(v) = self.timeout_ms {
            config.target.timeout_ms = v;
        }
        if let Some(v) = self.count {
            config.jobs.count = v;
        }
        if let Some(v) = self.identity_base {
            config.scenario.identity_base = v;
        }
        if let Some(v) = self.submit_concurrency {
            config.jobs.submit_concurrency = v;
        }
        if let Some(v) = self.poll_concurrency {
            config.jobs.poll_concurrency = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.jobs.poll_interval_ms = v;
        }
        if let Some(v) = self.poll_timeout_ms {
            config.jobs.poll_timeout_ms = v;
        }
        if self.cleanup {
            config.jobs.cleanup = true;
        }
        if self.sync_remove {
            config.jobs.async_remove = false;
        }
        if let Some(v) = self.cleanup_concurrency {
            config.jobs.cleanup_concurrency = v;
        }
        if let Some(v) = self.retry_max {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.retry_fallback_ms {
            config.retry.fallback_backoff_ms = v;
        }
        if let Some(v) = self.retry_max_ms {
            config.retry.max_backoff_ms = v;
        }
        if let Some(v) = &self.retry_hint_field {
            config.retry.hint_field = v.clone();
        }
        if let Some(v) = &self.csv_dir {
            config.output.csv_dir = Some(v.clone());
        }
        if self.fail_fast {
            config.output.fail_fast = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate_jobs()?;

    let client = config.connect(&args.mode)?;
    let factory = config.operation_factory();

    info!(
        "Bulk issue against {} ({} client): {} jobs into {}",
        config.target.base_url,
        client.name(),
        config.jobs.count,
        config.target.group_tag
    );
    info!(
        "submit_concurrency={} poll_concurrency={} poll_interval={}ms poll_timeout={}ms cleanup={} async_remove={}",
        config.jobs.submit_concurrency,
        config.jobs.poll_concurrency,
        config.jobs.poll_interval_ms,
        config.jobs.poll_timeout_ms,
        config.jobs.cleanup,
        config.jobs.async_remove
    );

    let units: Vec<WorkUnit> = (1..=config.jobs.count)
        .map(|seq| WorkUnit::issue(&factory, seq))
        .collect();

    let poller = JobPoller::new(client.clone(), config.poll_interval(), config.poll_timeout());
    let mut orchestrator =
        BulkOrchestrator::new(client, config.retry_policy(), poller, config.bulk_settings())
            .with_count_query(factory.build(Endpoint::Count, 0));
    if config.output.fail_fast {
        orchestrator = orchestrator.with_health_gate(factory.build(Endpoint::Health, 0));
    }

    let (recorder, collector) = outcome_channel();
    let report = orchestrator.run(units, &recorder).await?;
    drop(recorder);
    let log = collector.finish().await?;

    println!("\n=== Bulk Issue Summary ===");
    print!("{}", render_bulk_report(&report));
    println!();
    print!("{}", render_label_table(&stats_by_label(log.entries())));
    println!();

    if let Some(dir) = &config.output.csv_dir {
        let run_id = rig_core::run_id();
        for f in write_csv(dir, &run_id, &log)? {
            println!("CSV: {}", f.display());
        }
    }

    Ok(())
}
