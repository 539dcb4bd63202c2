use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::Parser;
use rig_core::{
    health_gate, outcome_channel, render_label_table, stats_by_label, write_csv, Config,
    DispatchReport, Dispatcher, Endpoint, JobPoller, OutcomeLog,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mixed-load")]
#[command(about = "Mixed read/write traffic against the xray agent API with per-endpoint latency stats")]
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

    /// Default inbound tag
    #[arg(long, env = "RIG_TAG")]
    tag: Option<String>,

    /// Measured operations
    #[arg(long, env = "RIG_TOTAL")]
    total: Option<u64>,

    /// Maximum in-flight operations
    #[arg(long, env = "RIG_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "RIG_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Unmeasured operations run before the measured phase
    #[arg(long, env = "RIG_WARMUP")]
    warmup: Option<u64>,

    /// Traffic mix, e.g. `status=40,count=40,issue=20` (weights sum to 100)
    #[arg(long, env = "RIG_MIX")]
    mix: Option<String>,

    /// Seed for the traffic-mix draw
    #[arg(long, env = "RIG_SEED")]
    seed: Option<u64>,

    /// First simulated identity
    #[arg(long, env = "RIG_IDENTITY_BASE")]
    identity_base: Option<u64>,

    /// Stop launching operations after this many milliseconds
    #[arg(long, env = "RIG_RUN_TIMEOUT_MS")]
    run_timeout_ms: Option<u64>,

    /// Retries after a rate-limited first attempt
    #[arg(long, env = "RIG_RETRY_MAX")]
    retry_max: Option<u32>,

    /// Backoff when a rate-limited response carries no hint
    #[arg(long, env = "RIG_RETRY_FALLBACK_MS")]
    retry_fallback_ms: Option<u64>,

    /// Floor applied to server-supplied hints
    #[arg(long, env = "RIG_RETRY_MIN_MS")]
    retry_min_ms: Option<u64>,

    /// Ceiling applied to server-supplied hints
    #[arg(long, env = "RIG_RETRY_MAX_MS")]
    retry_max_ms: Option<u64>,

    /// Status code that signals rate limiting
    #[arg(long, env = "RIG_RETRY_STATUS")]
    retry_status: Option<u16>,

    /// Body field carrying the millisecond retry hint
    #[arg(long, env = "RIG_RETRY_HINT_FIELD")]
    retry_hint_field: Option<String>,

    /// Write per-label CSV files under this directory
    #[arg(long, env = "RIG_CSV_DIR")]
    csv_dir: Option<PathBuf>,

    /// Abort before load unless /health/full answers 2xx
    #[arg(long, env = "RIG_FAIL_FAST", value_parser = FalseyValueParser::new())]
    fail_fast: bool,

    /// Concurrent status polls for jobs started by issue/remove operations
    #[arg(long, env = "RIG_POLL_CONCURRENCY")]
    poll_concurrency: Option<usize>,

    /// Delay between status reads of one job
    #[arg(long, env = "RIG_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Per-job deadline
    #[arg(long, env = "RIG_POLL_TIMEOUT_MS")]
    poll_timeout_ms: Option<u64>,
}

impl Args {
    fn apply(&self, config: &mut Config) -> Result<()> {
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
        if let Some(v) = self.total {
            config.load.total = v;
        }
        if let Some(v) = self.concurrency {
            config.load.concurrency = v;
        }
        if let Some(v) = self.warmup {
            config.load.warmup = v;
        }
        if let Some(v) = &self.mix {
            config.set_mix(v).context("Invalid --mix")?;
        }
        if let Some(v) = self.seed {
            config.scenario.seed = v;
        }
        if let Some(v) = self.identity_base {
            config.scenario.identity_base = v;
        }
        if let Some(v) = self.run_timeout_ms {
            config.scenario.run_timeout_ms = Some(v);
        }
        if let Some(v) = self.retry_max {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.retry_fallback_ms {
            config.retry.fallback_backoff_ms = v;
        }
        if let Some(v) = self.retry_min_ms {
            config.retry.min_backoff_ms = v;
        }
        if let Some(v) = self.retry_max_ms {
            config.retry.max_backoff_ms = v;
        }
        if let Some(v) = self.retry_status {
            config.retry.throttle_status = v;
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
        if let Some(v) = self.poll_concurrency {
            config.jobs.poll_concurrency = v;
        }
        if let Some(v) = self.poll_interval_ms {
            config.jobs.poll_interval_ms = v;
        }
        if let Some(v) = self.poll_timeout_ms {
            config.jobs.poll_timeout_ms = v;
        }
        Ok(())
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
    args.apply(&mut config)?;
    config.validate_load()?;

    let mix = config.traffic_mix()?;
    let factory = config.operation_factory();
    let client = config.connect(&args.mode)?;

    info!(
        "Starting mixed load against {} ({} client), tag {}",
        config.target.base_url,
        client.name(),
        config.target.group_tag
    );
    info!(
        "total={} concurrency={} warmup={} seed={}",
        config.load.total, config.load.concurrency, config.load.warmup, config.scenario.seed
    );

    if config.output.fail_fast {
        let health = factory.build(Endpoint::Health, 0);
        let check = health_gate(client.as_ref(), &health).await?;
        info!("Health gate passed: {}", check.line());
    }

    let poller = JobPoller::new(client.clone(), config.poll_interval(), config.poll_timeout());
    let dispatcher = Dispatcher::new(client.clone(), config.retry_policy(), config.load.concurrency)
        .with_job_poller(poller, config.jobs.poll_concurrency);

    if let Some(plan) = config.warmup_plan() {
        info!("Warmup: {} operations (not measured)", plan.total);
        dispatcher.warmup(&plan, &mix, &factory).await?;
    }

    let (recorder, collector) = outcome_channel();
    let report = dispatcher
        .run(&config.dispatch_plan(), &mix, &factory, &recorder)
        .await?;
    drop(recorder);
    let log = collector.finish().await?;

    print_summary(&report, &log);

    if let Some(dir) = &config.output.csv_dir {
        let run_id = rig_core::run_id();
        let files = write_csv(dir, &run_id, &log)?;
        for f in files {
            println!("CSV: {}", f.display());
        }
    }

    Ok(())
}

fn print_summary(report: &DispatchReport, log: &OutcomeLog) {
    let elapsed = Duration::from_millis(report.elapsed_ms).as_secs_f64();
    let rps = if elapsed > 0.0 {
        report.dispatched as f64 / elapsed
    } else {
        0.0
    };

    println!("\n=== Mixed Load Summary ===");
    println!(
        "Dispatched: {}/{} in {}ms ({:.1} ops/s)",
        report.dispatched, report.requested, report.elapsed_ms, rps
    );
    if report.cut_short {
        warn!("Run timeout reached; summary covers the dispatched operations only");
    }
    if report.jobs_started > 0 {
        println!(
            "Jobs: started={} done={} error={} timeout={}",
            report.jobs_started, report.jobs.done, report.jobs.error, report.jobs.timeout
        );
    }
    println!("Rate limited (after retries): {}", log.count_tag("rate_limited"));
    println!("Timeouts: {}", log.count_tag("timeout"));
    println!();
    print!("{}", render_label_table(&stats_by_label(log.entries())));
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_read_prefixed_env_and_falsey_flags() {
        Args::command().debug_assert();

        std::env::set_var("RIG_FAIL_FAST", "0");
        std::env::set_var("RIG_TOTAL", "77");
        let args = Args::try_parse_from(["mixed-load"]).unwrap();
        assert!(!args.fail_fast);
        assert_eq!(args.total, Some(77));

        std::env::set_var("RIG_FAIL_FAST", "yes");
        let args = Args::try_parse_from(["mixed-load"]).unwrap();
        assert!(args.fail_fast);

        std::env::remove_var("RIG_FAIL_FAST");
        std::env::remove_var("RIG_TOTAL");
        let mut config = Config::default();
        Args::try_parse_from(["mixed-load", "--mix", "status=60,issue=40"])
            .unwrap()
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.load.mix.len(), 2);
        assert!(!config.output.fail_fast);
    }
}
