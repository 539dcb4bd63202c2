use anyhow::{Context, Result};
use clap::Parser;
use rig_core::{check_best_effort, check_required, validate_base_url, Config, Endpoint};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "preflight")]
#[command(about = "Preflight checks for the xray agent API (URL sanity and read endpoints)")]
struct Args {
    /// Path to configuration file (defaults are used when omitted)
    #[arg(long, env = "RIG_CONFIG")]
    config: Option<PathBuf>,

    /// Agent base URL
    #[arg(long, env = "RIG_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token
    #[arg(long, env = "RIG_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Inbound tag used for the per-inbound checks
    #[arg(long, env = "RIG_TAG")]
    tag: Option<String>,
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
    if let Some(v) = args.base_url {
        config.target.base_url = v;
    }
    if let Some(v) = args.token {
        config.target.token = v;
    }
    if let Some(v) = args.tag {
        config.target.group_tag = v;
    }

    info!("Validating base URL...");
    let base = validate_base_url(&config.target.base_url)
        .with_context(|| format!("Invalid target.base_url: {}", config.target.base_url))?;
    if config.target.token.trim().is_empty() {
        info!("No bearer token configured; expect 401/403 from protected endpoints");
    }

    let client = config.connect("http")?;
    let factory = config.operation_factory();

    println!();
    println!("=== Preflight ===");
    println!("Endpoint: {}", base.as_str().trim_end_matches('/'));
    println!("Inbound tag: {}", config.target.group_tag);
    println!();

    let mut failures = 0u64;
    // Health and status are required; the per-inbound reads are best-effort.
    for endpoint in [Endpoint::Health, Endpoint::Status] {
        let check = check_required(client.as_ref(), &factory.build(endpoint, 0)).await;
        println!("{}", check.line());
        if !check.passed() {
            failures = failures.saturating_add(1);
        }
    }
    for endpoint in [Endpoint::Count, Endpoint::Emails] {
        let check = check_best_effort(client.as_ref(), &factory.build(endpoint, 0)).await;
        println!("{}", check.line());
    }

    if failures > 0 {
        anyhow::bail!("Preflight failed: {failures} required endpoint check(s) failed");
    }

    println!();
    println!("Preflight OK.");
    Ok(())
}
