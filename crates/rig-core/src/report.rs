use crate::orchestrator::BulkReport;
use crate::outcome::OutcomeLog;
use crate::stats::RunStats;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// Run identifier derived from the current UTC time.
pub fn run_id() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// One line per label: `label total ok err err% min avg p95 max` (ms).
pub fn render_label_table(stats: &BTreeMap<String, RunStats>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:>7} {:>7} {:>7} {:>7} {:>7} {:>9} {:>7} {:>7}",
        "label", "total", "ok", "err", "err%", "min", "avg", "p95", "max"
    );
    for (label, s) in stats {
        let _ = writeln!(
            out,
            "{:<10} {:>7} {:>7} {:>7} {:>7.2} {:>7} {:>9.1} {:>7} {:>7}",
            label,
            s.total,
            s.ok_count,
            s.err_count,
            s.err_rate,
            s.latency.min_ms,
            s.latency.mean_ms,
            s.latency.p95_ms,
            s.latency.max_ms
        );
    }
    out
}

pub fn render_bulk_report(report: &BulkReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Units: {}", report.units);
    let _ = writeln!(
        out,
        "Submitted: accepted={} no_job_id={} ({}ms)",
        report.accepted, report.no_job_id, report.submit_phase_ms
    );
    let lat = &report.submit_latency;
    let _ = writeln!(
        out,
        "Submit latency: min={}ms avg={:.1}ms p95={}ms max={}ms",
        lat.min_ms, lat.mean_ms, lat.p95_ms, lat.max_ms
    );
    let _ = writeln!(
        out,
        "Jobs: done={} error={} timeout={} ({}ms)",
        report.done, report.error, report.timeout, report.poll_phase_ms
    );
    if report.cleanup_accepted + report.cleanup_rejected > 0 {
        let _ = writeln!(
            out,
            "Cleanup: accepted={} rejected={} ({}ms)",
            report.cleanup_accepted, report.cleanup_rejected, report.cleanup_phase_ms
        );
    }
    if report.cleanup_jobs.total() > 0 {
        let c = &report.cleanup_jobs;
        let _ = writeln!(
            out,
            "Cleanup jobs: done={} error={} timeout={}",
            c.done, c.error, c.timeout
        );
    }
    for snapshot in &report.counts {
        let count = snapshot
            .count
            .map_or_else(|| format!("unavailable (status {})", snapshot.status), |n| n.to_string());
        let _ = writeln!(out, "Count {}: {}", snapshot.phase, count);
    }
    for sample in &report.error_samples {
        let _ = writeln!(out, "  error: {}", sample);
    }
    out
}

#[derive(Serialize)]
struct CsvRow<'a> {
    status: u16,
    latency_ms: u64,
    tag: &'a str,
}

/// Write one `<dir>/<run_id>/<label>.csv` file per label. Returns the files written.
pub fn write_csv(dir: &Path, run_id: &str, log: &OutcomeLog) -> Result<Vec<PathBuf>> {
    let run_dir = dir.join(run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create {:?}", run_dir))?;

    let mut written = Vec::new();
    for (label, outcomes) in log.by_label() {
        let path = run_dir.join(format!("{label}.csv"));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        for o in outcomes {
            writer.serialize(CsvRow {
                status: o.status,
                latency_ms: o.latency_ms,
                tag: &o.tag,
            })?;
        }
        writer.flush().with_context(|| format!("Failed to write {:?}", path))?;
        written.push(path);
    }
    info!("Wrote {} CSV files to {:?}", written.len(), run_dir);
    Ok(written)
}
