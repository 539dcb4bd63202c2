use crate::outcome::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latency distribution over a finished sample set (integer ms).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub mean_ms: f64,
    pub p95_ms: u64,
}

impl LatencySummary {
    /// Empty input yields all-zero statistics.
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let count = sorted.len() as u64;
        let sum: u128 = sorted.iter().map(|&v| v as u128).sum();
        let mean_ms = (sum as f64) / (count as f64);

        Self {
            count,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            // Float rounding must not push the mean outside [min, max].
            mean_ms: mean_ms.clamp(sorted[0] as f64, sorted[sorted.len() - 1] as f64),
            p95_ms: percentile_sorted(&sorted, 95),
        }
    }
}

/// Nearest-rank percentile over an ascending slice: the value at 1-based
/// rank `ceil(p/100 * n)`, clamped to `[1, n]`. Returns 0 for an empty slice.
pub fn percentile_sorted(sorted: &[u64], p: u64) -> u64 {
    let n = sorted.len() as u64;
    if n == 0 {
        return 0;
    }
    let rank = (p * n).div_ceil(100).clamp(1, n);
    sorted[(rank - 1) as usize]
}

/// Per-label aggregate of a finished outcome set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total: u64,
    pub ok_count: u64,
    pub err_count: u64,
    /// Percent of `total`, 0.0 when empty.
    pub err_rate: f64,
    pub latency: LatencySummary,
}

impl RunStats {
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> Self {
        let mut ok_count = 0u64;
        let mut err_count = 0u64;
        let mut samples = Vec::new();

        for outcome in outcomes {
            if outcome.is_ok() {
                ok_count += 1;
            } else {
                err_count += 1;
            }
            samples.push(outcome.latency_ms);
        }

        let total = ok_count + err_count;
        let err_rate = if total > 0 {
            (err_count as f64) * 100.0 / (total as f64)
        } else {
            0.0
        };

        Self {
            total,
            ok_count,
            err_count,
            err_rate,
            latency: LatencySummary::from_samples(&samples),
        }
    }
}

/// Compute fresh statistics for every label present in `outcomes`.
pub fn stats_by_label<'a>(
    outcomes: impl IntoIterator<Item = &'a Outcome>,
) -> BTreeMap<String, RunStats> {
    let mut grouped: BTreeMap<String, Vec<&Outcome>> = BTreeMap::new();
    for outcome in outcomes {
        grouped
            .entry(outcome.label.clone())
            .or_default()
            .push(outcome);
    }
    grouped
        .into_iter()
        .map(|(label, items)| (label, RunStats::from_outcomes(items)))
        .collect()
}
