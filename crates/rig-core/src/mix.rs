use anyhow::{bail, Context, Result};
use rand::Rng;
use std::fmt::Display;
use std::str::FromStr;

/// Weighted traffic distribution. Weights are integer percentages summing to 100.
#[derive(Debug, Clone)]
pub struct TrafficMix<T> {
    entries: Vec<(T, u32)>,
}

impl<T: Clone + Display> TrafficMix<T> {
    /// Validate the weights; fails before any request is issued.
    pub fn new(entries: Vec<(T, u32)>) -> Result<Self> {
        if entries.is_empty() {
            bail!("traffic mix is empty");
        }
        let sum: u64 = entries.iter().map(|(_, w)| *w as u64).sum();
        if sum != 100 {
            let shown: Vec<String> = entries.iter().map(|(l, w)| format!("{l}={w}")).collect();
            bail!(
                "traffic mix weights must sum to 100 (got {sum}: {})",
                shown.join(",")
            );
        }
        Ok(Self {
            entries: entries.into_iter().filter(|(_, w)| *w > 0).collect(),
        })
    }

    pub fn entries(&self) -> &[(T, u32)] {
        &self.entries
    }

    /// Draw one label: uniform roll in `0..100` against cumulative weights.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        let roll = rng.gen_range(0..100u32);
        let mut cumulative = 0u32;
        for (label, weight) in &self.entries {
            cumulative += weight;
            if roll < cumulative {
                return label;
            }
        }
        // Unreachable while the weights sum to 100.
        &self.entries[self.entries.len() - 1].0
    }
}

impl<T> TrafficMix<T>
where
    T: Clone + Display + FromStr,
    <T as FromStr>::Err: Into<anyhow::Error>,
{
    /// Parse `label=weight,label=weight,...`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (label, weight) = part
                .split_once('=')
                .with_context(|| format!("mix entry '{part}' must look like label=weight"))?;
            let label = label
                .trim()
                .parse::<T>()
                .map_err(|e| -> anyhow::Error { e.into() })
                .with_context(|| format!("invalid mix label in '{part}'"))?;
            let weight: u32 = weight
                .trim()
                .parse()
                .with_context(|| format!("invalid mix weight in '{part}'"))?;
            entries.push((label, weight));
        }
        Self::new(entries)
    }
}
