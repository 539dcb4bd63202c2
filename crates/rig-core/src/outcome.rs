use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Status recorded when no HTTP response was received at all.
pub const TRANSPORT_FAILURE_STATUS: u16 = 0;

/// Final result of one dispatched operation (retries collapsed into the last attempt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub label: String,
    pub status: u16,
    pub latency_ms: u64,
    pub tag: String,
}

impl Outcome {
    pub fn new(
        label: impl Into<String>,
        status: u16,
        latency_ms: u64,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            status,
            latency_ms,
            tag: tag.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        is_success(self.status)
    }
}

/// `200 <= status < 300`. The transport sentinel never qualifies.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Cheap, cloneable handle workers use to append outcomes.
///
/// Appends go through an unbounded channel drained by a single collector
/// task, so recording never blocks a worker and no entry is lost.
#[derive(Clone)]
pub struct OutcomeRecorder {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl OutcomeRecorder {
    pub fn record(&self, outcome: Outcome) {
        // The collector only stops once every sender is gone.
        let _ = self.tx.send(outcome);
    }
}

/// Owns the collector task; resolves to the full log once all recorders are dropped.
pub struct OutcomeCollector {
    handle: JoinHandle<OutcomeLog>,
}

impl OutcomeCollector {
    pub async fn finish(self) -> Result<OutcomeLog> {
        self.handle.await.context("outcome collector task failed")
    }
}

/// Spawn a collector task and return the recorder/collector pair.
pub fn outcome_channel() -> (OutcomeRecorder, OutcomeCollector) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
    let handle = tokio::spawn(async move {
        let mut log = OutcomeLog::default();
        while let Some(outcome) = rx.recv().await {
            log.push(outcome);
        }
        log
    });
    (OutcomeRecorder { tx }, OutcomeCollector { handle })
}

/// Completion-ordered, read-only record of a run.
#[derive(Debug, Default, Clone)]
pub struct OutcomeLog {
    entries: Vec<Outcome>,
}

impl OutcomeLog {
    pub fn push(&mut self, outcome: Outcome) {
        self.entries.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Outcome] {
        &self.entries
    }

    pub fn with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Outcome> + 'a {
        self.entries.iter().filter(move |o| o.label == label)
    }

    /// Group outcomes per label, labels sorted.
    pub fn by_label(&self) -> BTreeMap<&str, Vec<&Outcome>> {
        let mut groups: BTreeMap<&str, Vec<&Outcome>> = BTreeMap::new();
        for outcome in &self.entries {
            groups.entry(outcome.label.as_str()).or_default().push(outcome);
        }
        groups
    }

    pub fn count_tag(&self, tag: &str) -> usize {
        self.entries.iter().filter(|o| o.tag == tag).count()
    }
}
