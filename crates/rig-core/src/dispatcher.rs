use crate::client::{Response, ServiceClient};
use crate::endpoint::{Endpoint, Operation, OperationFactory};
use crate::mix::TrafficMix;
use crate::outcome::{
    is_success, outcome_channel, Outcome, OutcomeRecorder, TRANSPORT_FAILURE_STATUS,
};
use crate::poller::{JobHandle, JobPoller, JobTally};
use crate::pool::run_bounded;
use crate::retry::RetryPolicy;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// One executed operation: its outcome plus the response, if one arrived.
#[derive(Debug, Clone)]
pub struct Executed {
    pub outcome: Outcome,
    pub response: Option<Response>,
}

impl Executed {
    /// A handle for the job started by this call: a 2xx answer carrying a
    /// non-empty `job_id`.
    pub fn job_handle(&self, correlation_key: impl Into<String>) -> Option<JobHandle> {
        let job_id = self
            .response
            .as_ref()
            .filter(|r| is_success(r.status))
            .and_then(|r| r.field_str("job_id"))
            .filter(|id| !id.is_empty())?;
        Some(JobHandle {
            job_id: job_id.to_string(),
            submit_latency_ms: self.outcome.latency_ms,
            correlation_key: correlation_key.into(),
        })
    }
}

/// Perform `op` once (through `retry` when the operation asks for it) and
/// classify the result. Never fails: transport errors become sentinel outcomes.
pub async fn execute_operation(
    client: &dyn ServiceClient,
    retry: &RetryPolicy,
    op: &Operation,
) -> Executed {
    let start = Instant::now();
    let result = if op.retry_on_throttle {
        retry.execute(client, op).await.map(|r| r.response)
    } else {
        client.execute(op).await
    };
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            let tag = if is_success(response.status) {
                "ok"
            } else if retry.is_throttled(&response) {
                "rate_limited"
            } else {
                "http_error"
            };
            Executed {
                outcome: Outcome::new(op.label.clone(), response.status, latency_ms, tag),
                response: Some(response),
            }
        }
        Err(e) => {
            warn!("{} {} failed: {}", op.method, op.target, e);
            Executed {
                outcome: Outcome::new(
                    op.label.clone(),
                    TRANSPORT_FAILURE_STATUS,
                    latency_ms,
                    e.tag(),
                ),
                response: None,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub total: u64,
    /// Sequence number of the first operation (keeps identities unique across phases).
    pub first_seq: u64,
    pub seed: u64,
    /// Stop launching new operations once this much wall time has passed.
    pub run_timeout: Option<Duration>,
    /// Log progress every N completed operations (0 disables).
    pub progress_every: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub requested: u64,
    pub dispatched: u64,
    pub elapsed_ms: u64,
    pub cut_short: bool,
    /// Operations that answered with a job id.
    pub jobs_started: u64,
    /// Terminal states of those jobs; all zero when no poller is attached.
    pub jobs: JobTally,
}

/// Runs a mixed stream of operations at a fixed concurrency.
pub struct Dispatcher {
    client: Arc<dyn ServiceClient>,
    retry: Arc<RetryPolicy>,
    concurrency: usize,
    jobs: Option<(JobPoller, usize)>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ServiceClient>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            client,
            retry: Arc::new(retry),
            concurrency: concurrency.max(1),
            jobs: None,
        }
    }

    /// Poll every job started during a run to a terminal state, recording a
    /// `job` outcome for each.
    pub fn with_job_poller(mut self, poller: JobPoller, poll_concurrency: usize) -> Self {
        self.jobs = Some((poller, poll_concurrency.max(1)));
        self
    }

    /// Run `plan` and throw its outcomes away.
    pub async fn warmup(
        &self,
        plan: &DispatchPlan,
        mix: &TrafficMix<Endpoint>,
        factory: &OperationFactory,
    ) -> Result<DispatchReport> {
        let (recorder, collector) = outcome_channel();
        let report = self.run(plan, mix, factory, &recorder).await?;
        drop(recorder);
        let discarded = collector.finish().await?;
        info!("Warmup done: {} outcomes discarded", discarded.len());
        Ok(report)
    }

    pub async fn run(
        &self,
        plan: &DispatchPlan,
        mix: &TrafficMix<Endpoint>,
        factory: &OperationFactory,
        recorder: &OutcomeRecorder,
    ) -> Result<DispatchReport> {
        let start = Instant::now();
        let mut rng = StdRng::seed_from_u64(plan.seed);
        let mut cut_short = false;

        let ops = (0..plan.total).map_while(|i| {
            if let Some(limit) = plan.run_timeout {
                if start.elapsed() >= limit {
                    if !cut_short {
                        warn!(
                            "Run timeout of {}ms reached after {} operations; draining in-flight work",
                            limit.as_millis(),
                            i
                        );
                    }
                    cut_short = true;
                    return None;
                }
            }
            let endpoint = *mix.pick(&mut rng);
            let seq = plan.first_seq + i;
            Some((seq, factory.build(endpoint, seq)))
        });

        let completed = Arc::new(AtomicU64::new(0));
        let progress_every = plan.progress_every;
        let total = plan.total;

        let done = run_bounded(ops, self.concurrency, |(seq, op)| {
            let client = self.client.clone();
            let retry = self.retry.clone();
            let recorder = recorder.clone();
            let completed = completed.clone();
            async move {
                let executed = execute_operation(client.as_ref(), &retry, &op).await;
                let handle = executed.job_handle(format!("{}#{}", op.label, seq));
                recorder.record(executed.outcome);

                let n = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if progress_every > 0 && n % progress_every == 0 {
                    info!("Progress: {}/{} operations complete", n, total);
                }
                handle
            }
        })
        .await?;

        let dispatched = done.len() as u64;
        let handles: Vec<JobHandle> = done.into_iter().flatten().collect();
        let jobs_started = handles.len() as u64;
        let jobs = match &self.jobs {
            Some((poller, poll_concurrency)) if !handles.is_empty() => {
                info!("Polling {} jobs started during the run", jobs_started);
                let results = poller
                    .poll_all(handles, *poll_concurrency, "job", recorder)
                    .await?;
                JobTally::from_results(&results)
            }
            Some(_) => JobTally::default(),
            None => {
                if jobs_started > 0 {
                    warn!("{} jobs were started but no poller is attached", jobs_started);
                }
                JobTally::default()
            }
        };

        Ok(DispatchReport {
            requested: plan.total,
            dispatched,
            elapsed_ms: start.elapsed().as_millis() as u64,
            cut_short,
            jobs_started,
            jobs,
        })
    }
}
