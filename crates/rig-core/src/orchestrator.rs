use crate::client::ServiceClient;
use crate::dispatcher::execute_operation;
use crate::endpoint::{Operation, OperationFactory};
use crate::outcome::{is_success, Outcome, OutcomeRecorder};
use crate::poller::{JobHandle, JobPoller, JobState, JobTally};
use crate::pool::run_bounded;
use crate::preflight::health_gate;
use crate::retry::RetryPolicy;
use crate::stats::LatencySummary;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Tag for a submission that was answered without a job identifier.
pub const NO_JOB_ID_TAG: &str = "no-job-id";

const MAX_ERROR_SAMPLES: usize = 5;

/// One logical unit of bulk work.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Caller-side identity used to join job results and cleanup back to the submission.
    pub correlation_key: String,
    pub submit: Operation,
    pub cleanup: Option<Operation>,
}

impl WorkUnit {
    /// Issue a client for the identity at `seq`, removing it again on cleanup.
    pub fn issue(factory: &OperationFactory, seq: u64) -> Self {
        let identity = factory.identity(seq);
        Self {
            submit: factory.issue(&identity),
            cleanup: Some(factory.remove(&identity)),
            correlation_key: identity,
        }
    }
}

/// Deleting a missing client may answer 200, 404 or 502; all three are accepted.
pub fn cleanup_accepted(status: u16) -> bool {
    is_success(status) || status == 404 || status == 502
}

#[derive(Debug, Clone)]
pub struct BulkSettings {
    pub submit_concurrency: usize,
    /// Usually larger than `submit_concurrency`: jobs run far longer than they take to submit.
    pub poll_concurrency: usize,
    pub cleanup_concurrency: usize,
    pub cleanup: bool,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            submit_concurrency: 10,
            poll_concurrency: 40,
            cleanup_concurrency: 10,
            cleanup: false,
        }
    }
}

/// Server-side client count read at one point of a bulk run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountSnapshot {
    pub phase: String,
    pub status: u16,
    /// `None` when the read failed or carried no numeric `result`.
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub units: u64,
    /// Submissions that produced a job handle.
    pub accepted: u64,
    pub no_job_id: u64,
    pub done: u64,
    pub error: u64,
    pub timeout: u64,
    pub cleanup_accepted: u64,
    pub cleanup_rejected: u64,
    /// Terminal states of the jobs returned by asynchronous removals.
    pub cleanup_jobs: JobTally,
    pub counts: Vec<CountSnapshot>,
    /// Submission phase only.
    pub submit_latency: LatencySummary,
    pub submit_phase_ms: u64,
    pub poll_phase_ms: u64,
    pub cleanup_phase_ms: u64,
    pub error_samples: Vec<String>,
}

/// Submit many jobs, poll every accepted one to a terminal state, then clean up.
pub struct BulkOrchestrator {
    client: Arc<dyn ServiceClient>,
    retry: Arc<RetryPolicy>,
    poller: JobPoller,
    settings: BulkSettings,
    count_query: Option<Operation>,
    health: Option<Operation>,
}

impl BulkOrchestrator {
    pub fn new(
        client: Arc<dyn ServiceClient>,
        retry: RetryPolicy,
        poller: JobPoller,
        settings: BulkSettings,
    ) -> Self {
        Self {
            client,
            retry: Arc::new(retry),
            poller,
            settings,
            count_query: None,
            health: None,
        }
    }

    /// Refuse to submit anything unless `op` answers 2xx.
    pub fn with_health_gate(mut self, op: Operation) -> Self {
        self.health = Some(op);
        self
    }

    /// Read the server-side client count with `op` before submitting, after
    /// polling and after cleanup.
    pub fn with_count_query(mut self, op: Operation) -> Self {
        self.count_query = Some(op);
        self
    }

    async fn snapshot(&self, phase: &str, report: &mut BulkReport) {
        let Some(op) = &self.count_query else {
            return;
        };
        let executed = execute_operation(self.client.as_ref(), &self.retry, op).await;
        let count = executed
            .response
            .as_ref()
            .filter(|r| is_success(r.status))
            .and_then(|r| r.field("result"))
            .and_then(|v| v.as_u64());
        match count {
            Some(n) => info!("Client count {}: {}", phase, n),
            None => warn!("Client count {} unavailable ({})", phase, executed.outcome.tag),
        }
        report.counts.push(CountSnapshot {
            phase: phase.to_string(),
            status: executed.outcome.status,
            count,
        });
    }

    pub async fn run(&self, units: Vec<WorkUnit>, recorder: &OutcomeRecorder) -> Result<BulkReport> {
        let mut report = BulkReport {
            units: units.len() as u64,
            ..BulkReport::default()
        };
        if let Some(health) = &self.health {
            let check = health_gate(self.client.as_ref(), health).await?;
            info!("Health gate passed: {}", check.line());
        }
        self.snapshot("before", &mut report).await;

        // Phase 1: submissions.
        info!(
            "Submitting {} jobs (concurrency {})",
            units.len(),
            self.settings.submit_concurrency
        );
        let phase = Instant::now();
        let submissions = run_bounded(
            units.iter().map(|u| (u.correlation_key.clone(), u.submit.clone())),
            self.settings.submit_concurrency,
            |(key, op)| {
                let client = self.client.clone();
                let retry = self.retry.clone();
                let recorder = recorder.clone();
                async move { submit(client.as_ref(), &retry, &recorder, key, op).await }
            },
        )
        .await?;
        report.submit_phase_ms = phase.elapsed().as_millis() as u64;

        let mut submit_samples = Vec::with_capacity(submissions.len());
        let mut handles = Vec::new();
        for (latency_ms, handle) in submissions {
            submit_samples.push(latency_ms);
            match handle {
                Some(handle) => handles.push(handle),
                None => report.no_job_id += 1,
            }
        }
        report.accepted = handles.len() as u64;
        report.submit_latency = LatencySummary::from_samples(&submit_samples);
        info!(
            "Submission phase done in {}ms: accepted={} no_job_id={}",
            report.submit_phase_ms, report.accepted, report.no_job_id
        );

        // Phase 2: polling.
        let phase = Instant::now();
        let results = self
            .poller
            .poll_all(handles, self.settings.poll_concurrency, "job", recorder)
            .await?;
        report.poll_phase_ms = phase.elapsed().as_millis() as u64;

        for result in &results {
            match result.state {
                JobState::Done => report.done += 1,
                JobState::Error => {
                    report.error += 1;
                    if report.error_samples.len() < MAX_ERROR_SAMPLES {
                        let msg = result.error.as_deref().unwrap_or("no error message");
                        report
                            .error_samples
                            .push(format!("{}: {}", result.handle.correlation_key, msg));
                    }
                }
                // The poller only returns terminal states.
                _ => report.timeout += 1,
            }
        }
        info!(
            "Polling phase done in {}ms: done={} error={} timeout={}",
            report.poll_phase_ms, report.done, report.error, report.timeout
        );
        self.snapshot("after_poll", &mut report).await;

        // Phase 3: best-effort cleanup.
        if self.settings.cleanup {
            let phase = Instant::now();
            let cleanups: Vec<Operation> = units.into_iter().filter_map(|u| u.cleanup).collect();
            info!(
                "Cleaning up {} units (concurrency {})",
                cleanups.len(),
                self.settings.cleanup_concurrency
            );
            let removals = run_bounded(cleanups, self.settings.cleanup_concurrency, |op| {
                let client = self.client.clone();
                let retry = self.retry.clone();
                let recorder = recorder.clone();
                async move {
                    let executed = execute_operation(client.as_ref(), &retry, &op).await;
                    let status = executed.outcome.status;
                    let tag = if cleanup_accepted(status) { "accepted" } else { "rejected" };
                    recorder.record(Outcome::new(
                        "cleanup",
                        status,
                        executed.outcome.latency_ms,
                        tag,
                    ));
                    (status, executed.job_handle(op.target.clone()))
                }
            })
            .await?;

            let mut cleanup_handles = Vec::new();
            for (status, handle) in removals {
                if cleanup_accepted(status) {
                    report.cleanup_accepted += 1;
                } else {
                    report.cleanup_rejected += 1;
                }
                cleanup_handles.extend(handle);
            }
            if report.cleanup_rejected > 0 {
                warn!("{} cleanup calls were rejected (ignored)", report.cleanup_rejected);
            }

            if !cleanup_handles.is_empty() {
                info!("Polling {} cleanup jobs", cleanup_handles.len());
                let results = self
                    .poller
                    .poll_all(cleanup_handles, self.settings.poll_concurrency, "cleanup_job", recorder)
                    .await?;
                report.cleanup_jobs = JobTally::from_results(&results);
            }
            report.cleanup_phase_ms = phase.elapsed().as_millis() as u64;
            self.snapshot("after_cleanup", &mut report).await;
        }

        Ok(report)
    }
}

/// Submit one unit; returns its latency and a handle when a job id came back.
async fn submit(
    client: &dyn ServiceClient,
    retry: &RetryPolicy,
    recorder: &OutcomeRecorder,
    correlation_key: String,
    op: Operation,
) -> (u64, Option<JobHandle>) {
    let executed = execute_operation(client, retry, &op).await;
    let handle = executed.job_handle(correlation_key.clone());
    let mut outcome = executed.outcome;
    let latency_ms = outcome.latency_ms;

    if handle.is_none() {
        if outcome.is_ok() {
            outcome.tag = NO_JOB_ID_TAG.to_string();
        }
        warn!(
            "{} submission got no job id (status {}, {})",
            correlation_key, outcome.status, outcome.tag
        );
    }
    recorder.record(outcome);
    (latency_ms, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Response, TransportError};
    use crate::endpoint::{Endpoint, Method};
    use crate::outcome::outcome_channel;
    use crate::testing::ScriptedClient;
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator(client: Arc<ScriptedClient>, settings: BulkSettings) -> BulkOrchestrator {
        let poller = JobPoller::new(
            client.clone(),
            Duration::from_millis(200),
            Duration::from_millis(2_000),
        );
        BulkOrchestrator::new(client, RetryPolicy::default(), poller, settings)
    }

    fn units(n: u64) -> Vec<WorkUnit> {
        let factory = OperationFactory::new("vless-in", 999_000);
        (1..=n).map(|seq| WorkUnit::issue(&factory, seq)).collect()
    }

    #[test]
    fn test_cleanup_acceptance_is_permissive() {
        assert!(cleanup_accepted(200));
        assert!(cleanup_accepted(404));
        assert!(cleanup_accepted(502));
        assert!(!cleanup_accepted(500));
        assert!(!cleanup_accepted(0));
        assert!(!cleanup_accepted(429));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_id_never_polls() {
        let client = Arc::new(ScriptedClient::new(|_, _| Ok(Response::empty(202))));
        let orch = orchestrator(client.clone(), BulkSettings::default());
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(5), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        assert_eq!(report.no_job_id, 5);
        assert_eq!(report.accepted, 0);
        assert_eq!(client.calls_to("/jobs/"), 0);
        assert_eq!(log.count_tag(NO_JOB_ID_TAG), 5);
        assert_eq!(log.len(), 5);
        assert_eq!(report.submit_latency.count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_handle_reaches_a_terminal_state() {
        let client = Arc::new(ScriptedClient::new(|op, idx| {
            if op.method == Method::Post {
                return Ok(Response::json(202, json!({"status": "queued", "job_id": format!("j{idx}")})));
            }
            let n: u64 = op.path().trim_start_matches("/jobs/j").parse().unwrap();
            let state = match n {
                7 => "running",
                n if n % 3 == 0 => "error",
                _ => "done",
            };
            Ok(Response::json(200, json!({"state": state, "error": "boom"})))
        }));
        let orch = orchestrator(client.clone(), BulkSettings::default());
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(10), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        // j0..j9: j0, j3, j6, j9 fail; j7 never finishes.
        assert_eq!(report.accepted, 10);
        assert_eq!(report.error, 4);
        assert_eq!(report.timeout, 1);
        assert_eq!(report.done, 5);
        assert_eq!(report.done + report.error + report.timeout, report.accepted);
        assert_eq!(report.error_samples.len(), 4);
        assert_eq!(log.with_label("issue").count(), 10);
        assert_eq!(log.with_label("job").count(), 10);
        assert_eq!(report.cleanup_accepted + report.cleanup_rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submissions_keep_their_classification() {
        let client = Arc::new(ScriptedClient::new(|_, idx| match idx % 2 {
            0 => Err(TransportError::Timeout),
            _ => Ok(Response::json(500, json!({"job_id": "ignored"}))),
        }));
        let orch = orchestrator(client.clone(), BulkSettings::default());
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(4), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        assert_eq!(report.no_job_id, 4);
        assert_eq!(log.count_tag("timeout"), 2);
        assert_eq!(log.count_tag("http_error"), 2);
        assert_eq!(client.calls_to("/jobs/"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_is_best_effort() {
        let client = Arc::new(ScriptedClient::new(|op, _| match op.method {
            Method::Post => Ok(Response::empty(202)),
            _ => {
                let status = match op.target.as_str() {
                    t if t.starts_with("/clients/999001") => 200,
                    t if t.starts_with("/clients/999002") => 404,
                    t if t.starts_with("/clients/999003") => 502,
                    _ => 500,
                };
                Ok(Response::empty(status))
            }
        }));
        let settings = BulkSettings {
            cleanup: true,
            ..BulkSettings::default()
        };
        let orch = orchestrator(client.clone(), settings);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(4), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        assert_eq!(report.cleanup_accepted, 3);
        assert_eq!(report.cleanup_rejected, 1);
        assert_eq!(client.calls_to("/clients/99900"), 4);
        assert_eq!(log.with_label("cleanup").count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_phase_keeps_its_own_bound() {
        let client = Arc::new(
            ScriptedClient::new(|op, idx| match op.method {
                Method::Post => Ok(Response::json(202, json!({"job_id": format!("j{idx}")}))),
                Method::Delete => Ok(Response::json(200, json!({"job_id": format!("c{idx}")}))),
                _ => Ok(Response::json(200, json!({"state": "done"}))),
            })
            .with_delay(Duration::from_millis(50)),
        );
        let settings = BulkSettings {
            submit_concurrency: 2,
            poll_concurrency: 8,
            cleanup_concurrency: 3,
            cleanup: true,
        };
        let orch = orchestrator(client.clone(), settings);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(30), &recorder).await.unwrap();
        drop(recorder);
        collector.finish().await.unwrap();

        assert_eq!(report.done, 30);
        assert_eq!(report.cleanup_jobs.done, 30);
        assert_eq!(client.max_in_flight_for(Method::Post), 2);
        assert_eq!(client.max_in_flight_for(Method::Get), 8);
        assert_eq!(client.max_in_flight_for(Method::Delete), 3);
        assert!(client.max_in_flight() <= 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_cleanup_jobs_are_polled() {
        let client = Arc::new(ScriptedClient::new(|op, idx| match op.method {
            Method::Post => Ok(Response::json(202, json!({"job_id": format!("j{idx}")}))),
            Method::Delete => {
                let identity = op.path().trim_start_matches("/clients/").to_string();
                Ok(Response::json(200, json!({"job_id": format!("c-{identity}")})))
            }
            _ if op.path() == "/jobs/c-999002" => {
                Ok(Response::json(200, json!({"state": "error", "error": "not found"})))
            }
            _ => Ok(Response::json(200, json!({"state": "done"}))),
        }));
        let settings = BulkSettings {
            cleanup: true,
            ..BulkSettings::default()
        };
        let orch = orchestrator(client.clone(), settings);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(3), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        assert_eq!(report.cleanup_accepted, 3);
        assert_eq!(
            report.cleanup_jobs,
            JobTally {
                done: 2,
                error: 1,
                timeout: 0
            }
        );
        assert_eq!(client.calls_to("/jobs/c-"), 3);
        assert_eq!(log.with_label("cleanup_job").count(), 3);
        assert_eq!(log.with_label("cleanup_job").filter(|o| o.tag == "error").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_gate_submits_nothing() {
        let client = Arc::new(ScriptedClient::new(|op, _| match op.path() {
            "/health/full" => Ok(Response::json(503, json!({"ok": false}))),
            _ => Ok(Response::json(202, json!({"job_id": "j"}))),
        }));
        let health = OperationFactory::new("vless-in", 0).build(Endpoint::Health, 0);
        let orch = orchestrator(client.clone(), BulkSettings::default()).with_health_gate(health);
        let (recorder, collector) = outcome_channel();

        let err = orch.run(units(5), &recorder).await.unwrap_err();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        assert!(err.to_string().contains("503"));
        assert_eq!(client.calls(), 1);
        assert_eq!(client.calls_to("/clients/"), 0);
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_gate_lets_the_run_proceed() {
        let client = Arc::new(ScriptedClient::new(|op, _| match op.path() {
            "/health/full" => Ok(Response::json(200, json!({"ok": true}))),
            "/jobs/j" => Ok(Response::json(200, json!({"state": "done"}))),
            _ => Ok(Response::json(202, json!({"job_id": "j"}))),
        }));
        let health = OperationFactory::new("vless-in", 0).build(Endpoint::Health, 0);
        let orch = orchestrator(client.clone(), BulkSettings::default()).with_health_gate(health);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(2), &recorder).await.unwrap();
        drop(recorder);
        collector.finish().await.unwrap();

        assert_eq!(report.done, 2);
        assert_eq!(client.calls_to("/health/full"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_snapshots_bracket_the_run() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let live = Arc::new(AtomicU64::new(10));
        let server_live = live.clone();
        let client = Arc::new(ScriptedClient::new(move |op, idx| match op.method {
            Method::Post => {
                server_live.fetch_add(1, Ordering::SeqCst);
                Ok(Response::json(202, json!({"job_id": format!("j{idx}")})))
            }
            Method::Delete => {
                server_live.fetch_sub(1, Ordering::SeqCst);
                Ok(Response::empty(200))
            }
            _ if op.path().ends_with("/users/count") => Ok(Response::json(
                200,
                json!({"result": server_live.load(Ordering::SeqCst), "request_id": "r"}),
            )),
            _ => Ok(Response::json(200, json!({"state": "done"}))),
        }));
        let settings = BulkSettings {
            cleanup: true,
            ..BulkSettings::default()
        };
        let count = OperationFactory::new("vless-in", 0).build(Endpoint::Count, 0);
        let orch = orchestrator(client.clone(), settings).with_count_query(count);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(3), &recorder).await.unwrap();
        drop(recorder);
        let log = collector.finish().await.unwrap();

        let counts: Vec<(&str, Option<u64>)> = report
            .counts
            .iter()
            .map(|c| (c.phase.as_str(), c.count))
            .collect();
        assert_eq!(
            counts,
            vec![("before", Some(10)), ("after_poll", Some(13)), ("after_cleanup", Some(10))]
        );
        assert_eq!(live.load(Ordering::SeqCst), 10);
        // Snapshots are not part of the measured outcomes.
        assert_eq!(log.with_label("count").count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_count_read_is_reported_as_unavailable() {
        let client = Arc::new(ScriptedClient::new(|op, _| match op.method {
            Method::Post => Ok(Response::empty(202)),
            _ => Ok(Response::json(503, json!({"detail": "xray down"}))),
        }));
        let count = OperationFactory::new("vless-in", 0).build(Endpoint::Count, 0);
        let orch = orchestrator(client, BulkSettings::default()).with_count_query(count);
        let (recorder, collector) = outcome_channel();

        let report = orch.run(units(1), &recorder).await.unwrap();
        drop(recorder);
        collector.finish().await.unwrap();

        assert_eq!(report.counts.len(), 2);
        assert!(report.counts.iter().all(|c| c.count.is_none() && c.status == 503));
    }
}
