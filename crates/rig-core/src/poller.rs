use crate::client::{Response, ServiceClient};
use crate::endpoint::job_status;
use crate::outcome::{is_success, Outcome, OutcomeRecorder};
use crate::pool::run_bounded;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Lifecycle of one submitted job as seen by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Polling,
    Done,
    Error,
    Timeout,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Timeout)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Job document returned by `GET /jobs/{id}`. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl JobStatus {
    /// `None` for non-2xx answers and bodies that are not a job document.
    pub fn from_response(response: &Response) -> Option<Self> {
        if !is_success(response.status) {
            return None;
        }
        let body = response.body.as_ref()?;
        serde_json::from_value(body.clone()).ok()
    }

    /// Only `"done"` and `"error"` are terminal.
    pub fn terminal(&self) -> Option<JobState> {
        match self.state.as_deref() {
            Some("done") => Some(JobState::Done),
            Some("error") => Some(JobState::Error),
            _ => None,
        }
    }
}

/// A job the service accepted, joined back to its submission by `correlation_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub submit_latency_ms: u64,
    pub correlation_key: String,
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub handle: JobHandle,
    /// Always terminal.
    pub state: JobState,
    pub polls: u32,
    pub elapsed_ms: u64,
    /// HTTP status of the last read, 0 if it failed in transport.
    pub last_status: u16,
    /// Last `state` value observed, terminal or not.
    pub last_seen: Option<String>,
    pub error: Option<String>,
}

impl PollResult {
    pub fn outcome(&self) -> Outcome {
        self.outcome_labeled("job")
    }

    pub fn outcome_labeled(&self, label: &str) -> Outcome {
        Outcome::new(label, self.last_status, self.elapsed_ms, self.state.tag())
    }
}

/// Terminal-state counts over a set of polled jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTally {
    pub done: u64,
    pub error: u64,
    pub timeout: u64,
}

impl JobTally {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a PollResult>) -> Self {
        let mut tally = Self::default();
        for result in results {
            match result.state {
                JobState::Done => tally.done += 1,
                JobState::Error => tally.error += 1,
                _ => tally.timeout += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> u64 {
        self.done + self.error + self.timeout
    }
}

/// Polls one job at a time until `done`, `error` or the deadline.
#[derive(Clone)]
pub struct JobPoller {
    client: Arc<dyn ServiceClient>,
    interval: Duration,
    deadline: Duration,
}

impl JobPoller {
    pub fn new(client: Arc<dyn ServiceClient>, interval: Duration, deadline: Duration) -> Self {
        Self {
            client,
            interval,
            deadline,
        }
    }

    /// Status reads for one job are strictly sequential. Unreadable or failed
    /// reads count as non-terminal; only the deadline ends a silent job.
    pub async fn poll(&self, handle: JobHandle) -> PollResult {
        let op = job_status(&handle.job_id);
        let start = Instant::now();
        let mut state = JobState::Polling;
        let mut polls = 0u32;
        let mut last_status: u16;
        let mut last_seen: Option<String> = None;
        let mut error = None;

        debug!("job {} -> {}", handle.job_id, state);

        loop {
            polls += 1;
            match self.client.execute(&op).await {
                Ok(response) => {
                    last_status = response.status;
                    match JobStatus::from_response(&response) {
                        Some(status) => {
                            let terminal = status.terminal();
                            if status.state.is_some() {
                                last_seen = status.state;
                            }
                            if let Some(next) = terminal {
                                state = next;
                                error = status.error;
                                break;
                            }
                        }
                        None => debug!(
                            "job {} status unreadable (HTTP {})",
                            handle.job_id, response.status
                        ),
                    }
                }
                Err(e) => {
                    last_status = 0;
                    debug!("job {} status read failed: {}", handle.job_id, e);
                }
            }

            if start.elapsed() >= self.deadline {
                state = JobState::Timeout;
                warn!(
                    "job {} ({}) timed out after {} polls, last state {:?}",
                    handle.job_id, handle.correlation_key, polls, last_seen
                );
                break;
            }
            sleep(self.interval).await;
        }

        debug!("job {} -> {} after {} polls", handle.job_id, state, polls);

        PollResult {
            handle,
            state,
            polls,
            elapsed_ms: start.elapsed().as_millis() as u64,
            last_status,
            last_seen,
            error,
        }
    }

    /// Poll every handle to a terminal state with at most `concurrency` jobs
    /// in flight, recording one outcome per job under `label`.
    pub async fn poll_all(
        &self,
        handles: Vec<JobHandle>,
        concurrency: usize,
        label: &str,
        recorder: &OutcomeRecorder,
    ) -> Result<Vec<PollResult>> {
        let results = run_bounded(handles, concurrency, |handle| {
            let poller = self.clone();
            async move { poller.poll(handle).await }
        })
        .await?;
        for result in &results {
            recorder.record(result.outcome_labeled(label));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TransportError;
    use crate::testing::ScriptedClient;
    use serde_json::json;

    fn handle() -> JobHandle {
        JobHandle {
            job_id: "abc".to_string(),
            submit_latency_ms: 3,
            correlation_key: "999001".to_string(),
        }
    }

    fn poller(client: Arc<ScriptedClient>, interval_ms: u64, deadline_ms: u64) -> JobPoller {
        JobPoller::new(
            client,
            Duration::from_millis(interval_ms),
            Duration::from_millis(deadline_ms),
        )
    }

    #[test]
    fn test_terminal_states() {
        let st = |s: Option<&str>| JobStatus {
            state: s.map(str::to_string),
            ..JobStatus::default()
        };
        assert_eq!(st(Some("done")).terminal(), Some(JobState::Done));
        assert_eq!(st(Some("error")).terminal(), Some(JobState::Error));
        assert_eq!(st(Some("queued")).terminal(), None);
        assert_eq!(st(Some("DONE")).terminal(), None);
        assert_eq!(st(None).terminal(), None);
        assert!(JobState::Timeout.is_terminal());
        assert!(!JobState::Polling.is_terminal());
    }

    #[test]
    fn test_job_status_from_response() {
        let ok = Response::json(200, json!({"id": "abc", "state": "running", "ts": 1}));
        assert_eq!(
            JobStatus::from_response(&ok).unwrap().state.as_deref(),
            Some("running")
        );
        let missing = Response::json(200, json!({"id": "abc"}));
        assert_eq!(JobStatus::from_response(&missing).unwrap().state, None);
        assert!(JobStatus::from_response(&Response::json(404, json!({"state": "done"}))).is_none());
        assert!(JobStatus::from_response(&Response::empty(200)).is_none());
        assert!(JobStatus::from_response(&Response::json(200, json!("done"))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_after_two_pending_polls() {
        let client = Arc::new(ScriptedClient::new(|_, idx| {
            let state = if idx < 2 { "pending" } else { "done" };
            Ok(Response::json(200, json!({"id": "abc", "state": state})))
        }));

        let result = poller(client.clone(), 1_000, 60_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Done);
        assert_eq!(result.polls, 3);
        assert_eq!(client.calls_to("/jobs/abc"), 3);
        assert!(result.elapsed_ms >= 2_000 && result.elapsed_ms < 3_000);
        assert_eq!(result.outcome().tag, "done");
        assert_eq!(result.handle.correlation_key, "999001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_state_is_terminal_and_carries_message() {
        let client = Arc::new(ScriptedClient::new(|_, _| {
            Ok(Response::json(200, json!({"state": "error", "error": "inbound not found"})))
        }));

        let result = poller(client.clone(), 500, 10_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Error);
        assert_eq!(result.polls, 1);
        assert_eq!(result.error.as_deref(), Some("inbound not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded_by_deadline_plus_interval() {
        let client = Arc::new(ScriptedClient::new(|_, _| {
            Ok(Response::json(200, json!({"state": "running"})))
        }));

        let result = poller(client.clone(), 1_000, 5_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Timeout);
        assert_eq!(result.last_seen.as_deref(), Some("running"));
        assert!(result.elapsed_ms >= 5_000);
        assert!(result.elapsed_ms <= 6_000);
        assert_eq!(result.polls as usize, client.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_reads_do_not_end_polling() {
        let client = Arc::new(ScriptedClient::new(|_, idx| match idx {
            0 => Err(TransportError::Connect("reset".into())),
            1 => Ok(Response::json(502, json!({"code": "REDIS_ERROR"}))),
            2 => Ok(Response::empty(200)),
            3 => Ok(Response::json(429, json!({"retry_after_ms": 10}))),
            _ => Ok(Response::json(200, json!({"state": "done"}))),
        }));

        let result = poller(client, 100, 60_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Done);
        assert_eq!(result.polls, 5);
        assert_eq!(result.last_status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_service_times_out() {
        let client = Arc::new(ScriptedClient::new(|_, _| Err(TransportError::Timeout)));

        let result = poller(client, 250, 1_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Timeout);
        assert_eq!(result.last_status, 0);
        assert_eq!(result.outcome().status, 0);
        assert_eq!(result.outcome().tag, "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_status_is_the_final_read() {
        let client = Arc::new(ScriptedClient::new(|_, idx| match idx {
            0 => Ok(Response::json(200, json!({"state": "running"}))),
            _ => Ok(Response::json(503, json!({"detail": "unavailable"}))),
        }));

        let result = poller(client, 250, 1_000).poll(handle()).await;

        assert_eq!(result.state, JobState::Timeout);
        assert!(result.polls > 1);
        assert_eq!(result.last_status, 503);
        assert_eq!(result.last_seen.as_deref(), Some("running"));
    }
}
