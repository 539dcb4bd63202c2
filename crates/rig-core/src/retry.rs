use crate::client::{Response, ServiceClient, TransportError};
use crate::endpoint::Operation;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Honors server backpressure: on a throttle response, sleep for the
/// server's hint (or a fallback) and try the same operation again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; at most `max_retries + 1` calls.
    pub max_retries: u32,
    /// Used when the throttle response carries no usable hint.
    pub fallback_delay: Duration,
    /// Floor applied to server hints.
    pub min_delay: Duration,
    /// Ceiling applied to server hints.
    pub max_delay: Duration,
    pub throttle_status: u16,
    /// Millisecond hint field in the throttle response body.
    pub hint_field: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            fallback_delay: Duration::from_millis(1_000),
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(60_000),
            throttle_status: 429,
            hint_field: "retry_after_ms".to_string(),
        }
    }
}

/// Final response of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub response: Response,
    /// Throttle retries performed before `response` arrived.
    pub retries: u32,
}

impl RetryOutcome {
    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        policy.is_throttled(&self.response)
    }
}

impl RetryPolicy {
    pub fn is_throttled(&self, response: &Response) -> bool {
        response.status == self.throttle_status
    }

    /// Positive millisecond hint from the response body, if any.
    pub fn hint(&self, response: &Response) -> Option<Duration> {
        let ms = match response.field(&self.hint_field)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f.ceil() as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }?;
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn backoff_for(&self, response: &Response) -> Duration {
        match self.hint(response) {
            Some(hint) => hint.min(self.max_delay).max(self.min_delay),
            None => self.fallback_delay,
        }
    }

    /// Run `op` until it is not throttled or the retry bound is reached.
    ///
    /// Transport failures are returned immediately; they are not retried.
    pub async fn execute(
        &self,
        client: &dyn ServiceClient,
        op: &Operation,
    ) -> Result<RetryOutcome, TransportError> {
        let mut retries = 0u32;
        loop {
            let response = client.execute(op).await?;

            if !self.is_throttled(&response) {
                return Ok(RetryOutcome { response, retries });
            }
            if retries >= self.max_retries {
                warn!(
                    "{} {} still throttled after {} retries",
                    op.method, op.target, retries
                );
                return Ok(RetryOutcome { response, retries });
            }

            let delay = self.backoff_for(&response);
            debug!(
                "{} {} throttled (status {}), retry {} in {}ms",
                op.method,
                op.target,
                response.status,
                retries + 1,
                delay.as_millis()
            );
            sleep(delay).await;
            retries += 1;
        }
    }
}
