//! Scripted in-process client for unit tests.

use crate::client::{BoxFuture, Response, ServiceClient, TransportError};
use crate::endpoint::{Method, Operation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

type Handler = Box<dyn Fn(&Operation, usize) -> Result<Response, TransportError> + Send + Sync>;

/// Answers each call with `handler(op, call_index)` after an optional delay,
/// tracking call counts and peak concurrency (overall and per method).
pub(crate) struct ScriptedClient {
    handler: Handler,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Method -> (in flight, peak).
    by_method: Mutex<HashMap<Method, (usize, usize)>>,
    targets: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub(crate) fn new(
        handler: impl Fn(&Operation, usize) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            by_method: Mutex::new(HashMap::new()),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_to(&self, prefix: &str) -> usize {
        self.targets
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.starts_with(prefix))
            .count()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight_for(&self, method: Method) -> usize {
        self.by_method
            .lock()
            .unwrap()
            .get(&method)
            .map_or(0, |(_, peak)| *peak)
    }
}

impl ServiceClient for ScriptedClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, Result<Response, TransportError>> {
        Box::pin(async move {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(op.target.clone());

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            {
                let mut by_method = self.by_method.lock().unwrap();
                let (current, peak) = by_method.entry(op.method).or_default();
                *current += 1;
                *peak = (*peak).max(*current);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some((current, _)) = self.by_method.lock().unwrap().get_mut(&op.method) {
                *current -= 1;
            }

            (self.handler)(op, idx)
        })
    }
}
