use std::time::Duration;

use tracing::warn;

use crate::metrics::ClaimMetrics;
use crate::primitives::time::TimestampProvider;
use crate::types::{ClaimError, Result};

const BASE_REATTEMPT_WAIT: Duration = Duration::from_millis(50);
const MAX_REATTEMPT_WAIT: Duration = Duration::from_secs(2);

/// Retries an idempotent store call on temporary failures until an overall
/// deadline.
///
/// Waits double from 50ms up to 2s between attempts. A call that is still
/// failing temporarily at the deadline surfaces as [`ClaimError::Timeout`],
/// which is itself transient. Permanent failures return immediately.
pub struct BackendOperation<'a> {
    name: &'static str,
    times: &'a dyn TimestampProvider,
    timeout: Duration,
    metrics: Option<&'a dyn ClaimMetrics>,
}

impl<'a> BackendOperation<'a> {
    pub fn new(name: &'static str, times: &'a dyn TimestampProvider, timeout: Duration) -> Self {
        Self {
            name,
            times,
            timeout,
            metrics: None,
        }
    }

    /// Reports every retry to `metrics`.
    pub fn metrics(mut self, metrics: &'a dyn ClaimMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn execute<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = self.times.now();
        let mut wait = BASE_REATTEMPT_WAIT;
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_temporary() => err,
                Err(err) => return Err(err),
            };
            let elapsed = self.times.now().duration_since(start);
            if elapsed >= self.timeout {
                warn!(
                    operation = self.name,
                    error = %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "backend.operation.timeout"
                );
                return Err(ClaimError::Timeout(self.timeout));
            }
            if let Some(metrics) = self.metrics {
                metrics.backend_retry();
            }
            warn!(
                operation = self.name,
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "backend.operation.retry"
            );
            self.times.sleep_for(wait.min(self.timeout - elapsed))?;
            wait = (wait * 2).min(MAX_REATTEMPT_WAIT);
        }
    }
}
