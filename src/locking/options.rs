use std::sync::Arc;
use std::time::Duration;

use crate::metrics::ClaimMetrics;
use crate::types::{ClaimError, Result, Rid};

/// Default number of claim attempts per lock.
pub const DEFAULT_LOCK_RETRY_COUNT: usize = 3;
/// Default propagation wait between writing and verifying a claim.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(100);
/// Default claim lifetime.
pub const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(300);
/// Default mediator namespace.
pub const DEFAULT_MEDIATOR_PREFIX: &str = "keyclaim";
/// Default overall deadline for one backend call.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a [`super::ConsistentKeyLocker`].
#[derive(Clone)]
pub struct LockerOptions {
    /// Identity written into every claim.
    pub rid: Rid,
    /// Time to wait after writing a claim before reading claims back.
    pub lock_wait: Duration,
    /// Age after which a claim is treated as abandoned.
    pub lock_expire: Duration,
    /// Claim attempts before giving up on contention or backend failure.
    pub retry_count: usize,
    /// Namespace of the local mediator shared by lockers in this process.
    pub mediator_prefix: String,
    /// Whether expired claims seen during verification are deleted.
    pub clean_expired: bool,
    /// Overall deadline for one claim read.
    pub operation_timeout: Duration,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn ClaimMetrics>>,
}

impl LockerOptions {
    /// Creates options with default timings for `rid`.
    pub fn new(rid: Rid) -> Self {
        Self {
            rid,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_expire: DEFAULT_LOCK_EXPIRE,
            retry_count: DEFAULT_LOCK_RETRY_COUNT,
            mediator_prefix: DEFAULT_MEDIATOR_PREFIX.to_owned(),
            clean_expired: false,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            metrics: None,
        }
    }

    /// Sets the wait between claim write and verification.
    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// Sets the claim lifetime.
    pub fn lock_expire(mut self, expire: Duration) -> Self {
        self.lock_expire = expire;
        self
    }

    /// Sets the number of claim attempts.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = count;
        self
    }

    /// Sets the local mediator namespace.
    pub fn mediator_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mediator_prefix = prefix.into();
        self
    }

    /// Enables or disables deleting expired claims.
    pub fn clean_expired(mut self, enabled: bool) -> Self {
        self.clean_expired = enabled;
        self
    }

    /// Sets the per-call backend deadline.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn ClaimMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Rejects settings under which the protocol cannot make progress.
    pub fn validate(&self) -> Result<()> {
        if self.retry_count == 0 {
            return Err(ClaimError::Config("lock retry count must be at least 1".into()));
        }
        // a claim must outlive the wait before its own verification
        if self.lock_expire < self.lock_wait
            || (!self.lock_wait.is_zero() && self.lock_expire == self.lock_wait)
        {
            return Err(ClaimError::Config(format!(
                "lock expire ({:?}) must exceed lock wait ({:?})",
                self.lock_expire, self.lock_wait
            )));
        }
        if self.mediator_prefix.is_empty() {
            return Err(ClaimError::Config("mediator prefix must not be empty".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(ClaimError::Config("operation timeout must be positive".into()));
        }
        Ok(())
    }
}
