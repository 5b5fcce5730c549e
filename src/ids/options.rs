use std::sync::Arc;
use std::time::Duration;

use crate::metrics::ClaimMetrics;
use crate::types::{ClaimError, Result};

/// Name of the store holding id counters.
pub const DEFAULT_ID_STORE_NAME: &str = "keyclaim_ids";

/// Configuration for a [`super::ConsistentKeyIdAuthority`].
#[derive(Clone)]
pub struct IdAuthorityOptions {
    /// Store the counters live in; its lock store is derived from it.
    pub store_name: String,
    /// First backoff after a failed allocation attempt; doubles per retry.
    pub wait: Duration,
    /// Overall deadline for one counter read or write.
    pub operation_timeout: Duration,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn ClaimMetrics>>,
}

impl IdAuthorityOptions {
    pub fn new() -> Self {
        Self {
            store_name: DEFAULT_ID_STORE_NAME.to_owned(),
            wait: Duration::from_millis(300),
            operation_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }

    /// Sets the counter store name.
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Sets the initial allocation backoff.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
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

    pub fn validate(&self) -> Result<()> {
        if self.store_name.is_empty() {
            return Err(ClaimError::Config("id store name must not be empty".into()));
        }
        if self.operation_timeout.is_zero() {
            return Err(ClaimError::Config("operation timeout must be positive".into()));
        }
        Ok(())
    }
}

impl Default for IdAuthorityOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`super::StandardIdPool`].
#[derive(Clone, Copy, Debug)]
pub struct IdPoolOptions {
    /// Longest a caller waits for the next block.
    pub renew_timeout: Duration,
    /// Fraction of a block left when background renewal starts.
    pub renew_buffer_percentage: f64,
}

impl IdPoolOptions {
    pub fn new() -> Self {
        Self {
            renew_timeout: Duration::from_secs(120),
            renew_buffer_percentage: 0.3,
        }
    }

    /// Sets the renewal deadline.
    pub fn renew_timeout(mut self, timeout: Duration) -> Self {
        self.renew_timeout = timeout;
        self
    }

    /// Sets the remaining fraction that triggers renewal.
    pub fn renew_buffer_percentage(mut self, pct: f64) -> Self {
        self.renew_buffer_percentage = pct;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.renew_timeout.is_zero() {
            return Err(ClaimError::Config("renew timeout must be positive".into()));
        }
        if !(self.renew_buffer_percentage > 0.0 && self.renew_buffer_percentage <= 1.0) {
            return Err(ClaimError::Config(format!(
                "renew buffer percentage must be in (0, 1], got {}",
                self.renew_buffer_percentage
            )));
        }
        Ok(())
    }
}

impl Default for IdPoolOptions {
    fn default() -> Self {
        Self::new()
    }
}
