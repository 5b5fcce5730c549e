#![forbid(unsafe_code)]
//! Timestamp sources shared by lock claims and id allocation.
//!
//! Every timestamp that ends up in a claim column or drives an expiry
//! decision must come from one [`TimestampProvider`] instance, so that
//! claim ordering and expiry are computed against a single clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::{ClaimError, Result};

/// Nanoseconds since the Unix epoch, truncated to the provider's resolution.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(d)))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(d)))
    }

    /// Returns the time elapsed since `earlier`, or zero if `earlier` is later.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

fn duration_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Granularity of the timestamps written into claims. Coarser resolutions
/// make equal timestamps (and therefore rid tie-breaks) more likely.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimestampResolution {
    Milli,
    #[default]
    Micro,
    Nano,
}

impl TimestampResolution {
    /// Length of one tick in nanoseconds.
    pub const fn unit_nanos(self) -> u64 {
        match self {
            TimestampResolution::Milli => 1_000_000,
            TimestampResolution::Micro => 1_000,
            TimestampResolution::Nano => 1,
        }
    }

    /// Rounds `nanos` down to a whole tick.
    pub const fn truncate(self, nanos: u64) -> u64 {
        let unit = self.unit_nanos();
        nanos - nanos % unit
    }
}

/// Process-wide source of monotonically non-decreasing timestamps.
pub trait TimestampProvider: Send + Sync {
    /// Resolution the provider truncates to.
    fn resolution(&self) -> TimestampResolution;

    /// Current time. Never smaller than any value previously returned.
    fn now(&self) -> Timestamp;

    /// Blocks the calling thread for `duration`.
    fn sleep_for(&self, duration: Duration) -> Result<()>;

    /// Blocks until `now() >= target` and returns the observed time.
    fn sleep_past(&self, target: Timestamp) -> Result<Timestamp> {
        loop {
            let now = self.now();
            if now >= target {
                return Ok(now);
            }
            self.sleep_for(target.duration_since(now))?;
        }
    }
}

/// Wall-clock provider.
pub struct SystemTimestamps {
    resolution: TimestampResolution,
    high_water: AtomicU64,
}

impl SystemTimestamps {
    pub fn new(resolution: TimestampResolution) -> Self {
        Self {
            resolution,
            high_water: AtomicU64::new(0),
        }
    }
}

impl Default for SystemTimestamps {
    fn default() -> Self {
        Self::new(TimestampResolution::default())
    }
}

impl TimestampProvider for SystemTimestamps {
    fn resolution(&self) -> TimestampResolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_nanos)
            .unwrap_or(0);
        let candidate = self.resolution.truncate(wall);
        // a wall clock stepping backwards must not reorder claims
        let prev = self.high_water.fetch_max(candidate, Ordering::AcqRel);
        Timestamp(prev.max(candidate))
    }

    fn sleep_for(&self, duration: Duration) -> Result<()> {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

/// Deterministic clock for tests and simulations. Sleeping advances the
/// clock instead of blocking, so protocol waits cost no wall time.
pub struct ManualTimestamps {
    resolution: TimestampResolution,
    now: AtomicU64,
    interrupted: std::sync::atomic::AtomicBool,
}

impl ManualTimestamps {
    pub fn new(start: Timestamp) -> Self {
        Self::with_resolution(start, TimestampResolution::Nano)
    }

    pub fn with_resolution(start: Timestamp, resolution: TimestampResolution) -> Self {
        Self {
            resolution,
            now: AtomicU64::new(resolution.truncate(start.as_nanos())),
            interrupted: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(duration_nanos(d), Ordering::AcqRel);
    }

    /// Moves the clock to `ts` if that is later than the current time.
    pub fn set(&self, ts: Timestamp) {
        self.now.fetch_max(ts.as_nanos(), Ordering::AcqRel);
    }

    /// Makes every subsequent sleep fail with [`ClaimError::Interrupted`].
    pub fn interrupt_sleeps(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::Release);
    }
}

impl TimestampProvider for ManualTimestamps {
    fn resolution(&self) -> TimestampResolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        Timestamp(self.resolution.truncate(self.now.load(Ordering::Acquire)))
    }

    fn sleep_for(&self, duration: Duration) -> Result<()> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(ClaimError::Interrupted);
        }
        self.advance(duration);
        Ok(())
    }
}
