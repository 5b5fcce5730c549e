//! Cross-instance mutual exclusion over a KCV store.
//!
//! A lock is a claim column `(timestamp, rid)` written under the lock row of
//! a [`KeyColumn`](crate::types::KeyColumn). Within one process a
//! [`LocalLockMediator`] settles contention before any claim is written;
//! across processes the oldest live claim wins.

/// Expired-claim cleanup.
pub mod cleaner;

/// Expected-value checking transactions.
pub mod expected;

/// The claim-based locker.
pub mod locker;

/// In-process lock mediation.
pub mod mediator;

/// Locker configuration.
pub mod options;

/// Lock row and claim column layout.
pub mod serializer;

/// Per-transaction lock bookkeeping.
pub mod state;

pub use cleaner::ExpiredClaimCleaner;
pub use expected::ExpectedValueTransaction;
pub use locker::ConsistentKeyLocker;
pub use mediator::{LocalLockMediator, MediatorRegistry};
pub use options::LockerOptions;
pub use serializer::TimestampRid;
pub use state::LockStatus;
