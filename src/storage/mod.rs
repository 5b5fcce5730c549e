//! Key-column-value storage contract and backends.
//!
//! The locking and id-allocation protocols only ever talk to a store through
//! [`KeyColumnValueStore`] and [`StoreManager`].

/// Store traits, slice queries and backend features.
pub mod kcv;

/// In-memory backend with fault injection.
pub mod memory;

mod operation;

pub use kcv::{
    Entry, KeyColumnValueStore, KeyRange, KeySliceQuery, SliceQuery, StoreFeatures, StoreManager,
};
pub use memory::{FaultKind, FaultPlan, FaultTarget, InMemoryStore, InMemoryStoreManager, StoreOp};
pub use operation::BackendOperation;
