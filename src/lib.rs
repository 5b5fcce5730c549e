//! Keyclaim: cross-instance locking and id block allocation on top of an
//! ordered key-column-value store.
//!
//! Instances coordinate only through timestamped claims written into the
//! store. [`locking`] implements the claim protocol and its in-process
//! mediator; [`ids`] builds unique id blocks, pools and partition placement
//! on top of it.

#![warn(missing_docs)]

/// TOML configuration and conversion into runtime options.
pub mod config;
/// Unique id allocation and partition placement.
pub mod ids;
/// Claim-based locking across instances.
pub mod locking;
/// Counters for lock and allocation activity.
pub mod metrics;
/// Byte encodings and clocks.
pub mod primitives;
/// Key-column-value store contract and the in-memory backend.
pub mod storage;
/// Identifiers and the crate-wide error type.
pub mod types;

pub use types::{ClaimError, Result};
