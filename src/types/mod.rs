#![forbid(unsafe_code)]
//! Identifiers and the crate-wide error type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

/// Partition identifier within `[0, partition_bound)`.
pub type PartitionId = u32;

/// Id namespace; each namespace keeps an independent counter per partition.
pub type IdNamespace = u32;

#[derive(thiserror::Error, Debug)]
pub enum ClaimError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("temporary backend failure: {0}")]
    TemporaryBackend(String),
    #[error("permanent backend failure: {0}")]
    PermanentBackend(String),
    #[error("temporary locking failure: {0}")]
    TemporaryLocking(String),
    #[error("permanent locking failure: {0}")]
    PermanentLocking(String),
    #[error("expired lock: {0}")]
    ExpiredLock(String),
    #[error("id pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("id allocation failed: {0}")]
    AllocationFailed(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("interrupted while waiting")]
    Interrupted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("corruption: {0}")]
    Corruption(&'static str),
}

pub type Result<T> = std::result::Result<T, ClaimError>;

impl ClaimError {
    /// Returns `true` for failures that may succeed when retried.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            ClaimError::TemporaryBackend(_)
                | ClaimError::TemporaryLocking(_)
                | ClaimError::Timeout(_)
                | ClaimError::Interrupted
        )
    }

    /// Returns `true` for failures produced by the locking protocol itself
    /// rather than by the store.
    pub fn is_locking(&self) -> bool {
        matches!(
            self,
            ClaimError::TemporaryLocking(_)
                | ClaimError::PermanentLocking(_)
                | ClaimError::ExpiredLock(_)
        )
    }

    /// Returns `true` when a partition or namespace has run out of ids.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ClaimError::PoolExhausted(_))
    }
}

/// Opaque identifier of a running graph instance, used to tie-break claims.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Rid(Bytes);

static RID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl Rid {
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ClaimError::Invalid("rid must not be empty"));
        }
        Ok(Self(bytes))
    }

    /// Derives a rid from the host name, the process id and a per-process
    /// sequence, so several instances inside one process stay distinct.
    pub fn from_process() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_owned());
        let seq = RID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let text = format!("{host}-{}-{seq}", std::process::id());
        Self(Bytes::from(text.into_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid({self})")
    }
}

/// The storage cell a lock protects. Two claims conflict iff their key columns are equal.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct KeyColumn {
    key: Bytes,
    column: Bytes,
}

impl KeyColumn {
    pub fn new(key: impl Into<Bytes>, column: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn column(&self) -> &Bytes {
        &self.column
    }
}

impl fmt::Display for KeyColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", hex::encode(&self.key), hex::encode(&self.column))
    }
}

/// Handle identifying one local transaction to the lockers and mediators.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

static TX_SEQUENCE: AtomicU64 = AtomicU64::new(1);

impl TxId {
    /// Returns a fresh, process-unique transaction handle.
    pub fn next() -> Self {
        TxId(TX_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}
