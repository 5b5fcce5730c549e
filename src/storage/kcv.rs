use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::primitives::bytes::bound;
use crate::types::Result;

/// One column and its value under a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    /// Column name; rows are ordered by it.
    pub column: Bytes,
    /// Stored value.
    pub value: Bytes,
}

impl Entry {
    /// Creates an entry from anything convertible into [`Bytes`].
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Half-open column range `[start, end)` with an optional row limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceQuery {
    /// Inclusive lower column bound.
    pub start: Bytes,
    /// Exclusive upper column bound; `None` reads to the end of the row.
    pub end: Option<Bytes>,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

impl SliceQuery {
    /// Every column in a row.
    pub fn all() -> Self {
        Self {
            start: Bytes::new(),
            end: None,
            limit: None,
        }
    }

    /// Exactly one column.
    pub fn single(column: &[u8]) -> Self {
        Self {
            start: Bytes::copy_from_slice(column),
            end: Some(Bytes::from(bound::next_column(column))),
            limit: Some(1),
        }
    }

    /// Returns `true` when `column` falls inside the range.
    pub fn contains(&self, column: &[u8]) -> bool {
        column >= self.start.as_ref()
            && self.end.as_ref().map_or(true, |end| column < end.as_ref())
    }
}

/// A [`SliceQuery`] bound to a row key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: Bytes,
    pub slice: SliceQuery,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<Bytes>, slice: SliceQuery) -> Self {
        Self {
            key: key.into(),
            slice,
        }
    }
}

/// Capabilities a backend advertises to the layers above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreFeatures {
    /// Reads issued after a write on the same key observe that write.
    pub key_consistent: bool,
    /// The store is shared by more than one process.
    pub distributed: bool,
    /// The manager can report which key ranges are stored locally.
    pub local_key_partition: bool,
}

impl Default for StoreFeatures {
    fn default() -> Self {
        Self {
            key_consistent: true,
            distributed: false,
            local_key_partition: false,
        }
    }
}

/// Key-space interval `[start, end)` owned by this instance. `start > end`
/// wraps around the end of the key space; `start == end` covers all of it.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: Bytes,
    end: Bytes,
}

impl KeyRange {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn start(&self) -> &Bytes {
        &self.start
    }

    pub fn end(&self) -> &Bytes {
        &self.end
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KeyRange({}..{})",
            hex::encode(&self.start),
            hex::encode(&self.end)
        )
    }
}

/// The ordered key-column-value contract the protocols are built on.
///
/// Implementations only need blind writes and range reads; nothing here
/// assumes compare-and-swap.
pub trait KeyColumnValueStore: Send + Sync {
    /// Store name, used to derive lock-store and mediator names.
    fn name(&self) -> &str;

    /// Reads the columns of `query.key` inside `query.slice`, in column order.
    fn get_slice(&self, query: &KeySliceQuery) -> Result<Vec<Entry>>;

    /// Applies `deletions` then `additions` to one row.
    fn mutate(&self, key: &[u8], additions: &[Entry], deletions: &[Bytes]) -> Result<()>;
}

/// Opens named stores on one backend.
pub trait StoreManager: Send + Sync {
    /// Opens (creating on first use) the store called `name`.
    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>>;

    /// Capabilities of this backend.
    fn features(&self) -> StoreFeatures;

    /// Key ranges held by this instance. Only meaningful when
    /// [`StoreFeatures::local_key_partition`] is set.
    fn local_key_partition(&self) -> Result<Vec<KeyRange>>;
}
