use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::types::{ClaimError, Result};

/// A contiguous range `[start, start + len)` of ids owned by one requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct IdBlock {
    start: u64,
    len: u64,
}

impl IdBlock {
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    pub const fn start(&self) -> u64 {
        self.start
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive upper end.
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// The `index`-th id of the block.
    pub fn get(&self, index: u64) -> Result<u64> {
        if index >= self.len {
            return Err(ClaimError::Invalid("index outside id block"));
        }
        Ok(self.start + index)
    }

    pub fn iter(&self) -> Range<u64> {
        self.start..self.end()
    }

    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end()
    }

    pub fn overlaps(&self, other: &IdBlock) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end() && other.start < self.end()
    }
}

impl IntoIterator for IdBlock {
    type Item = u64;
    type IntoIter = Range<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for IdBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.start, self.end())
    }
}
