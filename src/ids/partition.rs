use std::fmt;

use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::storage::KeyRange;
use crate::types::{ClaimError, PartitionId, Result};

/// A contiguous range `[lower, upper)` of partition ids within
/// `[0, bound)`. Always non-empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionIdRange {
    lower: PartitionId,
    upper: PartitionId,
    bound: PartitionId,
}

impl PartitionIdRange {
    pub fn new(lower: PartitionId, upper: PartitionId, bound: PartitionId) -> Result<Self> {
        if bound == 0 {
            return Err(ClaimError::Config("partition bound must be positive".into()));
        }
        if lower >= upper || upper > bound {
            return Err(ClaimError::Config(format!(
                "invalid partition range [{lower},{upper}) for bound {bound}"
            )));
        }
        Ok(Self {
            lower,
            upper,
            bound,
        })
    }

    /// Every partition id.
    pub fn global(bound: PartitionId) -> Result<Self> {
        Self::new(0, bound, bound)
    }

    pub fn lower(&self) -> PartitionId {
        self.lower
    }

    pub fn upper(&self) -> PartitionId {
        self.upper
    }

    pub fn bound(&self) -> PartitionId {
        self.bound
    }

    pub fn len(&self) -> u32 {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        id >= self.lower && id < self.upper
    }

    /// The id `offset` places after `lower`, wrapping within the range.
    pub fn nth(&self, offset: u64) -> PartitionId {
        self.lower + (offset % u64::from(self.len())) as PartitionId
    }

    pub fn random_id<R: Rng + ?Sized>(&self, rng: &mut R) -> PartitionId {
        rng.gen_range(self.lower..self.upper)
    }

    /// Maps key ranges held by this instance onto the partitions whose whole
    /// key space lies inside them.
    ///
    /// Partition `p` owns keys whose 4-byte prefix falls in
    /// `[p * 2^32 / bound, (p + 1) * 2^32 / bound)`. Key ranges too narrow to
    /// contain a whole partition are dropped; wrapping key ranges are split
    /// into at most two non-wrapping partition ranges.
    pub fn from_key_ranges(ranges: &[KeyRange], bound: PartitionId) -> Result<Vec<Self>> {
        if bound == 0 {
            return Err(ClaimError::Config("partition bound must be positive".into()));
        }
        let mut out = Vec::new();
        for range in ranges {
            if range.start() == range.end() {
                out.push(Self::global(bound)?);
                continue;
            }
            let start = key_prefix(range.start());
            let end = key_prefix(range.end());
            let scaled = u64::from(start) * u64::from(bound);
            let mut lower = scaled >> 32;
            // lower is inclusive: round up if the range starts inside a partition
            let tail_nonzero = range.start().iter().skip(4).any(|b| *b != 0);
            if scaled & 0xffff_ffff != 0 || tail_nonzero {
                lower += 1;
            }
            let upper = (u64::from(end) * u64::from(bound)) >> 32;
            let (lower, upper) = (lower as u32, upper as u32);

            if range.start() < range.end() {
                if lower >= upper {
                    warn!(range = ?range, "partition.key_range.discarded");
                    continue;
                }
                out.push(Self::new(lower, upper, bound)?);
            } else if lower >= bound {
                // starts inside the last partition and wraps
                if upper > 0 {
                    out.push(Self::new(0, upper, bound)?);
                } else {
                    warn!(range = ?range, "partition.key_range.discarded");
                }
            } else if upper >= lower {
                out.push(Self::global(bound)?);
            } else {
                out.push(Self::new(lower, bound, bound)?);
                if upper > 0 {
                    out.push(Self::new(0, upper, bound)?);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for PartitionIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})/{}", self.lower, self.upper, self.bound)
    }
}

fn key_prefix(key: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    for (dst, src) in buf.iter_mut().zip(key.iter()) {
        *dst = *src;
    }
    u32::from_be_bytes(buf)
}
