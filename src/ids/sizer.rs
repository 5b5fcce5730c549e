use serde::{Deserialize, Serialize};

use crate::types::{ClaimError, IdNamespace, Result};

/// Per-namespace block size and id limit.
pub trait IdBlockSizer: Send + Sync {
    /// Number of ids to reserve per allocation in `namespace`.
    fn block_size(&self, namespace: IdNamespace) -> u64;

    /// Exclusive upper bound of ids in `namespace` for any single partition.
    fn id_upper_bound(&self, namespace: IdNamespace) -> u64;
}

/// One block size and limit for every namespace.
#[derive(Clone, Copy, Debug)]
pub struct FixedBlockSizer {
    block_size: u64,
    upper_bound: u64,
}

impl FixedBlockSizer {
    pub fn new(block_size: u64, upper_bound: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(ClaimError::Config("block size must be positive".into()));
        }
        if upper_bound == 0 {
            return Err(ClaimError::Config("id upper bound must be positive".into()));
        }
        Ok(Self {
            block_size,
            upper_bound,
        })
    }
}

impl IdBlockSizer for FixedBlockSizer {
    fn block_size(&self, _namespace: IdNamespace) -> u64 {
        self.block_size
    }

    fn id_upper_bound(&self, _namespace: IdNamespace) -> u64 {
        self.upper_bound
    }
}

/// Kinds of id pools a graph keeps; each is its own namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    NormalVertex,
    UnmodifiableVertex,
    PartitionedVertex,
    Relation,
    Schema,
}

impl PoolType {
    pub const ALL: [PoolType; 5] = [
        PoolType::NormalVertex,
        PoolType::UnmodifiableVertex,
        PoolType::PartitionedVertex,
        PoolType::Relation,
        PoolType::Schema,
    ];

    pub const fn namespace(self) -> IdNamespace {
        match self {
            PoolType::NormalVertex => 0,
            PoolType::UnmodifiableVertex => 1,
            PoolType::PartitionedVertex => 2,
            PoolType::Relation => 3,
            PoolType::Schema => 4,
        }
    }

    pub fn from_namespace(namespace: IdNamespace) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.namespace() == namespace)
    }
}

const SCHEMA_BLOCK_SIZE: u64 = 50;
const MIN_BLOCK_SIZE: u64 = 10;

/// Sizes blocks by pool type: rarely created kinds get small blocks so
/// fewer ids are wasted when an instance stops, relations get large ones.
#[derive(Clone, Copy, Debug)]
pub struct PoolTypeBlockSizer {
    base: u64,
    upper_bound: u64,
}

impl PoolTypeBlockSizer {
    pub fn new(base: u64, upper_bound: u64) -> Result<Self> {
        if base == 0 {
            return Err(ClaimError::Config("block size must be positive".into()));
        }
        if upper_bound == 0 {
            return Err(ClaimError::Config("id upper bound must be positive".into()));
        }
        Ok(Self { base, upper_bound })
    }

    pub fn block_size_for(&self, pool: PoolType) -> u64 {
        match pool {
            PoolType::NormalVertex => self.base,
            PoolType::UnmodifiableVertex => (self.base / 10).max(MIN_BLOCK_SIZE),
            PoolType::PartitionedVertex => (self.base / 100).max(MIN_BLOCK_SIZE),
            PoolType::Relation => self.base.saturating_mul(8),
            PoolType::Schema => SCHEMA_BLOCK_SIZE,
        }
    }
}

impl IdBlockSizer for PoolTypeBlockSizer {
    fn block_size(&self, namespace: IdNamespace) -> u64 {
        let pool = PoolType::from_namespace(namespace).unwrap_or(PoolType::NormalVertex);
        self.block_size_for(pool)
    }

    fn id_upper_bound(&self, _namespace: IdNamespace) -> u64 {
        self.upper_bound
    }
}
