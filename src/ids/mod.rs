#![forbid(unsafe_code)]

/// Composition of placement, pools and authority.
pub mod assigner;
/// Lock-guarded counter allocation of id blocks.
pub mod authority;
/// Contiguous id ranges.
pub mod block;
/// Runtime options for the authority and pools.
pub mod options;
/// Partition id ranges and key range mapping.
pub mod partition;
/// Partition selection strategies.
pub mod placement;
/// Single-id pools with background block renewal.
pub mod pool;
/// Per-namespace block sizing.
pub mod sizer;

pub use assigner::{AssignedId, IdAssigner, MAX_PARTITION_RENEW_ATTEMPTS};
pub use authority::{ConsistentKeyIdAuthority, IdAuthority};
pub use block::IdBlock;
pub use options::{IdAuthorityOptions, IdPoolOptions, DEFAULT_ID_STORE_NAME};
pub use partition::PartitionIdRange;
pub use placement::{
    IdPlacementStrategy, PartitionValue, PlacementElement, PropertyMap,
    PropertyPlacementStrategy, SimpleBulkPlacementStrategy,
};
pub use pool::StandardIdPool;
pub use sizer::{FixedBlockSizer, IdBlockSizer, PoolType, PoolTypeBlockSizer};
