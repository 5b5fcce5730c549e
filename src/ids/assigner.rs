use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, trace};

use crate::ids::authority::IdAuthority;
use crate::ids::options::IdPoolOptions;
use crate::ids::partition::PartitionIdRange;
use crate::ids::placement::{IdPlacementStrategy, PlacementElement};
use crate::ids::pool::StandardIdPool;
use crate::types::{ClaimError, IdNamespace, PartitionId, Result};

/// Partitions tried for one element before giving up.
pub const MAX_PARTITION_RENEW_ATTEMPTS: usize = 1000;

/// An id handed to a new element: its partition plus the per-partition count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct AssignedId {
    pub partition: PartitionId,
    pub namespace: IdNamespace,
    pub count: u64,
    pub partition_bound: PartitionId,
}

impl AssignedId {
    /// Packs count and partition into one id, `None` on overflow.
    pub fn element_id(&self) -> Option<u64> {
        self.count
            .checked_mul(u64::from(self.partition_bound))?
            .checked_add(u64::from(self.partition))
    }
}

/// Assigns ids to new elements: placement picks the partition, a per-scope
/// pool supplies the count, and exhausted partitions are routed around.
pub struct IdAssigner {
    authority: Arc<dyn IdAuthority>,
    placement: Arc<dyn IdPlacementStrategy>,
    partition_bound: PartitionId,
    pool_opts: IdPoolOptions,
    pools: Mutex<FxHashMap<(PartitionId, IdNamespace), Arc<StandardIdPool>>>,
}

impl IdAssigner {
    pub fn new(
        authority: Arc<dyn IdAuthority>,
        placement: Arc<dyn IdPlacementStrategy>,
        partition_bound: PartitionId,
        pool_opts: IdPoolOptions,
    ) -> Result<Self> {
        if partition_bound == 0 {
            return Err(ClaimError::Config("partition bound must be positive".into()));
        }
        pool_opts.validate()?;
        Ok(Self {
            authority,
            placement,
            partition_bound,
            pool_opts,
            pools: Mutex::new(FxHashMap::default()),
        })
    }

    /// Restricts placement to the partitions whose keys this instance stores.
    pub fn use_local_partitions(&self) -> Result<Vec<PartitionIdRange>> {
        let key_ranges = self.authority.local_id_partition()?;
        let ranges = PartitionIdRange::from_key_ranges(&key_ranges, self.partition_bound)?;
        if ranges.is_empty() {
            return Err(ClaimError::Config(
                "local key ranges contain no whole partition".into(),
            ));
        }
        self.placement.set_local_partition_bounds(ranges.clone())?;
        debug!(ranges = ranges.len(), "assigner.local_partitions");
        Ok(ranges)
    }

    fn pool(&self, partition: PartitionId, namespace: IdNamespace) -> Result<Arc<StandardIdPool>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&(partition, namespace)) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(StandardIdPool::new(
            self.authority.clone(),
            partition,
            namespace,
            self.pool_opts,
        )?);
        pools.insert((partition, namespace), pool.clone());
        Ok(pool)
    }

    /// Takes one id from `partition`; `Ok(None)` when the partition is
    /// exhausted and placement has been told.
    fn take(&self, partition: PartitionId, namespace: IdNamespace) -> Result<Option<AssignedId>> {
        if partition >= self.partition_bound {
            return Err(ClaimError::Invalid("placement chose a partition out of bounds"));
        }
        match self.pool(partition, namespace)?.next_id() {
            Ok(count) => Ok(Some(AssignedId {
                partition,
                namespace,
                count,
                partition_bound: self.partition_bound,
            })),
            Err(err) if err.is_exhausted() => {
                debug!(partition, namespace, "assigner.partition.exhausted");
                self.placement.exhausted_partition(partition);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn place<T>(&self, placed: Result<T>) -> Result<T> {
        placed.map_err(|err| {
            if err.is_exhausted() {
                ClaimError::AllocationFailed(format!("no viable partition left: {err}"))
            } else {
                err
            }
        })
    }

    pub fn assign_id(
        &self,
        element: &dyn PlacementElement,
        namespace: IdNamespace,
    ) -> Result<AssignedId> {
        for attempt in 0..MAX_PARTITION_RENEW_ATTEMPTS {
            let partition = self.place(self.placement.get_partition(element))?;
            if let Some(id) = self.take(partition, namespace)? {
                return Ok(id);
            }
            trace!(attempt, partition, "assigner.retry");
        }
        Err(ClaimError::AllocationFailed(format!(
            "no non-exhausted partition after {MAX_PARTITION_RENEW_ATTEMPTS} attempts"
        )))
    }

    /// Assigns ids to a batch, placing it together where the strategy
    /// allows. Output order matches `elements`.
    pub fn assign_ids(
        &self,
        elements: &[&dyn PlacementElement],
        namespace: IdNamespace,
    ) -> Result<Vec<AssignedId>> {
        let mut out: Vec<Option<AssignedId>> = vec![None; elements.len()];
        let mut pending: Vec<usize> = (0..elements.len()).collect();
        for _ in 0..MAX_PARTITION_RENEW_ATTEMPTS {
            if pending.is_empty() {
                break;
            }
            let batch: Vec<&dyn PlacementElement> = pending.iter().map(|&i| elements[i]).collect();
            let partitions = self.place(self.placement.get_partitions(&batch))?;
            let mut leftover = Vec::new();
            for (pos, (&idx, &partition)) in pending.iter().zip(partitions.iter()).enumerate() {
                match self.take(partition, namespace)? {
                    Some(id) => out[idx] = Some(id),
                    None => {
                        leftover.extend_from_slice(&pending[pos..]);
                        break;
                    }
                }
            }
            if !leftover.is_empty() {
                debug!(left = leftover.len(), "assigner.batch.leftover");
            }
            pending = leftover;
        }
        if !pending.is_empty() {
            return Err(ClaimError::AllocationFailed(format!(
                "no non-exhausted partition after {MAX_PARTITION_RENEW_ATTEMPTS} attempts"
            )));
        }
        Ok(out.into_iter().flatten().collect())
    }

    /// Closes every pool; later calls open fresh pools.
    pub fn close(&self) {
        for (_, pool) in self.pools.lock().drain() {
            pool.close();
        }
    }
}
