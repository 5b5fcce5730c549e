use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::ids::block::IdBlock;
use crate::ids::options::IdAuthorityOptions;
use crate::ids::sizer::IdBlockSizer;
use crate::locking::{ConsistentKeyLocker, LockerOptions, MediatorRegistry};
use crate::metrics::{default_metrics, ClaimMetrics};
use crate::primitives::bytes::ord;
use crate::primitives::time::TimestampProvider;
use crate::storage::{
    BackendOperation, Entry, KeyColumnValueStore, KeyRange, KeySliceQuery, SliceQuery,
    StoreManager,
};
use crate::types::{ClaimError, IdNamespace, KeyColumn, PartitionId, Result, Rid, TxId};

const COUNTER_COLUMN: &[u8] = b"counter";
const MAX_BACKOFF_FACTOR: u32 = 32;
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Source of fresh id blocks.
pub trait IdAuthority: Send + Sync {
    /// Returns a block of never-issued ids for `(partition, namespace)`,
    /// giving up after `timeout`.
    ///
    /// Fails with [`ClaimError::PoolExhausted`] once the scope has reached its
    /// id limit; that failure is final for the scope.
    fn get_id_block(
        &self,
        partition: PartitionId,
        namespace: IdNamespace,
        timeout: Duration,
    ) -> Result<IdBlock>;

    /// Key ranges stored on this instance.
    fn local_id_partition(&self) -> Result<Vec<KeyRange>>;

    /// Identity of this authority in lock claims.
    fn rid(&self) -> &Rid;
}

/// Allocates blocks by advancing a per-scope counter in the KCV store while
/// holding that counter's lock.
///
/// The counter is a plain column; two allocations never overlap only because
/// every read-advance-write happens under the lock.
pub struct ConsistentKeyIdAuthority {
    store: Arc<dyn KeyColumnValueStore>,
    manager: Arc<dyn StoreManager>,
    locker: ConsistentKeyLocker,
    times: Arc<dyn TimestampProvider>,
    sizer: Arc<dyn IdBlockSizer>,
    exhausted: Mutex<FxHashSet<(PartitionId, IdNamespace)>>,
    key_consistent: bool,
    metrics: Arc<dyn ClaimMetrics>,
    opts: IdAuthorityOptions,
}

impl ConsistentKeyIdAuthority {
    pub fn open(
        manager: Arc<dyn StoreManager>,
        times: Arc<dyn TimestampProvider>,
        registry: &MediatorRegistry,
        locker_opts: LockerOptions,
        sizer: Arc<dyn IdBlockSizer>,
        opts: IdAuthorityOptions,
    ) -> Result<Self> {
        opts.validate()?;
        let store = manager.open_store(&opts.store_name)?;
        let locker = ConsistentKeyLocker::open(
            manager.as_ref(),
            &opts.store_name,
            times.clone(),
            registry,
            locker_opts,
        )?;
        let key_consistent = manager.features().key_consistent;
        let metrics = opts.metrics.clone().unwrap_or_else(default_metrics);
        Ok(Self {
            store,
            manager,
            locker,
            times,
            sizer,
            exhausted: Mutex::new(FxHashSet::default()),
            key_consistent,
            metrics,
            opts,
        })
    }

    /// The lock protecting the counter of `(partition, namespace)`.
    pub fn counter_key_column(partition: PartitionId, namespace: IdNamespace) -> KeyColumn {
        let mut key = Vec::with_capacity(8);
        ord::put_u32_be(&mut key, partition);
        ord::put_u32_be(&mut key, namespace);
        KeyColumn::new(key, Bytes::from_static(COUNTER_COLUMN))
    }

    /// Whether `(partition, namespace)` has been reported exhausted.
    pub fn is_exhausted(&self, partition: PartitionId, namespace: IdNamespace) -> bool {
        self.exhausted.lock().contains(&(partition, namespace))
    }

    fn try_allocate(
        &self,
        partition: PartitionId,
        namespace: IdNamespace,
        block_size: u64,
        limit: u64,
    ) -> Result<IdBlock> {
        let kc = Self::counter_key_column(partition, namespace);
        let tx = TxId::next();
        let result = self.allocate_locked(&kc, tx, partition, namespace, block_size, limit);
        self.locker.delete_locks(tx);
        result
    }

    fn allocate_locked(
        &self,
        kc: &KeyColumn,
        tx: TxId,
        partition: PartitionId,
        namespace: IdNamespace,
        block_size: u64,
        limit: u64,
    ) -> Result<IdBlock> {
        self.locker.lock(kc, tx)?;
        let lower = self.read_counter(kc)?;
        if lower >= limit {
            return Err(ClaimError::PoolExhausted(format!(
                "partition {partition} namespace {namespace} reached id limit {limit}"
            )));
        }
        // the lock may have been lost while reading
        self.locker.check_locks(tx)?;
        let upper = lower.saturating_add(block_size);
        self.write_counter(kc, upper)?;
        if !self.key_consistent {
            let observed = self.read_counter(kc)?;
            if observed != upper {
                return Err(ClaimError::TemporaryBackend(format!(
                    "counter of partition {partition} namespace {namespace} read back as {observed}, wrote {upper}"
                )));
            }
        }
        Ok(IdBlock::new(lower, block_size.min(limit - lower)))
    }

    fn read_counter(&self, kc: &KeyColumn) -> Result<u64> {
        let query = KeySliceQuery::new(kc.key().clone(), SliceQuery::single(kc.column()));
        let entries = BackendOperation::new(
            "authority.read_counter",
            self.times.as_ref(),
            self.opts.operation_timeout,
        )
        .metrics(self.metrics.as_ref())
        .execute(|| self.store.get_slice(&query))?;
        match entries.iter().find(|e| e.column == *kc.column()) {
            Some(entry) => ord::get_u64_be(&entry.value),
            None => Ok(0),
        }
    }

    fn write_counter(&self, kc: &KeyColumn, value: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        ord::put_u64_be(&mut buf, value);
        let entry = Entry::new(kc.column().clone(), buf);
        BackendOperation::new(
            "authority.write_counter",
            self.times.as_ref(),
            self.opts.operation_timeout,
        )
        .metrics(self.metrics.as_ref())
        .execute(|| self.store.mutate(kc.key(), std::slice::from_ref(&entry), &[]))
    }

    fn mark_exhausted(&self, partition: PartitionId, namespace: IdNamespace) {
        if self.exhausted.lock().insert((partition, namespace)) {
            self.metrics.partition_exhausted();
            info!(partition, namespace, "authority.partition.exhausted");
        }
    }
}

impl IdAuthority for ConsistentKeyIdAuthority {
    fn get_id_block(
        &self,
        partition: PartitionId,
        namespace: IdNamespace,
        timeout: Duration,
    ) -> Result<IdBlock> {
        if self.is_exhausted(partition, namespace) {
            return Err(ClaimError::PoolExhausted(format!(
                "partition {partition} namespace {namespace} is exhausted"
            )));
        }
        let block_size = self.sizer.block_size(namespace);
        let limit = self.sizer.id_upper_bound(namespace);
        if block_size == 0 {
            return Err(ClaimError::Config(format!(
                "block size for namespace {namespace} must be positive"
            )));
        }

        let start = self.times.now();
        let mut backoff = self.opts.wait.max(MIN_BACKOFF);
        let max_backoff = backoff * MAX_BACKOFF_FACTOR;
        loop {
            let err = match self.try_allocate(partition, namespace, block_size, limit) {
                Ok(block) => {
                    self.metrics.block_allocated(block.len());
                    debug!(
                        partition,
                        namespace,
                        block = %block,
                        rid = %self.locker.rid(),
                        "authority.block.allocated"
                    );
                    return Ok(block);
                }
                Err(err) if err.is_exhausted() => {
                    self.mark_exhausted(partition, namespace);
                    return Err(err);
                }
                Err(err) if err.is_temporary() || err.is_locking() => err,
                Err(err) => return Err(err),
            };
            let elapsed = self.times.now().duration_since(start);
            if elapsed >= timeout {
                warn!(partition, namespace, error = %err, "authority.allocation.timeout");
                return Err(ClaimError::AllocationFailed(format!(
                    "no block for partition {partition} namespace {namespace} within {timeout:?}: {err}"
                )));
            }
            debug!(
                partition,
                namespace,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "authority.allocation.retry"
            );
            self.times.sleep_for(backoff.min(timeout - elapsed))?;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    fn local_id_partition(&self) -> Result<Vec<KeyRange>> {
        self.manager.local_key_partition()
    }

    fn rid(&self) -> &Rid {
        self.locker.rid()
    }
}
