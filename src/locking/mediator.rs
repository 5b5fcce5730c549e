use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::trace;

use crate::primitives::time::{Timestamp, TimestampProvider};
use crate::types::{ClaimError, KeyColumn, Result, TxId};

const DEFAULT_SHARDS: usize = 16;

#[derive(Clone, Copy, Debug)]
struct AuditRecord {
    holder: TxId,
    expires: Timestamp,
}

/// In-process lock table that lets transactions of one process settle
/// contention among themselves before any of them writes a remote claim.
///
/// Entries go stale once their expiry passes, mirroring remote claim
/// expiry. Keys are spread over mutex-guarded shards, so registrations on
/// different keys do not serialize.
pub struct LocalLockMediator {
    name: String,
    times: Arc<dyn TimestampProvider>,
    shards: Vec<Mutex<FxHashMap<KeyColumn, AuditRecord>>>,
}

impl LocalLockMediator {
    pub fn new(name: impl Into<String>, times: Arc<dyn TimestampProvider>) -> Self {
        Self::with_shards(name, times, DEFAULT_SHARDS)
    }

    pub fn with_shards(
        name: impl Into<String>,
        times: Arc<dyn TimestampProvider>,
        shards: usize,
    ) -> Self {
        let shard_count = shards.max(1);
        let mut shard_vec = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shard_vec.push(Mutex::new(FxHashMap::default()));
        }
        Self {
            name: name.into(),
            times,
            shards: shard_vec,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn shard_for(&self, kc: &KeyColumn) -> &Mutex<FxHashMap<KeyColumn, AuditRecord>> {
        let mut hasher = FxHasher::default();
        kc.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Registers `holder` for `kc` until `expires`.
    ///
    /// Succeeds when no live entry exists, when the entry has expired, or when
    /// `holder` already owns it (its expiry is then refreshed). Returns
    /// `false` without side effects otherwise.
    pub fn lock(&self, kc: &KeyColumn, holder: TxId, expires: Timestamp) -> bool {
        let now = self.times.now();
        let mut guard = self.shard_for(kc).lock();
        match guard.get_mut(kc) {
            Some(record) if record.holder == holder => {
                record.expires = expires;
                trace!(mediator = %self.name, key = %kc, %holder, "mediator.lock.refreshed");
                true
            }
            Some(record) if record.expires > now => {
                trace!(
                    mediator = %self.name,
                    key = %kc,
                    %holder,
                    owner = %record.holder,
                    "mediator.lock.contended"
                );
                false
            }
            Some(record) => {
                trace!(
                    mediator = %self.name,
                    key = %kc,
                    %holder,
                    previous = %record.holder,
                    "mediator.lock.expired_takeover"
                );
                *record = AuditRecord { holder, expires };
                true
            }
            None => {
                guard.insert(kc.clone(), AuditRecord { holder, expires });
                trace!(mediator = %self.name, key = %kc, %holder, "mediator.lock.acquired");
                true
            }
        }
    }

    /// Removes the entry for `kc` if `holder` owns it.
    pub fn unlock(&self, kc: &KeyColumn, holder: TxId) -> bool {
        let mut guard = self.shard_for(kc).lock();
        match guard.get(kc) {
            Some(record) if record.holder == holder => {
                guard.remove(kc);
                trace!(mediator = %self.name, key = %kc, %holder, "mediator.unlock");
                true
            }
            _ => false,
        }
    }

    /// Current live owner of `kc`, if any.
    pub fn holder(&self, kc: &KeyColumn) -> Option<TxId> {
        let now = self.times.now();
        let guard = self.shard_for(kc).lock();
        guard
            .get(kc)
            .filter(|record| record.expires > now)
            .map(|record| record.holder)
    }

    /// Number of registered entries, expired ones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-level map from mediator name to shared [`LocalLockMediator`].
///
/// Lockers that should mediate against each other must be built from the
/// same registry.
pub struct MediatorRegistry {
    times: Arc<dyn TimestampProvider>,
    mediators: Mutex<FxHashMap<String, Arc<LocalLockMediator>>>,
}

impl MediatorRegistry {
    pub fn new(times: Arc<dyn TimestampProvider>) -> Self {
        Self {
            times,
            mediators: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the mediator called `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Result<Arc<LocalLockMediator>> {
        if name.is_empty() {
            return Err(ClaimError::Config("mediator name must not be empty".into()));
        }
        let mut mediators = self.mediators.lock();
        let mediator = mediators
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(LocalLockMediator::new(name, self.times.clone())));
        Ok(mediator.clone())
    }
}
