use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::primitives::time::Timestamp;
use crate::types::{KeyColumn, TxId};

/// What a locker remembers about one claim it wrote for a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockStatus {
    /// Timestamp encoded in the claim column.
    pub write_ts: Timestamp,
    /// Instant after which the claim no longer counts.
    pub expire_ts: Timestamp,
    /// Fingerprint of the expected value carried in the claim value.
    pub fingerprint: Option<u64>,
}

impl LockStatus {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expire_ts
    }
}

/// Per-transaction lock bookkeeping. Locks of one transaction are kept in
/// key order so they are always verified in the same sequence.
#[derive(Default)]
pub struct LockerState {
    txs: Mutex<FxHashMap<TxId, BTreeMap<KeyColumn, LockStatus>>>,
}

impl LockerState {
    pub fn get(&self, tx: TxId, kc: &KeyColumn) -> Option<LockStatus> {
        self.txs.lock().get(&tx).and_then(|locks| locks.get(kc).copied())
    }

    pub fn insert(&self, tx: TxId, kc: KeyColumn, status: LockStatus) {
        self.txs.lock().entry(tx).or_default().insert(kc, status);
    }

    /// Copy of the transaction's locks in verification order.
    pub fn snapshot(&self, tx: TxId) -> Vec<(KeyColumn, LockStatus)> {
        self.txs
            .lock()
            .get(&tx)
            .map(|locks| locks.iter().map(|(kc, s)| (kc.clone(), *s)).collect())
            .unwrap_or_default()
    }

    pub fn remove(&self, tx: TxId, kc: &KeyColumn) -> Option<LockStatus> {
        let mut txs = self.txs.lock();
        let locks = txs.get_mut(&tx)?;
        let status = locks.remove(kc);
        if locks.is_empty() {
            txs.remove(&tx);
        }
        status
    }

    /// Forgets every lock of the transaction and returns them.
    pub fn take(&self, tx: TxId) -> BTreeMap<KeyColumn, LockStatus> {
        self.txs.lock().remove(&tx).unwrap_or_default()
    }
}
