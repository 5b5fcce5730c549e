use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::locking::locker::{describe_fingerprint, ConsistentKeyLocker};
use crate::locking::serializer;
use crate::storage::{BackendOperation, Entry, KeyColumnValueStore, KeySliceQuery, SliceQuery};
use crate::types::{ClaimError, KeyColumn, Result, TxId};

struct PendingMutation {
    key: Bytes,
    additions: Vec<Entry>,
    deletions: Vec<Bytes>,
}

/// A transaction that locks cells, states the values it expects them to
/// hold, and applies its mutations once both the locks and the expectations
/// have been verified.
///
/// Mutations are buffered and written exactly once, by [`Self::commit`].
/// Locks are released on commit, on rollback, and when the transaction is
/// dropped unfinished.
pub struct ExpectedValueTransaction {
    tx: TxId,
    locker: Arc<ConsistentKeyLocker>,
    data_store: Arc<dyn KeyColumnValueStore>,
    expected: BTreeSet<KeyColumn>,
    mutations: Vec<PendingMutation>,
    prepared: bool,
    finished: bool,
}

impl ExpectedValueTransaction {
    /// Starts a transaction writing to `data_store`, whose cells are guarded by `locker`.
    pub fn new(locker: Arc<ConsistentKeyLocker>, data_store: Arc<dyn KeyColumnValueStore>) -> Self {
        Self {
            tx: TxId::next(),
            locker,
            data_store,
            expected: BTreeSet::new(),
            mutations: Vec::new(),
            prepared: false,
            finished: false,
        }
    }

    pub fn id(&self) -> TxId {
        self.tx
    }

    /// Claims `kc` and records the value the cell must still hold at commit
    /// (`None` means the cell must be absent). Only a fingerprint of the
    /// value is kept, in the claim itself. The first expectation recorded
    /// for a cell is kept.
    pub fn acquire_lock(&mut self, kc: KeyColumn, expected: Option<Bytes>) -> Result<()> {
        if self.prepared {
            return Err(ClaimError::Invalid(
                "locks must be acquired before mutations are prepared",
            ));
        }
        self.locker
            .write_lock_expecting(&kc, self.tx, expected.as_deref())?;
        self.expected.insert(kc);
        Ok(())
    }

    /// Buffers a mutation to apply at commit.
    pub fn mutate(&mut self, key: impl Into<Bytes>, additions: Vec<Entry>, deletions: Vec<Bytes>) {
        self.mutations.push(PendingMutation {
            key: key.into(),
            additions,
            deletions,
        });
    }

    /// Verifies every lock and every expected value. Runs at most once; any
    /// later call returns immediately.
    pub fn prepare_for_mutations(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        self.locker.check_locks(self.tx)?;
        self.check_expected_values()?;
        self.prepared = true;
        Ok(())
    }

    fn check_expected_values(&self) -> Result<()> {
        let opts = self.locker.options();
        for kc in &self.expected {
            let expected = self
                .locker
                .claim_fingerprint(kc, self.tx)
                .ok_or(ClaimError::Invalid("expected value recorded without a claim"))?;
            let query = KeySliceQuery::new(kc.key().clone(), SliceQuery::single(kc.column()));
            let found = BackendOperation::new(
                "expected.read_cell",
                self.locker.times().as_ref(),
                opts.operation_timeout,
            )
            .execute(|| self.data_store.get_slice(&query))?
            .into_iter()
            .find(|entry| entry.column == *kc.column())
            .map(|entry| serializer::fingerprint(&entry.value));
            if found != expected {
                warn!(key = %kc, tx = %self.tx, "expected.value_mismatch");
                return Err(ClaimError::PermanentLocking(format!(
                    "expected value mismatch on {kc}: expected {}, found {}",
                    describe_fingerprint(expected),
                    describe_fingerprint(found)
                )));
            }
        }
        Ok(())
    }

    /// Verifies, applies the buffered mutations once, and releases all locks.
    /// Locks are released whether or not the commit succeeds.
    pub fn commit(mut self) -> Result<()> {
        let result = self.apply();
        self.finish();
        if result.is_ok() {
            debug!(tx = %self.tx, "expected.committed");
        }
        result
    }

    fn apply(&mut self) -> Result<()> {
        self.prepare_for_mutations()?;
        for m in self.mutations.drain(..) {
            self.data_store.mutate(&m.key, &m.additions, &m.deletions)?;
        }
        Ok(())
    }

    /// Discards buffered mutations and releases all locks.
    pub fn rollback(mut self) {
        self.mutations.clear();
        self.finish();
    }

    fn finish(&mut self) {
        if !self.finished {
            self.locker.delete_locks(self.tx);
            self.finished = true;
        }
    }
}

impl Drop for ExpectedValueTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}
