use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::locking::cleaner::ExpiredClaimCleaner;
use crate::locking::mediator::{LocalLockMediator, MediatorRegistry};
use crate::locking::options::LockerOptions;
use crate::locking::serializer::{self, TimestampRid};
use crate::locking::state::{LockStatus, LockerState};
use crate::metrics::{default_metrics, ClaimMetrics};
use crate::primitives::time::{Timestamp, TimestampProvider};
use crate::storage::{
    BackendOperation, Entry, KeyColumnValueStore, KeySliceQuery, SliceQuery, StoreManager,
};
use crate::types::{ClaimError, KeyColumn, Result, Rid, TxId};

/// Cross-instance lock built from timestamped claims in a KCV store.
///
/// A claim is a column `(timestamp, rid)` appended to the lock row of a
/// [`KeyColumn`]. After waiting `lock_wait` for the write to propagate, the
/// locker reads the row back; claims older than `lock_expire` are ignored and
/// the smallest remaining claim holds the lock. Transactions of the same
/// process are first serialized by a [`LocalLockMediator`], so at most one of
/// them ever writes a claim for a given key column.
pub struct ConsistentKeyLocker {
    store: Arc<dyn KeyColumnValueStore>,
    times: Arc<dyn TimestampProvider>,
    mediator: Arc<LocalLockMediator>,
    state: LockerState,
    cleaner: Option<ExpiredClaimCleaner>,
    metrics: Arc<dyn ClaimMetrics>,
    opts: LockerOptions,
}

impl ConsistentKeyLocker {
    /// Builds a locker writing claims into `lock_store`.
    pub fn new(
        lock_store: Arc<dyn KeyColumnValueStore>,
        times: Arc<dyn TimestampProvider>,
        mediator: Arc<LocalLockMediator>,
        opts: LockerOptions,
    ) -> Result<Self> {
        opts.validate()?;
        let cleaner = opts
            .clean_expired
            .then(|| ExpiredClaimCleaner::new(lock_store.clone()));
        let metrics = opts.metrics.clone().unwrap_or_else(default_metrics);
        Ok(Self {
            store: lock_store,
            times,
            mediator,
            state: LockerState::default(),
            cleaner,
            metrics,
            opts,
        })
    }

    /// Builds the locker guarding `data_store`: claims go to the store named
    /// `data_store + "_lock_"` and local mediation uses the registry entry
    /// `mediator_prefix + data_store`.
    pub fn open(
        manager: &dyn StoreManager,
        data_store: &str,
        times: Arc<dyn TimestampProvider>,
        registry: &MediatorRegistry,
        opts: LockerOptions,
    ) -> Result<Self> {
        opts.validate()?;
        let lock_store = manager.open_store(&serializer::lock_store_name(data_store))?;
        let mediator = registry.get(&format!("{}{}", opts.mediator_prefix, data_store))?;
        Self::new(lock_store, times, mediator, opts)
    }

    pub fn rid(&self) -> &Rid {
        &self.opts.rid
    }

    pub fn options(&self) -> &LockerOptions {
        &self.opts
    }

    pub fn times(&self) -> &Arc<dyn TimestampProvider> {
        &self.times
    }

    /// Writes a claim on `kc` for `tx` without verifying it.
    ///
    /// A no-op when `tx` already holds a claim on `kc`. Fails with
    /// [`ClaimError::PermanentLocking`] without touching the store when
    /// another local transaction holds `kc`.
    pub fn write_lock(&self, kc: &KeyColumn, tx: TxId) -> Result<()> {
        self.write_lock_with(kc, tx, None)
    }

    /// Like [`Self::write_lock`], recording a fingerprint of the value the
    /// transaction expects the protected cell to hold.
    pub fn write_lock_expecting(
        &self,
        kc: &KeyColumn,
        tx: TxId,
        expected: Option<&[u8]>,
    ) -> Result<()> {
        self.write_lock_with(kc, tx, expected.map(serializer::fingerprint))
    }

    fn write_lock_with(&self, kc: &KeyColumn, tx: TxId, fingerprint: Option<u64>) -> Result<()> {
        if self.state.get(tx, kc).is_some() {
            debug!(key = %kc, %tx, "locker.write.reentrant");
            return Ok(());
        }
        self.acquire_local(kc, tx)?;
        match self.write_single_lock(kc, fingerprint, None) {
            Ok(status) => {
                self.state.insert(tx, kc.clone(), status);
                Ok(())
            }
            Err(err) => {
                self.mediator.unlock(kc, tx);
                Err(err)
            }
        }
    }

    /// Appends one claim column, retrying temporary failures and slow writes
    /// up to the retry budget. `stale` is an earlier claim of ours to delete
    /// in the same mutation.
    fn write_single_lock(
        &self,
        kc: &KeyColumn,
        fingerprint: Option<u64>,
        stale: Option<Bytes>,
    ) -> Result<LockStatus> {
        let row = serializer::lock_row_key(kc);
        let value = serializer::claim_value(fingerprint);
        let mut pending_delete = stale;
        let mut last_err = None;
        for attempt in 1..=self.opts.retry_count {
            let before = self.times.now();
            let column = serializer::claim_column(before, &self.opts.rid);
            let deletions: Vec<Bytes> = pending_delete.take().into_iter().collect();
            let result = self.store.mutate(
                &row,
                &[Entry::new(column.clone(), value.clone())],
                &deletions,
            );
            let elapsed = self.times.now().duration_since(before);
            match result {
                Ok(()) => {
                    self.metrics.lock_written();
                    if !self.opts.lock_wait.is_zero() && elapsed > self.opts.lock_wait {
                        warn!(
                            key = %kc,
                            attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "locker.claim.slow_write"
                        );
                        pending_delete = Some(column);
                        last_err = Some(ClaimError::TemporaryLocking(format!(
                            "claim write on {kc} took {elapsed:?}, longer than lock wait {:?}",
                            self.opts.lock_wait
                        )));
                        continue;
                    }
                    debug!(key = %kc, ts = %before, attempt, "locker.claim.written");
                    return Ok(LockStatus {
                        write_ts: before,
                        expire_ts: before.saturating_add(self.opts.lock_expire),
                        fingerprint,
                    });
                }
                Err(err) if err.is_temporary() => {
                    self.metrics.backend_retry();
                    warn!(key = %kc, attempt, error = %err, "locker.claim.write_failed");
                    // the write may have landed; remove it with the next attempt
                    pending_delete = Some(column);
                    last_err = Some(err);
                }
                Err(err) => {
                    error!(key = %kc, error = %err, "locker.claim.write_failed");
                    return Err(err);
                }
            }
        }
        if let Some(column) = pending_delete {
            self.try_delete_claim(&row, column);
        }
        let cause = last_err.map(|e| e.to_string()).unwrap_or_default();
        error!(key = %kc, retries = self.opts.retry_count, cause = %cause, "locker.claim.gave_up");
        Err(ClaimError::PermanentBackend(format!(
            "could not write claim on {kc} after {} attempts: {cause}",
            self.opts.retry_count
        )))
    }

    /// Verifies every claim `tx` has written. Claims are always re-read; an
    /// earlier successful check is never trusted.
    pub fn check_locks(&self, tx: TxId) -> Result<()> {
        for (kc, status) in self.state.snapshot(tx) {
            self.check_single_lock(&kc, &status)?;
        }
        Ok(())
    }

    fn check_single_lock(&self, kc: &KeyColumn, status: &LockStatus) -> Result<()> {
        let now = self
            .times
            .sleep_past(status.write_ts.saturating_add(self.opts.lock_wait))?;
        let row = serializer::lock_row_key(kc);
        let query = KeySliceQuery::new(row, SliceQuery::all());
        let entries = BackendOperation::new(
            "locker.read_claims",
            self.times.as_ref(),
            self.opts.operation_timeout,
        )
        .metrics(self.metrics.as_ref())
        .execute(|| self.store.get_slice(&query))?;

        let cutoff = now.saturating_sub(self.opts.lock_expire);
        let mut live = Vec::with_capacity(entries.len());
        for entry in &entries {
            let claim = match serializer::parse_claim_column(&entry.column) {
                Ok(claim) => claim,
                Err(err) => {
                    warn!(key = %kc, error = %err, "locker.claim.undecodable");
                    continue;
                }
            };
            if claim.timestamp < cutoff {
                warn!(key = %kc, ts = %claim.timestamp, rid = %claim.rid, "locker.claim.expired");
                if let Some(cleaner) = &self.cleaner {
                    cleaner.clean(kc, cutoff);
                }
                if claim.rid == self.opts.rid && claim.timestamp == status.write_ts {
                    return Err(ClaimError::ExpiredLock(format!(
                        "claim on {kc} written at {} is older than lock expire {:?}",
                        claim.timestamp, self.opts.lock_expire
                    )));
                }
            } else {
                live.push((claim, &entry.value));
            }
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        self.check_seniority(kc, status, &live)
    }

    fn check_seniority(
        &self,
        kc: &KeyColumn,
        status: &LockStatus,
        live: &[(TimestampRid, &Bytes)],
    ) -> Result<()> {
        for (claim, value) in live {
            if claim.rid != self.opts.rid {
                self.metrics.lock_contended();
                debug!(key = %kc, holder = %claim.rid, ours = %self.opts.rid, "locker.check.contended");
                return Err(ClaimError::TemporaryLocking(format!(
                    "lock on {kc} already held by {} (we are {})",
                    claim.rid, self.opts.rid
                )));
            }
            if claim.timestamp == status.write_ts {
                self.verify_claim_value(kc, status, value)?;
                self.metrics.lock_checked();
                debug!(key = %kc, ts = %claim.timestamp, "locker.check.held");
                return Ok(());
            }
            warn!(
                key = %kc,
                actual = %claim.timestamp,
                expected = %status.write_ts,
                "locker.check.outdated_own_claim"
            );
        }
        if live.is_empty() {
            return Err(ClaimError::TemporaryLocking(format!(
                "no live claims found on {kc}"
            )));
        }
        Err(ClaimError::PermanentBackend(format!(
            "read {} claims on {kc} with our rid {} but none at our write timestamp {}",
            live.len(),
            self.opts.rid,
            status.write_ts
        )))
    }

    /// Our winning claim must still carry the fingerprint it was written with.
    fn verify_claim_value(&self, kc: &KeyColumn, status: &LockStatus, value: &[u8]) -> Result<()> {
        let stored = serializer::parse_claim_value(value)?;
        if stored != status.fingerprint {
            error!(key = %kc, ts = %status.write_ts, "locker.check.claim_value_altered");
            return Err(ClaimError::PermanentBackend(format!(
                "claim on {kc} carries fingerprint {}, wrote {}",
                describe_fingerprint(stored),
                describe_fingerprint(status.fingerprint)
            )));
        }
        Ok(())
    }

    /// Acquires `kc` for `tx`: writes a claim, waits, and verifies it.
    ///
    /// A lost verification is retried with a fresh claim up to the retry
    /// budget and then fails with [`ClaimError::PermanentLocking`]. Other
    /// failures release the claim and are returned as-is.
    pub fn lock(&self, kc: &KeyColumn, tx: TxId) -> Result<()> {
        if let Some(status) = self.state.get(tx, kc) {
            return self.check_single_lock(kc, &status);
        }
        let mut last_err = None;
        let mut stale = None;
        for attempt in 1..=self.opts.retry_count {
            self.acquire_local(kc, tx)?;
            let status = match self.write_single_lock(kc, None, stale.take()) {
                Ok(status) => status,
                Err(err) => {
                    self.mediator.unlock(kc, tx);
                    return Err(err);
                }
            };
            self.state.insert(tx, kc.clone(), status);
            match self.check_single_lock(kc, &status) {
                Ok(()) => return Ok(()),
                Err(err @ ClaimError::TemporaryLocking(_)) => {
                    debug!(key = %kc, attempt, error = %err, "locker.lock.retry");
                    self.state.remove(tx, kc);
                    stale = Some(serializer::claim_column(status.write_ts, &self.opts.rid));
                    last_err = Some(err);
                }
                Err(err) => {
                    self.release(kc, tx);
                    return Err(err);
                }
            }
        }
        self.mediator.unlock(kc, tx);
        if let Some(column) = stale {
            self.try_delete_claim(&serializer::lock_row_key(kc), column);
        }
        let cause = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(ClaimError::PermanentLocking(format!(
            "gave up on {kc} after {} attempts: {cause}",
            self.opts.retry_count
        )))
    }

    fn acquire_local(&self, kc: &KeyColumn, tx: TxId) -> Result<()> {
        let expires = self.times.now().saturating_add(self.opts.lock_expire);
        if self.mediator.lock(kc, tx, expires) {
            return Ok(());
        }
        self.metrics.lock_contended();
        let owner = self
            .mediator
            .holder(kc)
            .map(|h| h.to_string())
            .unwrap_or_else(|| "another transaction".to_owned());
        Err(ClaimError::PermanentLocking(format!(
            "local lock contention on {kc}: held by {owner}"
        )))
    }

    /// Releases every lock of `tx`: local mediation and bookkeeping are
    /// dropped and our own unexpired claim columns are deleted on a
    /// best-effort basis. A claim that cannot be deleted simply expires.
    pub fn delete_locks(&self, tx: TxId) {
        for (kc, status) in self.state.take(tx) {
            self.release_claim(&kc, tx, &status);
        }
    }

    fn release(&self, kc: &KeyColumn, tx: TxId) {
        if let Some(status) = self.state.remove(tx, kc) {
            self.release_claim(kc, tx, &status);
        }
    }

    fn release_claim(&self, kc: &KeyColumn, tx: TxId, status: &LockStatus) {
        if status.is_expired(self.times.now()) {
            debug!(key = %kc, %tx, ts = %status.write_ts, "locker.release.already_expired");
        } else {
            let row = serializer::lock_row_key(kc);
            self.try_delete_claim(&row, serializer::claim_column(status.write_ts, &self.opts.rid));
        }
        self.mediator.unlock(kc, tx);
        self.metrics.lock_released();
        debug!(key = %kc, %tx, "locker.released");
    }

    fn try_delete_claim(&self, row: &Bytes, column: Bytes) {
        if let Err(err) = self.store.mutate(row, &[], &[column]) {
            warn!(error = %err, "locker.claim.delete_failed");
        }
    }

    /// Whether `tx` currently has a claim recorded on `kc`.
    pub fn holds(&self, kc: &KeyColumn, tx: TxId) -> bool {
        self.state.get(tx, kc).is_some()
    }

    /// Timestamp of the claim `tx` wrote on `kc`, if any.
    pub fn claim_timestamp(&self, kc: &KeyColumn, tx: TxId) -> Option<Timestamp> {
        self.state.get(tx, kc).map(|s| s.write_ts)
    }

    /// Expected-value fingerprint carried by the claim `tx` wrote on `kc`.
    /// `None` when no claim is recorded, `Some(None)` for a plain claim.
    pub fn claim_fingerprint(&self, kc: &KeyColumn, tx: TxId) -> Option<Option<u64>> {
        self.state.get(tx, kc).map(|s| s.fingerprint)
    }
}

pub(crate) fn describe_fingerprint(fingerprint: Option<u64>) -> String {
    match fingerprint {
        Some(fp) => format!("xxh64:{fp:016x}"),
        None => "<absent>".to_owned(),
    }
}
