//! In-memory KCV backend with fault injection.
//!
//! Rows are ordered maps behind a `parking_lot::RwLock`, which makes the
//! backend key-consistent. Failures scheduled on the shared [`FaultPlan`]
//! are raised before the store is touched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::storage::kcv::{
    Entry, KeyColumnValueStore, KeyRange, KeySliceQuery, StoreFeatures, StoreManager,
};
use crate::types::{ClaimError, Result};

/// Severity of an injected failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Temporary,
    Permanent,
}

/// Which store calls an injected failure applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultTarget {
    Reads,
    Writes,
    All,
}

/// Store call kinds reported to the [`FaultPlan`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    Write,
}

impl FaultTarget {
    fn matches(self, op: StoreOp) -> bool {
        matches!(
            (self, op),
            (FaultTarget::All, _)
                | (FaultTarget::Reads, StoreOp::Read)
                | (FaultTarget::Writes, StoreOp::Write)
        )
    }
}

#[derive(Debug)]
struct ScheduledFault {
    store: Option<String>,
    target: FaultTarget,
    kind: FaultKind,
    remaining: usize,
}

/// Failures to inject into upcoming store calls, shared by every store of a
/// manager.
#[derive(Debug, Default)]
pub struct FaultPlan {
    scheduled: Mutex<Vec<ScheduledFault>>,
}

impl FaultPlan {
    /// Fails the next `calls` matching calls on any store.
    pub fn fail_next(&self, target: FaultTarget, kind: FaultKind, calls: usize) {
        self.push(None, target, kind, calls);
    }

    /// Fails the next `calls` matching calls on the store called `store`.
    pub fn fail_next_on(&self, store: &str, target: FaultTarget, kind: FaultKind, calls: usize) {
        self.push(Some(store.to_owned()), target, kind, calls);
    }

    /// Drops every scheduled failure.
    pub fn clear(&self) {
        self.scheduled.lock().clear();
    }

    fn push(&self, store: Option<String>, target: FaultTarget, kind: FaultKind, calls: usize) {
        if calls == 0 {
            return;
        }
        self.scheduled.lock().push(ScheduledFault {
            store,
            target,
            kind,
            remaining: calls,
        });
    }

    /// Consumes one matching scheduled failure, if any, and returns it as an error.
    pub fn check(&self, store: &str, op: StoreOp) -> Result<()> {
        let mut scheduled = self.scheduled.lock();
        let Some(pos) = scheduled.iter().position(|fault| {
            fault.target.matches(op) && fault.store.as_deref().map_or(true, |s| s == store)
        }) else {
            return Ok(());
        };
        let fault = &mut scheduled[pos];
        let kind = fault.kind;
        fault.remaining -= 1;
        if fault.remaining == 0 {
            scheduled.remove(pos);
        }
        let msg = format!("injected {op:?} failure on store {store}");
        Err(match kind {
            FaultKind::Temporary => ClaimError::TemporaryBackend(msg),
            FaultKind::Permanent => ClaimError::PermanentBackend(msg),
        })
    }
}

type Row = BTreeMap<Bytes, Bytes>;

/// One named store of an [`InMemoryStoreManager`].
pub struct InMemoryStore {
    name: String,
    rows: RwLock<BTreeMap<Bytes, Row>>,
    faults: Arc<FaultPlan>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryStore {
    /// Creates a standalone store with its own fault plan.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_faults(name, Arc::new(FaultPlan::default()))
    }

    fn with_faults(name: impl Into<String>, faults: Arc<FaultPlan>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            faults,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `get_slice` calls served, including failed ones.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `mutate` calls served, including failed ones.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of columns currently stored under `key`.
    pub fn row_len(&self, key: &[u8]) -> usize {
        self.rows.read().get(key).map_or(0, BTreeMap::len)
    }

    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }
}

impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_slice(&self, query: &KeySliceQuery) -> Result<Vec<Entry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.faults.check(&self.name, StoreOp::Read)?;
        let rows = self.rows.read();
        let Some(row) = rows.get(&query.key) else {
            return Ok(Vec::new());
        };
        let limit = query.slice.limit.unwrap_or(usize::MAX);
        let entries = row
            .range(query.slice.start.clone()..)
            .take_while(|(column, _)| query.slice.contains(column))
            .take(limit)
            .map(|(column, value)| Entry::new(column.clone(), value.clone()))
            .collect();
        Ok(entries)
    }

    fn mutate(&self, key: &[u8], additions: &[Entry], deletions: &[Bytes]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.faults.check(&self.name, StoreOp::Write)?;
        let mut rows = self.rows.write();
        let row = rows.entry(Bytes::copy_from_slice(key)).or_default();
        for column in deletions {
            row.remove(column);
        }
        for entry in additions {
            row.insert(entry.column.clone(), entry.value.clone());
        }
        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }
}

/// Process-local backend: every store lives in memory and is shared by all
/// handles opened through the same manager.
pub struct InMemoryStoreManager {
    stores: Mutex<FxHashMap<String, Arc<InMemoryStore>>>,
    features: StoreFeatures,
    local_ranges: Vec<KeyRange>,
    faults: Arc<FaultPlan>,
}

impl InMemoryStoreManager {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(FxHashMap::default()),
            features: StoreFeatures::default(),
            local_ranges: Vec::new(),
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// Overrides the advertised capabilities.
    pub fn with_features(mut self, features: StoreFeatures) -> Self {
        self.features = features;
        self
    }

    /// Advertises `ranges` as locally held and turns on
    /// [`StoreFeatures::local_key_partition`].
    pub fn with_local_key_ranges(mut self, ranges: Vec<KeyRange>) -> Self {
        self.features.local_key_partition = true;
        self.local_ranges = ranges;
        self
    }

    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }

    /// Typed handle to an opened store, for inspection in tests and tools.
    pub fn store(&self, name: &str) -> Arc<InMemoryStore> {
        let mut stores = self.stores.lock();
        stores
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(InMemoryStore::with_faults(name, self.faults.clone())))
            .clone()
    }
}

impl Default for InMemoryStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreManager for InMemoryStoreManager {
    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        if name.is_empty() {
            return Err(ClaimError::Invalid("store name must not be empty"));
        }
        Ok(self.store(name))
    }

    fn features(&self) -> StoreFeatures {
        self.features
    }

    fn local_key_partition(&self) -> Result<Vec<KeyRange>> {
        if !self.features.local_key_partition {
            return Err(ClaimError::Invalid(
                "store manager does not expose local key partitions",
            ));
        }
        Ok(self.local_ranges.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kcv::SliceQuery;

    fn store() -> InMemoryStore {
        InMemoryStore::new("test")
    }

    #[test]
    fn slice_reads_columns_in_order_within_bounds() {
        let s = store();
        s.mutate(
            b"row",
            &[Entry::new("c", "3"), Entry::new("a", "1"), Entry::new("b", "2")],
            &[],
        )
        .unwrap();
        let all = s
            .get_slice(&KeySliceQuery::new("row", SliceQuery::all()))
            .unwrap();
        let cols: Vec<_> = all.iter().map(|e| e.column.clone()).collect();
        assert_eq!(cols, vec!["a", "b", "c"]);

        let single = s
            .get_slice(&KeySliceQuery::new("row", SliceQuery::single(b"b")))
            .unwrap();
        assert_eq!(single, vec![Entry::new("b", "2")]);
    }

    #[test]
    fn deletions_apply_before_additions() {
        let s = store();
        s.mutate(b"row", &[Entry::new("a", "old")], &[]).unwrap();
        s.mutate(
            b"row",
            &[Entry::new("a", "new")],
            &[Bytes::from_static(b"a")],
        )
        .unwrap();
        let got = s
            .get_slice(&KeySliceQuery::new("row", SliceQuery::single(b"a")))
            .unwrap();
        assert_eq!(got[0].value, Bytes::from_static(b"new"));
    }

    #[test]
    fn emptied_rows_are_dropped() {
        let s = store();
        s.mutate(b"row", &[Entry::new("a", "1")], &[]).unwrap();
        s.mutate(b"row", &[], &[Bytes::from_static(b"a")]).unwrap();
        assert_eq!(s.row_len(b"row"), 0);
    }

    #[test]
    fn scheduled_faults_fire_then_clear() {
        let s = store();
        s.faults().fail_next(FaultTarget::Writes, FaultKind::Temporary, 2);
        for _ in 0..2 {
            let err = s.mutate(b"k", &[Entry::new("c", "v")], &[]).unwrap_err();
            assert!(err.is_temporary());
        }
        s.mutate(b"k", &[Entry::new("c", "v")], &[]).unwrap();
        // reads were never targeted
        assert!(s.get_slice(&KeySliceQuery::new("k", SliceQuery::all())).is_ok());
        assert_eq!(s.writes(), 3);
    }

    #[test]
    fn faults_can_target_one_store() {
        let manager = InMemoryStoreManager::new();
        manager
            .faults()
            .fail_next_on("ids", FaultTarget::All, FaultKind::Permanent, 1);
        let other = manager.open_store("edges").unwrap();
        other.mutate(b"k", &[Entry::new("c", "v")], &[]).unwrap();
        let ids = manager.open_store("ids").unwrap();
        let err = ids
            .get_slice(&KeySliceQuery::new("k", SliceQuery::all()))
            .unwrap_err();
        assert!(matches!(err, ClaimError::PermanentBackend(_)));
    }

    #[test]
    fn stores_are_shared_by_name() {
        let manager = InMemoryStoreManager::new();
        let a = manager.open_store("s").unwrap();
        let b = manager.open_store("s").unwrap();
        a.mutate(b"k", &[Entry::new("c", "v")], &[]).unwrap();
        assert_eq!(
            b.get_slice(&KeySliceQuery::new("k", SliceQuery::all()))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn local_partition_requires_feature() {
        let manager = InMemoryStoreManager::new();
        assert!(manager.local_key_partition().is_err());
        let manager = manager.with_local_key_ranges(vec![KeyRange::new(vec![0; 4], vec![0; 4])]);
        assert_eq!(manager.local_key_partition().unwrap().len(), 1);
    }
}
