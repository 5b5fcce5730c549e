use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::locking::serializer;
use crate::primitives::time::Timestamp;
use crate::storage::{KeyColumnValueStore, KeySliceQuery, SliceQuery};
use crate::types::{KeyColumn, Result};

/// Deletes claims older than an expiry cutoff from lock rows.
///
/// Only expired claims are removed, and expired claims are ignored by every
/// verifier, so cleaning never changes who holds a lock. A row is not
/// re-cleaned for a cutoff at or before one it was already cleaned for.
/// Rows cleaned for a cutoff older than the latest one are forgotten, so the
/// table only holds rows cleaned at the most recent cutoffs.
pub struct ExpiredClaimCleaner {
    store: Arc<dyn KeyColumnValueStore>,
    cleaned: Mutex<FxHashMap<KeyColumn, Timestamp>>,
}

impl ExpiredClaimCleaner {
    pub fn new(store: Arc<dyn KeyColumnValueStore>) -> Self {
        Self {
            store,
            cleaned: Mutex::new(FxHashMap::default()),
        }
    }

    /// Removes every claim on `kc` written before `cutoff`. Failures are
    /// logged and left for a later pass.
    pub fn clean(&self, kc: &KeyColumn, cutoff: Timestamp) {
        {
            let mut cleaned = self.cleaned.lock();
            cleaned.retain(|_, prev| *prev >= cutoff);
            match cleaned.get(kc) {
                Some(prev) if *prev >= cutoff => return,
                _ => {
                    cleaned.insert(kc.clone(), cutoff);
                }
            }
        }
        match self.delete_expired(kc, cutoff) {
            Ok(0) => {}
            Ok(deleted) => debug!(key = %kc, deleted, "locker.cleaner.deleted"),
            Err(err) => {
                self.cleaned.lock().remove(kc);
                warn!(key = %kc, error = %err, "locker.cleaner.error");
            }
        }
    }

    fn delete_expired(&self, kc: &KeyColumn, cutoff: Timestamp) -> Result<usize> {
        let row = serializer::lock_row_key(kc);
        // columns sort by timestamp, so everything below the cutoff's prefix is expired
        let mut end = Vec::with_capacity(8);
        crate::primitives::bytes::ord::put_u64_be(&mut end, cutoff.as_nanos());
        let slice = SliceQuery {
            start: Bytes::new(),
            end: Some(Bytes::from(end)),
            limit: None,
        };
        let expired: Vec<Bytes> = self
            .store
            .get_slice(&KeySliceQuery::new(row.clone(), slice))?
            .into_iter()
            .map(|entry| entry.column)
            .collect();
        if !expired.is_empty() {
            self.store.mutate(&row, &[], &expired)?;
        }
        Ok(expired.len())
    }
}
