use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh64::xxh64;

use crate::ids::partition::PartitionIdRange;
use crate::types::{ClaimError, PartitionId, Result};

/// Value of a partitioning property.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PartitionValue {
    Int(i64),
    Str(String),
    Bytes(Bytes),
}

impl PartitionValue {
    /// Hash that is identical across processes and platforms.
    pub fn stable_hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(16);
        match self {
            PartitionValue::Int(v) => {
                buf.push(0);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            PartitionValue::Str(s) => {
                buf.push(1);
                buf.extend_from_slice(s.as_bytes());
            }
            PartitionValue::Bytes(b) => {
                buf.push(2);
                buf.extend_from_slice(b);
            }
        }
        xxh64(&buf, 0)
    }

    /// Home partition of this value in `[0, bound)`.
    pub fn partition(&self, bound: PartitionId) -> PartitionId {
        let hash = self.stable_hash() as i64;
        (hash.unsigned_abs() % u64::from(bound.max(1))) as PartitionId
    }
}

impl fmt::Display for PartitionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionValue::Int(v) => write!(f, "{v}"),
            PartitionValue::Str(s) => f.write_str(s),
            PartitionValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

impl From<i64> for PartitionValue {
    fn from(v: i64) -> Self {
        PartitionValue::Int(v)
    }
}

impl From<&str> for PartitionValue {
    fn from(v: &str) -> Self {
        PartitionValue::Str(v.to_owned())
    }
}

impl From<String> for PartitionValue {
    fn from(v: String) -> Self {
        PartitionValue::Str(v)
    }
}

impl From<Bytes> for PartitionValue {
    fn from(v: Bytes) -> Self {
        PartitionValue::Bytes(v)
    }
}

/// Something about to be created that needs a partition.
pub trait PlacementElement {
    /// Value of property `key`, if the element carries it.
    fn partition_value(&self, key: &str) -> Option<PartitionValue>;
}

/// Plain property bag usable as a [`PlacementElement`].
#[derive(Clone, Debug, Default)]
pub struct PropertyMap {
    props: BTreeMap<String, PartitionValue>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PartitionValue>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PartitionValue>) {
        self.props.insert(key.into(), value.into());
    }
}

impl PlacementElement for PropertyMap {
    fn partition_value(&self, key: &str) -> Option<PartitionValue> {
        self.props.get(key).cloned()
    }
}

/// Chooses partitions for new elements before their ids are allocated.
pub trait IdPlacementStrategy: Send + Sync {
    /// Partition for a single element.
    fn get_partition(&self, element: &dyn PlacementElement) -> Result<PartitionId>;

    /// One partition per element, in input order.
    fn get_partitions(&self, elements: &[&dyn PlacementElement]) -> Result<Vec<PartitionId>>;

    /// Restricts placement to partitions local to this instance.
    fn set_local_partition_bounds(&self, ranges: Vec<PartitionIdRange>) -> Result<()>;

    /// Called once the id authority reports `partition` exhausted; it is
    /// never chosen again.
    fn exhausted_partition(&self, partition: PartitionId);
}

struct BulkState {
    ranges: Vec<PartitionIdRange>,
    slots: Vec<Option<PartitionId>>,
    exhausted: FxHashSet<PartitionId>,
    rng: StdRng,
    placements: u64,
}

impl BulkState {
    /// Picks a random non-exhausted partition, probing linearly from a
    /// random start through every local range once.
    fn fresh_partition(&mut self) -> Result<PartitionId> {
        if self.ranges.is_empty() {
            return Err(ClaimError::Config("no local partition ranges".into()));
        }
        let first = self.rng.gen_range(0..self.ranges.len());
        for step in 0..self.ranges.len() {
            let range = self.ranges[(first + step) % self.ranges.len()];
            let start = u64::from(range.random_id(&mut self.rng) - range.lower());
            for offset in 0..u64::from(range.len()) {
                let candidate = range.nth(start + offset);
                if !self.exhausted.contains(&candidate) {
                    return Ok(candidate);
                }
            }
        }
        Err(ClaimError::PoolExhausted(
            "every local partition is exhausted".into(),
        ))
    }

    fn reassign(&mut self, slot: usize) -> Result<PartitionId> {
        match self.fresh_partition() {
            Ok(partition) => {
                self.slots[slot] = Some(partition);
                Ok(partition)
            }
            Err(err) => {
                self.slots[slot] = None;
                Err(err)
            }
        }
    }

    fn rerandomize(&mut self) {
        for slot in 0..self.slots.len() {
            if let Err(err) = self.reassign(slot) {
                warn!(slot, error = %err, "placement.window.rerandomize_failed");
            }
        }
    }
}

/// Round-robin placement over a window of active partitions; a batch of
/// elements shares one partition.
pub struct SimpleBulkPlacementStrategy {
    bound: PartitionId,
    rotation_interval: u64,
    state: Mutex<BulkState>,
}

impl SimpleBulkPlacementStrategy {
    pub fn new(concurrent_partitions: usize, partition_bound: PartitionId) -> Result<Self> {
        Self::with_rng(
            concurrent_partitions,
            partition_bound,
            StdRng::from_entropy(),
        )
    }

    /// Same as [`Self::new`] with a deterministic random source.
    pub fn with_seed(
        concurrent_partitions: usize,
        partition_bound: PartitionId,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(
            concurrent_partitions,
            partition_bound,
            StdRng::seed_from_u64(seed),
        )
    }

    fn with_rng(concurrent: usize, bound: PartitionId, rng: StdRng) -> Result<Self> {
        if concurrent == 0 {
            return Err(ClaimError::Config(
                "concurrent partitions must be at least 1".into(),
            ));
        }
        if concurrent as u64 > u64::from(bound) {
            return Err(ClaimError::Config(format!(
                "concurrent partitions ({concurrent}) exceed partition bound ({bound})"
            )));
        }
        let mut state = BulkState {
            ranges: vec![PartitionIdRange::global(bound)?],
            slots: vec![None; concurrent],
            exhausted: FxHashSet::default(),
            rng,
            placements: 0,
        };
        state.rerandomize();
        Ok(Self {
            bound,
            rotation_interval: 0,
            state: Mutex::new(state),
        })
    }

    /// Re-randomizes the whole window every `interval` placements; 0 disables.
    pub fn rotation_interval(mut self, interval: u64) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Partitions currently in the window.
    pub fn active_partitions(&self) -> Vec<PartitionId> {
        self.state.lock().slots.iter().flatten().copied().collect()
    }

    fn next_partition(&self) -> Result<PartitionId> {
        let mut state = self.state.lock();
        state.placements += 1;
        if self.rotation_interval > 0 && state.placements % self.rotation_interval == 0 {
            trace!("placement.window.rotated");
            state.rerandomize();
        }
        let live: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|_| i))
            .collect();
        if live.is_empty() {
            // every slot failed to refill earlier; try once more
            return state.reassign(0);
        }
        let slot = live[state.rng.gen_range(0..live.len())];
        match state.slots[slot] {
            Some(partition) => Ok(partition),
            None => state.reassign(slot),
        }
    }
}

impl IdPlacementStrategy for SimpleBulkPlacementStrategy {
    fn get_partition(&self, _element: &dyn PlacementElement) -> Result<PartitionId> {
        self.next_partition()
    }

    fn get_partitions(&self, elements: &[&dyn PlacementElement]) -> Result<Vec<PartitionId>> {
        if elements.is_empty() {
            return Ok(Vec::new());
        }
        let partition = self.next_partition()?;
        Ok(vec![partition; elements.len()])
    }

    fn set_local_partition_bounds(&self, ranges: Vec<PartitionIdRange>) -> Result<()> {
        if ranges.is_empty() {
            return Err(ClaimError::Config("local partition ranges are empty".into()));
        }
        if let Some(bad) = ranges.iter().find(|r| r.bound() != self.bound) {
            return Err(ClaimError::Config(format!(
                "range {bad} does not match partition bound {}",
                self.bound
            )));
        }
        let mut state = self.state.lock();
        state.ranges = ranges;
        state.rerandomize();
        debug!(ranges = state.ranges.len(), "placement.local_bounds.set");
        Ok(())
    }

    fn exhausted_partition(&self, partition: PartitionId) {
        let mut state = self.state.lock();
        if !state.exhausted.insert(partition) {
            return;
        }
        debug!(partition, "placement.partition.exhausted");
        for slot in 0..state.slots.len() {
            if state.slots[slot] == Some(partition) {
                if let Err(err) = state.reassign(slot) {
                    warn!(slot, partition, error = %err, "placement.slot.unfillable");
                }
            }
        }
    }
}

/// Places elements by the hash of a designated property so equal values
/// land together; elements without it go to `fallback`.
pub struct PropertyPlacementStrategy {
    key: String,
    bound: PartitionId,
    fallback: Arc<dyn IdPlacementStrategy>,
    exhausted: Mutex<FxHashSet<PartitionId>>,
}

impl PropertyPlacementStrategy {
    pub fn new(
        key: impl Into<String>,
        bound: PartitionId,
        fallback: Arc<dyn IdPlacementStrategy>,
    ) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(ClaimError::Config("partition key must not be empty".into()));
        }
        if bound == 0 {
            return Err(ClaimError::Config("partition bound must be positive".into()));
        }
        Ok(Self {
            key,
            bound,
            fallback,
            exhausted: Mutex::new(FxHashSet::default()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn place_value(&self, value: &PartitionValue) -> Result<PartitionId> {
        let home = value.partition(self.bound);
        let exhausted = self.exhausted.lock();
        for offset in 0..self.bound {
            let candidate = ((u64::from(home) + u64::from(offset)) % u64::from(self.bound))
                as PartitionId;
            if !exhausted.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ClaimError::PoolExhausted(format!(
            "no partition left for {}={value}",
            self.key
        )))
    }
}

impl IdPlacementStrategy for PropertyPlacementStrategy {
    fn get_partition(&self, element: &dyn PlacementElement) -> Result<PartitionId> {
        match element.partition_value(&self.key) {
            Some(value) => self.place_value(&value),
            None => self.fallback.get_partition(element),
        }
    }

    fn get_partitions(&self, elements: &[&dyn PlacementElement]) -> Result<Vec<PartitionId>> {
        let mut out = vec![0; elements.len()];
        let mut rest = Vec::new();
        let mut rest_idx = Vec::new();
        for (i, element) in elements.iter().enumerate() {
            match element.partition_value(&self.key) {
                Some(value) => out[i] = self.place_value(&value)?,
                None => {
                    rest.push(*element);
                    rest_idx.push(i);
                }
            }
        }
        if !rest.is_empty() {
            let placed = self.fallback.get_partitions(&rest)?;
            for (i, partition) in rest_idx.into_iter().zip(placed) {
                out[i] = partition;
            }
        }
        Ok(out)
    }

    fn set_local_partition_bounds(&self, ranges: Vec<PartitionIdRange>) -> Result<()> {
        self.fallback.set_local_partition_bounds(ranges)
    }

    fn exhausted_partition(&self, partition: PartitionId) {
        self.exhausted.lock().insert(partition);
        self.fallback.exhausted_partition(partition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_window_larger_than_bound() {
        assert!(SimpleBulkPlacementStrategy::new(0, 8).is_err());
        assert!(SimpleBulkPlacementStrategy::new(9, 8).is_err());
        assert!(SimpleBulkPlacementStrategy::new(8, 8).is_ok());
    }

    #[test]
    fn batch_shares_one_partition() {
        let strategy = SimpleBulkPlacementStrategy::with_seed(4, 64, 1).unwrap();
        let a = PropertyMap::new();
        let b = PropertyMap::new();
        let c = PropertyMap::new();
        let placed = strategy.get_partitions(&[&a, &b, &c]).unwrap();
        assert_eq!(placed.len(), 3);
        assert!(placed.iter().all(|p| *p == placed[0] && *p < 64));
    }

    #[test]
    fn exhausted_partition_leaves_window() {
        let strategy = SimpleBulkPlacementStrategy::with_seed(3, 8, 42).unwrap();
        let victim = strategy.active_partitions()[0];
        strategy.exhausted_partition(victim);
        assert!(!strategy.active_partitions().contains(&victim));
        for _ in 0..50 {
            assert_ne!(strategy.get_partition(&PropertyMap::new()).unwrap(), victim);
        }
    }

    #[test]
    fn last_free_partition_is_found_then_reported() {
        let strategy = SimpleBulkPlacementStrategy::with_seed(2, 4, 3).unwrap();
        for p in 0..3 {
            strategy.exhausted_partition(p);
        }
        assert_eq!(strategy.get_partition(&PropertyMap::new()).unwrap(), 3);
        strategy.exhausted_partition(3);
        let err = strategy.get_partition(&PropertyMap::new()).unwrap_err();
        assert!(err.is_exhausted());
    }

    #[test]
    fn local_bounds_restrict_choices() {
        let strategy = SimpleBulkPlacementStrategy::with_seed(2, 16, 9).unwrap();
        let range = PartitionIdRange::new(4, 6, 16).unwrap();
        strategy.set_local_partition_bounds(vec![range]).unwrap();
        for _ in 0..20 {
            assert!(range.contains(strategy.get_partition(&PropertyMap::new()).unwrap()));
        }
        let foreign = PartitionIdRange::new(0, 2, 8).unwrap();
        assert!(strategy.set_local_partition_bounds(vec![foreign]).is_err());
        assert!(strategy.set_local_partition_bounds(Vec::new()).is_err());
    }

    #[test]
    fn rotation_keeps_window_valid() {
        let strategy = SimpleBulkPlacementStrategy::with_seed(2, 8, 5)
            .unwrap()
            .rotation_interval(3);
        strategy.exhausted_partition(1);
        for _ in 0..30 {
            assert_ne!(strategy.get_partition(&PropertyMap::new()).unwrap(), 1);
        }
    }

    #[test]
    fn property_value_picks_stable_home() {
        let fallback = Arc::new(SimpleBulkPlacementStrategy::with_seed(2, 16, 0).unwrap());
        let strategy = PropertyPlacementStrategy::new("tenant", 16, fallback).unwrap();
        let element = PropertyMap::new().with("tenant", "acme");
        let home = PartitionValue::from("acme").partition(16);
        assert_eq!(strategy.get_partition(&element).unwrap(), home);
        assert_eq!(strategy.get_partition(&element).unwrap(), home);
    }

    #[test]
    fn negative_hashes_stay_in_range() {
        for v in -500i64..500 {
            assert!(PartitionValue::Int(v).partition(7) < 7);
        }
    }

    #[test]
    fn property_probe_skips_exhausted_and_terminates() {
        let fallback = Arc::new(SimpleBulkPlacementStrategy::with_seed(1, 4, 0).unwrap());
        let strategy = PropertyPlacementStrategy::new("k", 4, fallback).unwrap();
        let element = PropertyMap::new().with("k", 11i64);
        let home = PartitionValue::Int(11).partition(4);
        strategy.exhausted_partition(home);
        assert_eq!(strategy.get_partition(&element).unwrap(), (home + 1) % 4);
        for p in 0..4 {
            strategy.exhausted_partition(p);
        }
        assert!(strategy.get_partition(&element).unwrap_err().is_exhausted());
    }

    #[test]
    fn elements_without_key_use_fallback() {
        let fallback = Arc::new(SimpleBulkPlacementStrategy::with_seed(1, 8, 0).unwrap());
        let window = fallback.active_partitions()[0];
        let strategy = PropertyPlacementStrategy::new("k", 8, fallback).unwrap();
        let keyed = PropertyMap::new().with("k", "x");
        let plain = PropertyMap::new();
        let placed = strategy.get_partitions(&[&plain, &keyed, &plain]).unwrap();
        assert_eq!(placed[0], window);
        assert_eq!(placed[2], window);
        assert_eq!(placed[1], PartitionValue::from("x").partition(8));
    }
}
