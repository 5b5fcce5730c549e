#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use keyclaim::{
    ids::{
        ConsistentKeyIdAuthority, FixedBlockSizer, IdAssigner, IdAuthority, IdAuthorityOptions,
        IdBlock, IdPoolOptions, PlacementElement, PropertyMap, SimpleBulkPlacementStrategy,
        StandardIdPool,
    },
    locking::{LockerOptions, MediatorRegistry},
    metrics::CounterMetrics,
    primitives::time::{
        ManualTimestamps, SystemTimestamps, Timestamp, TimestampProvider, TimestampResolution,
    },
    storage::{FaultKind, FaultTarget, InMemoryStoreManager, StoreManager},
    types::{ClaimError, Rid},
};

const TIMEOUT: Duration = Duration::from_secs(30);

fn authority(
    manager: Arc<dyn StoreManager>,
    times: Arc<dyn TimestampProvider>,
    rid: &str,
    wait: Duration,
    block: u64,
    limit: u64,
) -> ConsistentKeyIdAuthority {
    let registry = MediatorRegistry::new(times.clone());
    let locker_opts = LockerOptions::new(Rid::new(rid.to_owned()).unwrap())
        .lock_wait(wait)
        .lock_expire(Duration::from_secs(30));
    ConsistentKeyIdAuthority::open(
        manager,
        times,
        &registry,
        locker_opts,
        Arc::new(FixedBlockSizer::new(block, limit).unwrap()),
        IdAuthorityOptions::new().wait(Duration::from_millis(2)),
    )
    .unwrap()
}

fn manual() -> Arc<ManualTimestamps> {
    Arc::new(ManualTimestamps::new(Timestamp::from_nanos(1_000_000_000)))
}

#[test]
fn sequential_blocks_then_exhaustion() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let auth = authority(manager, manual(), "solo", Duration::ZERO, 100, 250);
    let blocks: Vec<IdBlock> = (0..3)
        .map(|_| auth.get_id_block(0, 0, TIMEOUT).unwrap())
        .collect();
    assert_eq!(
        blocks,
        vec![IdBlock::new(0, 100), IdBlock::new(100, 100), IdBlock::new(200, 50)]
    );
    for _ in 0..3 {
        let err = auth.get_id_block(0, 0, TIMEOUT).unwrap_err();
        assert!(err.is_exhausted(), "{err}");
    }
    // other scopes are unaffected
    assert_eq!(auth.get_id_block(1, 0, TIMEOUT).unwrap(), IdBlock::new(0, 100));
    assert_eq!(auth.get_id_block(0, 1, TIMEOUT).unwrap(), IdBlock::new(0, 100));
}

#[test]
fn exhaustion_is_seen_by_every_instance() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let clock = manual();
    let a = authority(manager.clone(), clock.clone(), "a", Duration::ZERO, 10, 20);
    let b = authority(manager, clock, "b", Duration::ZERO, 10, 20);
    a.get_id_block(3, 0, TIMEOUT).unwrap();
    b.get_id_block(3, 0, TIMEOUT).unwrap();
    assert!(a.get_id_block(3, 0, TIMEOUT).unwrap_err().is_exhausted());
    assert!(b.get_id_block(3, 0, TIMEOUT).unwrap_err().is_exhausted());
}

#[test]
fn concurrent_instances_receive_disjoint_blocks() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let times: Arc<dyn TimestampProvider> =
        Arc::new(SystemTimestamps::new(TimestampResolution::Micro));

    const INSTANCES: usize = 4;
    const BLOCKS: usize = 6;
    let barrier = Arc::new(Barrier::new(INSTANCES));
    let handles: Vec<_> = (0..INSTANCES)
        .map(|i| {
            let auth = authority(
                manager.clone(),
                times.clone(),
                &format!("node-{i}"),
                Duration::from_millis(2),
                25,
                u64::MAX,
            );
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..BLOCKS)
                    .map(|_| auth.get_id_block(0, 0, TIMEOUT))
                    .collect::<Result<Vec<_>, ClaimError>>()
            })
        })
        .collect();

    let mut blocks: Vec<IdBlock> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap().unwrap())
        .collect();
    blocks.sort_by_key(IdBlock::start);
    assert_eq!(blocks.len(), INSTANCES * BLOCKS);
    for pair in blocks.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "{} overlaps {}", pair[0], pair[1]);
        assert_eq!(pair[0].end(), pair[1].start());
    }
}

#[test]
fn transient_store_failures_are_absorbed() {
    let memory = Arc::new(InMemoryStoreManager::new());
    let manager: Arc<dyn StoreManager> = memory.clone();
    let auth = authority(manager, manual(), "flaky", Duration::ZERO, 10, 1_000);
    memory
        .faults()
        .fail_next(FaultTarget::All, FaultKind::Temporary, 2);
    assert_eq!(auth.get_id_block(0, 0, TIMEOUT).unwrap(), IdBlock::new(0, 10));
    assert_eq!(auth.get_id_block(0, 0, TIMEOUT).unwrap(), IdBlock::new(10, 10));
}

#[test]
fn pool_hands_out_every_id_once() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let auth = Arc::new(authority(manager, manual(), "pool", Duration::ZERO, 40, 130));
    let pool = StandardIdPool::new(auth, 0, 0, IdPoolOptions::new()).unwrap();
    let ids: Vec<u64> = (0..130).map(|_| pool.next_id().unwrap()).collect();
    assert_eq!(ids, (0..130).collect::<Vec<_>>());
    assert!(pool.next_id().unwrap_err().is_exhausted());
}

#[test]
fn assigner_spreads_over_partitions_until_all_are_exhausted() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let metrics = Arc::new(CounterMetrics::default());
    let clock = manual();
    let registry = MediatorRegistry::new(clock.clone());
    let auth = Arc::new(
        ConsistentKeyIdAuthority::open(
            manager,
            clock.clone(),
            &registry,
            LockerOptions::new(Rid::new("assigner").unwrap()).lock_wait(Duration::ZERO),
            Arc::new(FixedBlockSizer::new(10, 30).unwrap()),
            IdAuthorityOptions::new().metrics(metrics.clone()),
        )
        .unwrap(),
    );
    let placement = Arc::new(SimpleBulkPlacementStrategy::with_seed(2, 4, 17).unwrap());
    let assigner = IdAssigner::new(auth, placement, 4, IdPoolOptions::new()).unwrap();

    let element = PropertyMap::new();
    let mut seen = HashSet::new();
    for _ in 0..120 {
        let id = assigner.assign_id(&element, 0).unwrap();
        assert!(id.partition < 4 && id.count < 30);
        assert!(seen.insert(id.element_id().unwrap()));
    }
    let err = assigner.assign_id(&element, 0).unwrap_err();
    assert!(matches!(err, ClaimError::AllocationFailed(_)), "{err}");
    assert_eq!(metrics.snapshot().partitions_exhausted, 4);
    assert_eq!(metrics.snapshot().ids_allocated, 120);
    assigner.close();
}

#[test]
fn batch_assignment_moves_leftovers_to_fresh_partitions() {
    let manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let auth = Arc::new(authority(manager, manual(), "bulk", Duration::ZERO, 5, 5));
    let placement = Arc::new(SimpleBulkPlacementStrategy::with_seed(1, 8, 3).unwrap());
    let assigner = IdAssigner::new(auth, placement, 8, IdPoolOptions::new()).unwrap();

    let elements: Vec<PropertyMap> = (0..12).map(|_| PropertyMap::new()).collect();
    let refs: Vec<&dyn PlacementElement> =
        elements.iter().map(|e| e as &dyn PlacementElement).collect();
    let ids = assigner.assign_ids(&refs, 0).unwrap();
    assert_eq!(ids.len(), 12);
    let partitions: HashSet<u32> = ids.iter().map(|id| id.partition).collect();
    assert!(partitions.len() >= 3);
    let unique: HashSet<u64> = ids.iter().filter_map(|id| id.element_id()).collect();
    assert_eq!(unique.len(), 12);
}
