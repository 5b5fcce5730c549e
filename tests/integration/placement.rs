#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::Arc;

use keyclaim::{
    ids::{
        IdPlacementStrategy, PartitionIdRange, PartitionValue, PlacementElement, PropertyMap,
        PropertyPlacementStrategy, SimpleBulkPlacementStrategy,
    },
    storage::KeyRange,
};

fn plain() -> PropertyMap {
    PropertyMap::new()
}

#[test]
fn exhausted_partition_never_reappears() {
    let strategy = SimpleBulkPlacementStrategy::with_seed(4, 32, 99).unwrap();
    let mut gone = HashSet::new();
    for _ in 0..20 {
        let partition = strategy.get_partition(&plain()).unwrap();
        assert!(!gone.contains(&partition));
        strategy.exhausted_partition(partition);
        gone.insert(partition);
        assert!(strategy
            .active_partitions()
            .iter()
            .all(|p| !gone.contains(p)));
    }
}

#[test]
fn single_survivor_is_found_without_looping() {
    let strategy = SimpleBulkPlacementStrategy::with_seed(3, 5, 1).unwrap();
    for p in [0, 1, 3, 4] {
        strategy.exhausted_partition(p);
    }
    for _ in 0..100 {
        assert_eq!(strategy.get_partition(&plain()).unwrap(), 2);
    }
    assert!(strategy.active_partitions().iter().all(|p| *p == 2));

    strategy.exhausted_partition(2);
    assert!(strategy.get_partition(&plain()).unwrap_err().is_exhausted());
    assert!(strategy.active_partitions().is_empty());
}

#[test]
fn local_key_ranges_bound_placement() {
    let strategy = SimpleBulkPlacementStrategy::with_seed(2, 16, 4).unwrap();
    // keys [4 << 28, 8 << 28) hold partitions 4..8 when the bound is 16
    let keys = [KeyRange::new(
        (4u32 << 28).to_be_bytes().to_vec(),
        (8u32 << 28).to_be_bytes().to_vec(),
    )];
    let ranges = PartitionIdRange::from_key_ranges(&keys, 16).unwrap();
    strategy.set_local_partition_bounds(ranges).unwrap();
    for p in 4..7 {
        strategy.exhausted_partition(p);
    }
    for _ in 0..20 {
        assert_eq!(strategy.get_partition(&plain()).unwrap(), 7);
    }
    strategy.exhausted_partition(7);
    assert!(strategy.get_partition(&plain()).unwrap_err().is_exhausted());
}

#[test]
fn wrapping_local_ranges_cover_both_ends() {
    let strategy = SimpleBulkPlacementStrategy::with_seed(2, 8, 4).unwrap();
    let keys = [KeyRange::new(
        (6u32 << 29).to_be_bytes().to_vec(),
        (2u32 << 29).to_be_bytes().to_vec(),
    )];
    let ranges = PartitionIdRange::from_key_ranges(&keys, 8).unwrap();
    assert_eq!(ranges.len(), 2);
    strategy.set_local_partition_bounds(ranges).unwrap();
    let seen: HashSet<u32> = (0..200)
        .map(|_| strategy.get_partition(&plain()).unwrap())
        .collect();
    assert!(seen.iter().all(|p| [6, 7, 0, 1].contains(p)), "{seen:?}");
}

#[test]
fn equal_property_values_are_colocated() {
    let fallback = Arc::new(SimpleBulkPlacementStrategy::with_seed(2, 64, 0).unwrap());
    let strategy = PropertyPlacementStrategy::new("account", 64, fallback).unwrap();
    let a1 = PropertyMap::new().with("account", 42i64);
    let a2 = PropertyMap::new().with("account", 42i64).with("name", "other");
    let b = PropertyMap::new().with("account", "beta");
    let batch: [&dyn PlacementElement; 3] = [&a1, &a2, &b];
    let placed = strategy.get_partitions(&batch).unwrap();
    assert_eq!(placed[0], placed[1]);
    assert_eq!(placed[0], PartitionValue::Int(42).partition(64));
    assert_eq!(placed[2], PartitionValue::from("beta").partition(64));
}

#[test]
fn property_placement_probes_then_fails_cleanly() {
    let fallback = Arc::new(SimpleBulkPlacementStrategy::with_seed(1, 6, 0).unwrap());
    let strategy = PropertyPlacementStrategy::new("tenant", 6, fallback.clone()).unwrap();
    let element = PropertyMap::new().with("tenant", "acme");
    let home = PartitionValue::from("acme").partition(6);

    strategy.exhausted_partition(home);
    strategy.exhausted_partition((home + 1) % 6);
    assert_eq!(strategy.get_partition(&element).unwrap(), (home + 2) % 6);
    // exhaustion is forwarded to the fallback window too
    assert!(!fallback.active_partitions().contains(&home));

    for p in 0..6 {
        strategy.exhausted_partition(p);
    }
    assert!(strategy.get_partition(&element).unwrap_err().is_exhausted());
    assert!(strategy.get_partition(&plain()).unwrap_err().is_exhausted());
}
