#![allow(missing_docs)]

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use keyclaim::{
    locking::{ConsistentKeyLocker, ExpectedValueTransaction, LockerOptions, MediatorRegistry},
    metrics::CounterMetrics,
    primitives::time::{
        ManualTimestamps, SystemTimestamps, Timestamp, TimestampProvider, TimestampResolution,
    },
    storage::{Entry, InMemoryStoreManager, KeySliceQuery, SliceQuery, StoreManager},
    types::{ClaimError, KeyColumn, Rid, TxId},
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn manual_clock() -> Arc<ManualTimestamps> {
    Arc::new(ManualTimestamps::new(Timestamp::from_nanos(5_000_000_000)))
}

/// A locker standing in for a separate instance: its own rid and its own
/// mediator registry, meeting others only through the store.
fn instance(
    manager: &InMemoryStoreManager,
    times: Arc<dyn TimestampProvider>,
    opts: LockerOptions,
) -> ConsistentKeyLocker {
    let registry = MediatorRegistry::new(times.clone());
    ConsistentKeyLocker::open(manager, "data", times, &registry, opts).unwrap()
}

fn zero_opts(rid: &str) -> LockerOptions {
    LockerOptions::new(Rid::new(rid.to_owned()).unwrap())
        .lock_wait(Duration::ZERO)
        .lock_expire(Duration::ZERO)
        .retry_count(3)
}

fn kc() -> KeyColumn {
    KeyColumn::new(Bytes::from_static(b"vertex-7"), Bytes::from_static(b"name"))
}

#[test]
fn equal_timestamps_resolve_to_smaller_rid() {
    init_tracing();
    for run in 0..10 {
        let manager = InMemoryStoreManager::new();
        let clock = manual_clock();
        let a = instance(&manager, clock.clone(), zero_opts("A"));
        let b = instance(&manager, clock.clone(), zero_opts("B"));
        let (ta, tb) = (TxId::next(), TxId::next());

        // alternate who writes first; the clock never moves
        if run % 2 == 0 {
            a.write_lock(&kc(), ta).unwrap();
            b.write_lock(&kc(), tb).unwrap();
        } else {
            b.write_lock(&kc(), tb).unwrap();
            a.write_lock(&kc(), ta).unwrap();
        }
        assert_eq!(a.claim_timestamp(&kc(), ta), b.claim_timestamp(&kc(), tb));

        assert!(a.check_locks(ta).is_ok(), "run {run}");
        let err = b.check_locks(tb).unwrap_err();
        assert!(matches!(err, ClaimError::TemporaryLocking(_)), "run {run}: {err}");
    }
}

#[test]
fn contended_lock_gives_up_after_retry_budget() {
    init_tracing();
    let manager = InMemoryStoreManager::new();
    let clock = manual_clock();
    let metrics = Arc::new(CounterMetrics::default());
    let a = instance(&manager, clock.clone(), zero_opts("A"));
    let b = instance(
        &manager,
        clock.clone(),
        zero_opts("B").metrics(metrics.clone()),
    );

    a.lock(&kc(), TxId::next()).unwrap();
    let err = b.lock(&kc(), TxId::next()).unwrap_err();
    assert!(matches!(err, ClaimError::PermanentLocking(_)), "{err}");
    assert_eq!(metrics.snapshot().locks_contended, 3);
}

#[test]
fn crashed_holder_does_not_block_after_expiry() {
    init_tracing();
    let manager = InMemoryStoreManager::new();
    let clock = manual_clock();
    let opts = |rid: &str| {
        LockerOptions::new(Rid::new(rid.to_owned()).unwrap())
            .lock_wait(Duration::from_millis(10))
            .lock_expire(Duration::from_secs(1))
    };
    let crashed = instance(&manager, clock.clone(), opts("crashed"));
    crashed.lock(&kc(), TxId::next()).unwrap();
    drop(crashed);

    let survivor = instance(&manager, clock.clone(), opts("survivor"));
    let err = survivor.lock(&kc(), TxId::next()).unwrap_err();
    assert!(matches!(err, ClaimError::PermanentLocking(_)));

    clock.advance(Duration::from_secs(2));
    survivor.lock(&kc(), TxId::next()).unwrap();
}

#[test]
fn released_lock_is_immediately_available() {
    init_tracing();
    let manager = InMemoryStoreManager::new();
    let clock = manual_clock();
    let a = instance(&manager, clock.clone(), zero_opts("A"));
    let b = instance(&manager, clock.clone(), zero_opts("B"));

    let ta = TxId::next();
    a.lock(&kc(), ta).unwrap();
    a.delete_locks(ta);
    b.lock(&kc(), TxId::next()).unwrap();
}

#[test]
fn threads_in_one_process_are_mediated_locally() {
    init_tracing();
    let manager = InMemoryStoreManager::new();
    let times: Arc<dyn TimestampProvider> =
        Arc::new(SystemTimestamps::new(TimestampResolution::Micro));
    let registry = MediatorRegistry::new(times.clone());
    let opts = LockerOptions::new(Rid::new("shared").unwrap()).lock_wait(Duration::from_millis(5));
    let locker = Arc::new(
        ConsistentKeyLocker::open(&manager, "data", times, &registry, opts).unwrap(),
    );

    const THREADS: usize = 6;
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let locker = locker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let tx = TxId::next();
                locker.lock(&kc(), tx).map(|()| tx)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, ClaimError::PermanentLocking(_)), "{err}");
        }
    }
}

#[test]
fn competing_instances_never_both_win() {
    init_tracing();
    let manager = Arc::new(InMemoryStoreManager::new());
    let times: Arc<dyn TimestampProvider> =
        Arc::new(SystemTimestamps::new(TimestampResolution::Micro));

    const INSTANCES: usize = 5;
    let barrier = Arc::new(Barrier::new(INSTANCES));
    let handles: Vec<_> = (0..INSTANCES)
        .map(|i| {
            let manager = manager.clone();
            let times = times.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let opts = LockerOptions::new(Rid::new(format!("node-{i}")).unwrap())
                    .lock_wait(Duration::from_millis(20))
                    .lock_expire(Duration::from_secs(30));
                let locker = instance(&manager, times, opts);
                barrier.wait();
                locker.lock(&kc(), TxId::next()).is_ok()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert!(winners <= 1, "{winners} instances won the same claim");
}

#[test]
fn stale_expectation_blocks_second_writer() {
    init_tracing();
    let manager = InMemoryStoreManager::new();
    let clock = manual_clock();
    let data = manager.open_store("data").unwrap();
    data.mutate(b"vertex-7", &[Entry::new(&b"name"[..], &b"ada"[..])], &[])
        .unwrap();

    let first = Arc::new(instance(&manager, clock.clone(), zero_opts("A")));
    let mut tx = ExpectedValueTransaction::new(first, data.clone());
    tx.acquire_lock(kc(), Some(Bytes::from_static(b"ada"))).unwrap();
    tx.mutate(
        Bytes::from_static(b"vertex-7"),
        vec![Entry::new(&b"name"[..], &b"grace"[..])],
        Vec::new(),
    );
    tx.commit().unwrap();

    clock.advance(Duration::from_millis(1));
    let second = Arc::new(instance(&manager, clock.clone(), zero_opts("B")));
    let mut tx = ExpectedValueTransaction::new(second, data.clone());
    tx.acquire_lock(kc(), Some(Bytes::from_static(b"ada"))).unwrap();
    let err = tx.prepare_for_mutations().unwrap_err();
    assert!(matches!(err, ClaimError::PermanentLocking(_)), "{err}");
    tx.rollback();

    let cell = data
        .get_slice(&KeySliceQuery::new(
            Bytes::from_static(b"vertex-7"),
            SliceQuery::single(b"name"),
        ))
        .unwrap();
    assert_eq!(cell[0].value, Bytes::from_static(b"grace"));
}
