//! End-to-end store scenarios: admission, flushing, background fetches,
//! vbucket lifecycle, warmup.

use bytes::Bytes;
use cacheio_common::{CacheConfig, Status, VirtualClock};
use cacheio_engine::backend::{FileBackend, KvBackend, MemoryBackend};
use cacheio_engine::{CacheStore, Cookie, FlusherState, Item, Notifier, VBucketState};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct TestNotifier {
    seen: Mutex<Vec<(Cookie, Status)>>,
}

impl Notifier for TestNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Status) {
        self.seen.lock().push((cookie, status));
    }
}

impl TestNotifier {
    fn notifications_for(&self, cookie: Cookie) -> Vec<Status> {
        self.seen
            .lock()
            .iter()
            .filter(|(c, _)| *c == cookie)
            .map(|(_, s)| *s)
            .collect()
    }
}

struct Rig {
    store: Arc<CacheStore>,
    backend: Arc<MemoryBackend>,
    notifier: Arc<TestNotifier>,
    clock: Arc<VirtualClock>,
}

fn test_config() -> CacheConfig {
    CacheConfig {
        max_vbuckets: 16,
        ht_size: 7,
        ht_locks: 3,
        max_txn_size: 10,
        min_data_age: 0,
        flush_interval: 1,
        bg_fetch_delay: 0,
        ..CacheConfig::default()
    }
}

/// Open a store without activating any vbucket (warmup decides ownership).
fn open_cold(config: CacheConfig, backend: Arc<MemoryBackend>) -> Rig {
    let notifier = Arc::new(TestNotifier::default());
    let clock = Arc::new(VirtualClock::new());
    let store = CacheStore::open(
        config,
        backend.clone() as Arc<dyn KvBackend>,
        notifier.clone(),
        clock.clone(),
    )
    .unwrap();
    Rig {
        store,
        backend,
        notifier,
        clock,
    }
}

fn open_with(config: CacheConfig, backend: Arc<MemoryBackend>) -> Rig {
    let rig = open_cold(config, backend);
    rig.store.set_vbucket_state(0, VBucketState::Active);
    rig
}

fn rig() -> Rig {
    open_with(test_config(), Arc::new(MemoryBackend::new()))
}

fn item(key: &str, vbucket: u16, value: &str) -> Item {
    Item::new(key, vbucket, 0, 0, value.as_bytes().to_vec())
}

fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

fn wait_persisted(rig: &Rig, key: &str) {
    assert!(
        wait_until(
            || rig.backend.committed_value(key).is_some(),
            Duration::from_secs(10)
        ),
        "key {key} never reached the backend"
    );
}

#[test]
fn test_set_get_round_trip() {
    let rig = rig();
    assert_eq!(rig.store.set(&item("x", 0, "1"), 1, false), Status::Success);
    let gv = rig.store.get("x", 0, 1);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value[..], b"1");
    rig.store.shutdown();
}

#[test]
fn test_set_persists_and_assigns_rowid() {
    let rig = rig();
    rig.store.set(&item("x", 0, "1"), 1, false);
    wait_persisted(&rig, "x");
    let stats = rig.store.stats();
    assert_eq!(stats.new_items.load(Ordering::Relaxed), 1);
    assert!(stats.flusher_commits.load(Ordering::Relaxed) >= 1);
    assert!(wait_until(
        || rig.store.get("x", 0, 1).rowid > 0,
        Duration::from_secs(5)
    ));
    rig.store.shutdown();
}

#[test]
fn test_del_then_get_reports_enoent() {
    let rig = rig();
    assert_eq!(rig.store.del("missing", 0, 1), Status::KeyEnoent);
    rig.store.set(&item("x", 0, "1"), 1, false);
    assert_eq!(rig.store.del("x", 0, 1), Status::Success);
    assert_eq!(rig.store.get("x", 0, 1).status, Status::KeyEnoent);
    // The deletion eventually clears the backend too.
    assert!(wait_until(
        || rig.backend.committed_value("x").is_none(),
        Duration::from_secs(10)
    ));
    rig.store.shutdown();
}

#[test]
fn test_dirty_mutation_enqueues_exactly_once() {
    let rig = rig();
    rig.store.pause_flusher();
    assert!(rig
        .store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(10)));

    rig.store.set(&item("x", 0, "1"), 1, false);
    rig.store.set(&item("x", 0, "2"), 1, false);
    rig.store.set(&item("x", 0, "3"), 1, false);
    // One queued item for the whole dirty episode.
    assert_eq!(rig.store.stats().total_enqueued.load(Ordering::Relaxed), 1);

    rig.store.resume_flusher();
    wait_persisted(&rig, "x");
    assert_eq!(&rig.backend.committed_value("x").unwrap().value[..], b"3");

    // Clean again: the next mutation opens a new episode.
    rig.store.set(&item("x", 0, "4"), 1, false);
    assert!(wait_until(
        || rig.store.stats().total_enqueued.load(Ordering::Relaxed) == 2,
        Duration::from_secs(5)
    ));
    rig.store.shutdown();
}

#[test]
fn test_cas_semantics() {
    let rig = rig();
    assert_eq!(
        rig.store.set(&item("x", 0, "1").with_cas(7), 1, false),
        Status::KeyEnoent
    );
    rig.store.set(&item("x", 0, "1"), 1, false);
    let cas = rig.store.get("x", 0, 1).item.unwrap().cas;
    assert_eq!(
        rig.store.set(&item("x", 0, "2").with_cas(cas), 1, false),
        Status::Success
    );
    // The CAS moved with the successful mutation.
    assert_eq!(
        rig.store.set(&item("x", 0, "3").with_cas(cas), 1, false),
        Status::KeyEexists
    );
    rig.store.shutdown();
}

#[test]
fn test_add_semantics() {
    let rig = rig();
    assert_eq!(rig.store.add(&item("x", 0, "1"), 1), Status::Success);
    assert_eq!(rig.store.add(&item("x", 0, "2"), 1), Status::NotStored);
    assert_eq!(
        rig.store.add(&item("y", 0, "1").with_cas(3), 1),
        Status::NotStored
    );
    rig.store.del("x", 0, 1);
    assert_eq!(rig.store.add(&item("x", 0, "3"), 1), Status::Success);
    assert_eq!(&rig.store.get("x", 0, 1).item.unwrap().value[..], b"3");
    rig.store.shutdown();
}

// Scenario: a value is ejected, the next get goes asynchronous, and the
// background fetch restores it.
#[test]
fn test_bg_fetch_round_trip() {
    let rig = rig();
    rig.store.set(&item("x", 0, "1"), 1, false);
    wait_persisted(&rig, "x");
    // Ejection needs the rowid assigned back to the record.
    assert!(wait_until(
        || {
            let (status, msg) = rig.store.evict_key("x", 0);
            status == Status::Success && (msg == "Ejected." || msg == "Already ejected.")
        },
        Duration::from_secs(5)
    ));
    assert_eq!(rig.store.stats().num_non_resident.load(Ordering::Relaxed), 1);

    let gv = rig.store.get("x", 0, 42);
    assert_eq!(gv.status, Status::Ewouldblock);
    assert!(gv.rowid > 0);

    assert!(wait_until(
        || rig.notifier.notifications_for(42) == vec![Status::Success],
        Duration::from_secs(10)
    ));
    let gv = rig.store.get("x", 0, 42);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value[..], b"1");

    let stats = rig.store.stats();
    assert_eq!(stats.bg_fetched.load(Ordering::Relaxed), 1);
    assert_eq!(stats.num_non_resident.load(Ordering::Relaxed), 0);
    assert_eq!(rig.store.bg_fetch_queue_len(), 0);
    rig.store.shutdown();
}

// Scenario: ops against a pending vbucket park once and are released on
// activation.
#[test]
fn test_pending_vbucket_parks_then_releases() {
    let rig = rig();
    rig.store.set_vbucket_state(5, VBucketState::Pending);
    let nmv_before = rig
        .store
        .stats()
        .num_not_my_vbuckets
        .load(Ordering::Relaxed);

    assert_eq!(rig.store.get("y", 5, 77).status, Status::Ewouldblock);
    // Same cookie again: still EWOULDBLOCK, not parked twice.
    assert_eq!(rig.store.get("y", 5, 77).status, Status::Ewouldblock);

    rig.store.set_vbucket_state(5, VBucketState::Active);
    assert!(wait_until(
        || !rig.notifier.notifications_for(77).is_empty(),
        Duration::from_secs(10)
    ));
    assert_eq!(rig.notifier.notifications_for(77), vec![Status::Success]);
    assert_eq!(
        rig.store
            .stats()
            .num_not_my_vbuckets
            .load(Ordering::Relaxed),
        nmv_before
    );
    rig.store.shutdown();
}

// Scenario: while a vbucket deletion is in flight, the flusher refuses to
// write sets for that vbucket and requeues them; they land once the
// deletion completes.
#[test]
fn test_flusher_requeues_sets_during_vbucket_deletion() {
    let rig = rig();
    rig.store.set_vbucket_state(7, VBucketState::Active);
    rig.store.set(&item("k", 7, "v"), 1, false);
    wait_persisted(&rig, "k");

    rig.store.set_vbucket_state(7, VBucketState::Dead);
    assert_eq!(
        rig.store.set(&item("k", 7, "v2"), 1, false),
        Status::NotMyVbucket
    );

    // First backend drop fails, leaving the deletion bit set until the
    // 10s retry succeeds.
    rig.backend.fail_next_vb_dels(1);
    assert!(rig.store.delete_vbucket(7));
    assert!(wait_until(
        || rig.store.stats().vbucket_del_fail.load(Ordering::Relaxed) == 1,
        Duration::from_secs(10)
    ));

    // The id is reused while the old data is still being erased.
    rig.store.set_vbucket_state(7, VBucketState::Active);
    assert_eq!(rig.store.set(&item("k2", 7, "v"), 1, false), Status::Success);

    // Not written while the deletion is pending; the item keeps cycling
    // back into the producer queue instead.
    std::thread::sleep(Duration::from_secs(2));
    assert!(rig.backend.committed_value("k2").is_none());
    assert!(wait_until(
        || rig.store.stats().queue_size.load(Ordering::Relaxed) >= 1,
        Duration::from_secs(5)
    ));

    // After the retry clears the bit, the set goes through.
    assert!(wait_until(
        || rig.store.stats().vbucket_deletions.load(Ordering::Relaxed) == 1,
        Duration::from_secs(20)
    ));
    wait_persisted(&rig, "k2");
    rig.store.shutdown();
}

// Scenario: an injected commit failure is retried with no data loss.
#[test]
fn test_commit_retry_persists_whole_batch() {
    let rig = rig();
    rig.store.pause_flusher();
    assert!(rig
        .store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(10)));

    for i in 0..10 {
        rig.store.set(&item(&format!("k{i}"), 0, "v"), 1, false);
    }
    rig.backend.fail_next_commits(1);
    rig.store.resume_flusher();

    assert!(wait_until(
        || rig.backend.row_count() == 10,
        Duration::from_secs(15)
    ));
    let stats = rig.store.stats();
    assert_eq!(stats.commit_failed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.flusher_commits.load(Ordering::Relaxed), 1);
    rig.store.shutdown();
}

#[test]
fn test_warmup_round_trip() {
    let backend = Arc::new(MemoryBackend::new());
    {
        let rig = open_with(test_config(), backend.clone());
        rig.store.set(&item("x", 0, "persisted"), 1, false);
        wait_persisted(&rig, "x");
        rig.store.shutdown();
    }

    let rig = open_cold(test_config(), backend);
    rig.store.warmup();
    assert_eq!(rig.store.stats().warmed_up.load(Ordering::Relaxed), 1);
    // Warmup leaves restored vbuckets pending until ownership is decided.
    assert_eq!(
        rig.store.get_vbucket(0).unwrap().state(),
        VBucketState::Pending
    );
    rig.store.set_vbucket_state(0, VBucketState::Active);
    let gv = rig.store.get("x", 0, 1);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value[..], b"persisted");
    rig.store.shutdown();
}

#[test]
fn test_warmup_from_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kv.log");
    {
        let backend = Arc::new(FileBackend::open(&path).unwrap());
        let notifier = Arc::new(TestNotifier::default());
        let store = CacheStore::open(
            test_config(),
            backend.clone() as Arc<dyn KvBackend>,
            notifier,
            Arc::new(VirtualClock::new()),
        )
        .unwrap();
        store.set_vbucket_state(0, VBucketState::Active);
        store.set(&item("x", 0, "durable"), 1, false);
        assert!(wait_until(
            || backend.get("x", 1).item.is_some(),
            Duration::from_secs(10)
        ));
        store.shutdown();
    }

    let backend = Arc::new(FileBackend::open(&path).unwrap());
    let notifier = Arc::new(TestNotifier::default());
    let store = CacheStore::open(
        test_config(),
        backend as Arc<dyn KvBackend>,
        notifier,
        Arc::new(VirtualClock::new()),
    )
    .unwrap();
    store.warmup();
    store.set_vbucket_state(0, VBucketState::Active);
    let gv = store.get("x", 0, 1);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value[..], b"durable");
    store.shutdown();
}

#[test]
fn test_txn_size_one_still_flushes() {
    let config = CacheConfig {
        max_txn_size: 1,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    for i in 0..5 {
        rig.store.set(&item(&format!("k{i}"), 0, "v"), 1, false);
    }
    assert!(wait_until(
        || rig.backend.row_count() == 5,
        Duration::from_secs(10)
    ));
    assert!(rig.store.stats().flusher_commits.load(Ordering::Relaxed) >= 5);
    rig.store.shutdown();
}

#[test]
fn test_single_vbucket_config_rejects_others() {
    let config = CacheConfig {
        max_vbuckets: 1,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    assert_eq!(rig.store.set(&item("a", 0, "v"), 1, false), Status::Success);
    assert_eq!(
        rig.store.set(&item("a", 3, "v"), 1, false),
        Status::NotMyVbucket
    );
    assert_eq!(rig.store.get("a", 5, 1).status, Status::NotMyVbucket);
    assert_eq!(rig.store.del("a", 9, 1), Status::NotMyVbucket);
    assert!(
        rig.store
            .stats()
            .num_not_my_vbuckets
            .load(Ordering::Relaxed)
            >= 3
    );
    rig.store.shutdown();
}

#[test]
fn test_vbucket_state_round_trip_and_persist() {
    let rig = rig();
    rig.store.set_vbucket_state(2, VBucketState::Replica);
    assert_eq!(
        rig.store.get_vbucket(2).unwrap().state(),
        VBucketState::Replica
    );
    // A transition on an existing vbucket is persisted asynchronously.
    rig.store.set_vbucket_state(2, VBucketState::Active);
    assert!(wait_until(
        || rig.backend.vb_state(2).as_deref() == Some("active"),
        Duration::from_secs(10)
    ));
    rig.store.shutdown();
}

#[test]
fn test_replica_admission() {
    let rig = rig();
    rig.store.set_vbucket_state(4, VBucketState::Replica);
    assert_eq!(
        rig.store.set(&item("r", 4, "v"), 1, false),
        Status::NotMyVbucket
    );
    assert_eq!(rig.store.set(&item("r", 4, "v"), 1, true), Status::Success);
    assert_eq!(rig.store.add(&item("r2", 4, "v"), 1), Status::NotMyVbucket);
    assert_eq!(rig.store.get("r", 4, 1).status, Status::NotMyVbucket);
    assert_eq!(rig.store.del("r", 4, 1), Status::NotMyVbucket);
    rig.store.shutdown();
}

#[test]
fn test_get_locked_flow() {
    let rig = rig();
    rig.store.set(&item("x", 0, "1"), 1, false);
    let locked = rig.store.get_locked("x", 0, 1, 10);
    assert_eq!(locked.status, Status::Success);
    let lock_cas = locked.item.unwrap().cas;

    // A second lock attempt fails while held.
    assert_eq!(rig.store.get_locked("x", 0, 1, 10).status, Status::Tmpfail);
    // Plain reads see an unusable CAS.
    assert_eq!(rig.store.get("x", 0, 1).item.unwrap().cas, u64::MAX);
    // Plain sets bounce; the lock holder's CAS goes through.
    assert_eq!(
        rig.store.set(&item("x", 0, "2"), 1, false),
        Status::KeyEexists
    );
    assert_eq!(
        rig.store.set(&item("x", 0, "2").with_cas(lock_cas), 1, false),
        Status::Success
    );

    // Lock expiry frees the record.
    let relocked = rig.store.get_locked("x", 0, 1, 10);
    assert_eq!(relocked.status, Status::Success);
    rig.clock.advance(11);
    assert_eq!(rig.store.get_locked("x", 0, 1, 10).status, Status::Success);
    rig.store.shutdown();
}

#[test]
fn test_expired_record_reaped_on_get() {
    let rig = rig();
    let mut it = item("x", 0, "v");
    it.exptime = 2;
    rig.store.set(&it, 1, false);
    rig.clock.advance(3);
    assert_eq!(rig.store.get("x", 0, 1).status, Status::KeyEnoent);
    assert_eq!(rig.store.stats().expired.load(Ordering::Relaxed), 1);
    rig.store.shutdown();
}

#[test]
fn test_expiry_pager_reaps() {
    let rig = rig();
    let mut it = item("x", 0, "v");
    it.exptime = 2;
    rig.store.set(&it, 1, false);
    rig.store.set(&item("y", 0, "v"), 1, false);
    rig.clock.advance(5);
    rig.store.run_expiry_pager();
    assert!(rig.store.stats().expired.load(Ordering::Relaxed) >= 1);
    assert_eq!(rig.store.get("x", 0, 1).status, Status::KeyEnoent);
    assert_eq!(rig.store.get("y", 0, 1).status, Status::Success);
    rig.store.shutdown();
}

#[test]
fn test_item_pager_frees_memory() {
    let config = CacheConfig {
        max_size: 400_000,
        mem_high_wat: 200_000,
        mem_low_wat: 100_000,
        pager_active_vb_pcnt: 100,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    let payload = "z".repeat(2048);
    for i in 0..120 {
        rig.store
            .set(&item(&format!("bulk-{i}"), 0, &payload), 1, false);
    }
    // Everything has to be clean and rowid-bearing before it can go.
    assert!(wait_until(
        || rig.backend.row_count() == 120,
        Duration::from_secs(15)
    ));
    let stats = rig.store.stats();
    let before = stats.current_size.load(Ordering::Relaxed);
    assert!(before > 200_000);

    rig.store.run_item_pager();
    assert!(stats.num_value_ejects.load(Ordering::Relaxed) > 0);
    assert!(stats.current_size.load(Ordering::Relaxed) < before);
    rig.store.shutdown();
}

#[test]
fn test_enomem_and_force_bypass() {
    let config = CacheConfig {
        max_size: 1000,
        mem_high_wat: 900,
        mem_low_wat: 800,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    let big = "x".repeat(4096);
    assert_eq!(rig.store.set(&item("big", 0, &big), 1, false), Status::Enomem);
    // Replicated traffic bypasses the ceiling.
    assert_eq!(rig.store.set(&item("big", 0, &big), 1, true), Status::Success);
    rig.store.shutdown();
}

#[test]
fn test_reset_clears_memory_and_backend() {
    let rig = rig();
    rig.store.set(&item("a", 0, "1"), 1, false);
    rig.store.set(&item("b", 0, "2"), 1, false);
    wait_persisted(&rig, "a");
    wait_persisted(&rig, "b");

    rig.store.reset();
    assert_eq!(rig.store.get("a", 0, 1).status, Status::KeyEnoent);
    assert!(wait_until(
        || rig.backend.row_count() == 0,
        Duration::from_secs(10)
    ));
    rig.store.shutdown();
}

#[test]
fn test_delete_many() {
    let rig = rig();
    rig.store.set(&item("a", 0, "1"), 1, false);
    rig.store.set(&item("b", 0, "2"), 1, false);
    rig.store
        .delete_many(&[(0, "a".to_string()), (0, "b".to_string()), (0, "nope".to_string())]);
    assert_eq!(rig.store.get("a", 0, 1).status, Status::KeyEnoent);
    assert_eq!(rig.store.get("b", 0, 1).status, Status::KeyEnoent);
    rig.store.shutdown();
}

#[test]
fn test_get_from_underlying() {
    let rig = rig();
    rig.store.set(&item("x", 0, "deep"), 1, false);
    wait_persisted(&rig, "x");

    let seen: Arc<Mutex<Vec<(Status, Option<Bytes>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let status = rig.store.get_from_underlying(
        "x",
        0,
        9,
        Arc::new(move |gv| {
            sink.lock().push((gv.status, gv.item.map(|i| i.value)));
        }),
    );
    assert_eq!(status, Status::Ewouldblock);
    assert!(wait_until(|| !seen.lock().is_empty(), Duration::from_secs(10)));
    let got = seen.lock();
    assert_eq!(got[0].0, Status::Success);
    assert_eq!(got[0].1.as_ref().unwrap().as_ref(), b"deep");
    rig.store.shutdown();
}

#[test]
fn test_traffic_gate() {
    let config = CacheConfig {
        data_traffic_enabled: false,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    assert_eq!(rig.store.set(&item("x", 0, "v"), 1, false), Status::Tmpfail);
    assert_eq!(rig.store.get("x", 0, 1).status, Status::Tmpfail);
    rig.store.enable_traffic();
    assert_eq!(rig.store.set(&item("x", 0, "v"), 1, false), Status::Success);
    rig.store.shutdown();
}

#[test]
fn test_flusher_pause_resume() {
    let rig = rig();
    rig.store.pause_flusher();
    assert!(rig
        .store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(10)));

    rig.store.set(&item("x", 0, "v"), 1, false);
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(rig.backend.row_count(), 0);

    rig.store.resume_flusher();
    wait_persisted(&rig, "x");
    rig.store.shutdown();
}

#[test]
fn test_shutdown_drains_queued_mutations() {
    let rig = rig();
    rig.store.pause_flusher();
    assert!(rig
        .store
        .flusher()
        .wait_for_state(FlusherState::Paused, Duration::from_secs(10)));
    for i in 0..5 {
        rig.store.set(&item(&format!("k{i}"), 0, "v"), 1, false);
    }
    assert_eq!(rig.backend.row_count(), 0);
    // The final drain runs even from paused.
    rig.store.shutdown();
    assert_eq!(rig.backend.row_count(), 5);
}

#[test]
fn test_min_data_age_delays_persistence() {
    let config = CacheConfig {
        min_data_age: 600,
        ..test_config()
    };
    let rig = open_with(config, Arc::new(MemoryBackend::new()));
    rig.store.set(&item("young", 0, "v"), 1, false);
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(rig.backend.row_count(), 0);
    assert!(rig.store.stats().too_young.load(Ordering::Relaxed) >= 1);

    // Aging past the threshold makes it eligible.
    rig.clock.advance(601);
    assert!(wait_until(
        || rig.backend.row_count() == 1,
        Duration::from_secs(15)
    ));
    rig.store.shutdown();
}
