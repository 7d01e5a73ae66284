//! The eventually-persistent store.
//!
//! Binds the vbucket map, the sharded hash tables, the mutation queues,
//! the flusher and the two dispatchers together. Client operations are
//! served from memory; every accepted mutation is queued for the flusher,
//! and reads of ejected values go through asynchronous background fetches.

use crate::backend::{GetValue, KvBackend};
use crate::dispatcher::{Dispatcher, Priority};
use crate::flusher::Flusher;
use crate::hashtable::{AddStatus, MutationStatus, StoredValue};
use crate::item::{next_cas, Item};
use crate::pager::ITEM_PAGER_INTERVAL;
use crate::queue::{MutationQueue, QueueOp, QueuedItem};
use crate::tasks::{EngineTask, LookupCallback};
use crate::vbucket::{Cookie, Notifier, VBucket, VBucketMap, VBucketState};
use cacheio_common::config::{CacheConfig, ConfigError};
use cacheio_common::stats::{decr, store_max, CacheStats};
use cacheio_common::status::Status;
use cacheio_common::time::Clock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Retry delay for a failed vbucket state persist.
const VB_STATE_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Retry delay for a failed vbucket drop.
const VB_DELETION_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Backoff while background fetches have the flusher preempted.
const PREEMPTED_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct CacheStore {
    config: CacheConfig,
    stats: Arc<CacheStats>,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn KvBackend>,
    notifier: Arc<dyn Notifier>,
    vbuckets: VBucketMap,
    /// Guards state changes, deletions and their completions against each
    /// other. Ordered before any hash-bucket lock, never after.
    vbset_mutex: Mutex<()>,
    towrite: MutationQueue,
    /// The flusher's working queue; single consumer.
    writing: Mutex<VecDeque<QueuedItem>>,
    io_dispatcher: Dispatcher,
    nonio_dispatcher: Dispatcher,
    flusher: Arc<Flusher>,
    bg_fetch_queue: AtomicUsize,
    do_persistence: bool,
    traffic_enabled: AtomicBool,
    self_ref: Weak<CacheStore>,
}

impl CacheStore {
    /// Build and start a store: dispatchers running, flusher and pagers
    /// scheduled. Call [`CacheStore::shutdown`] before dropping it.
    pub fn open(
        mut config: CacheConfig,
        backend: Arc<dyn KvBackend>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.finish()?;

        let stats = Arc::new(CacheStats::new());
        stats.max_size.store(config.max_size, Ordering::Relaxed);
        stats
            .mem_high_wat
            .store(config.mem_high_wat, Ordering::Relaxed);
        stats
            .mem_low_wat
            .store(config.mem_low_wat, Ordering::Relaxed);
        stats
            .min_data_age
            .store(config.min_data_age, Ordering::Relaxed);
        stats
            .queue_age_cap
            .store(config.queue_age_cap, Ordering::Relaxed);

        let do_persistence = std::env::var_os("CACHEIO_NO_PERSISTENCE").is_none();
        if !do_persistence {
            warn!("persistence disabled by environment");
        }

        let store = Arc::new_cyclic(|weak: &Weak<CacheStore>| CacheStore {
            flusher: Arc::new(Flusher::new(
                weak.clone(),
                Duration::from_secs(config.flush_interval),
            )),
            vbuckets: VBucketMap::new(config.max_vbuckets),
            vbset_mutex: Mutex::new(()),
            towrite: MutationQueue::new(),
            writing: Mutex::new(VecDeque::new()),
            io_dispatcher: Dispatcher::new("io"),
            nonio_dispatcher: Dispatcher::new("nonio"),
            bg_fetch_queue: AtomicUsize::new(0),
            do_persistence,
            traffic_enabled: AtomicBool::new(config.data_traffic_enabled),
            self_ref: weak.clone(),
            stats,
            clock,
            backend,
            notifier,
            config,
        });
        store.start();
        Ok(store)
    }

    fn start(&self) {
        self.io_dispatcher.start();
        self.nonio_dispatcher.start();
        self.io_dispatcher.schedule(
            EngineTask::Flush(Arc::clone(&self.flusher)),
            Priority::Flusher,
            Duration::ZERO,
            false,
        );
        self.nonio_dispatcher.schedule(
            EngineTask::ItemPager {
                store: self.self_ref.clone(),
            },
            Priority::ItemPager,
            ITEM_PAGER_INTERVAL,
            true,
        );
        self.nonio_dispatcher.schedule(
            EngineTask::ExpiryPager {
                store: self.self_ref.clone(),
                interval: Duration::from_secs(self.config.exp_pager_stime),
            },
            Priority::ExpiryPager,
            Duration::from_secs(self.config.exp_pager_stime),
            true,
        );
        info!("store started");
    }

    /// Drain the flusher and stop both dispatchers.
    pub fn shutdown(&self) {
        self.flusher.stop();
        self.io_dispatcher.stop();
        if !self
            .flusher
            .wait_for_state(crate::flusher::FlusherState::Stopped, Duration::from_secs(30))
        {
            warn!("flusher did not reach stopped state");
        }
        self.nonio_dispatcher.stop();
        info!("store shut down");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    pub fn pause_flusher(&self) -> bool {
        self.flusher.pause()
    }

    pub fn resume_flusher(&self) -> bool {
        self.flusher.resume()
    }

    pub fn bg_fetch_queue_len(&self) -> usize {
        self.bg_fetch_queue.load(Ordering::Acquire)
    }

    /// Admit client traffic (done automatically after warmup when
    /// configured).
    pub fn enable_traffic(&self) {
        self.traffic_enabled.store(true, Ordering::Release);
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    pub fn get_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid)
    }

    pub(crate) fn vbucket_ids(&self) -> Vec<u16> {
        self.vbuckets.ids()
    }

    // ---- client operations ----------------------------------------------

    /// Store an item. `force` is replica/stream traffic: it bypasses the
    /// memory ceiling and the replica-state rejection.
    pub fn set(&self, item: &Item, cookie: Cookie, force: bool) -> Status {
        if !self.traffic_enabled.load(Ordering::Acquire) {
            return Status::Tmpfail;
        }
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return Status::NotMyVbucket;
        };
        match vb.state() {
            VBucketState::Dead => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return Status::NotMyVbucket;
            }
            VBucketState::Active => {}
            VBucketState::Replica if !force => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return Status::NotMyVbucket;
            }
            VBucketState::Replica => {}
            VBucketState::Pending if !force => {
                vb.add_pending_op(cookie);
                return Status::Ewouldblock;
            }
            VBucketState::Pending => {}
        }

        let cas_op = item.cas != 0;
        match vb.ht.set(item, self.now(), !force) {
            MutationStatus::NoMem => {
                debug_assert!(!force);
                Status::Enomem
            }
            MutationStatus::InvalidCas | MutationStatus::IsLocked => Status::KeyEexists,
            MutationStatus::WasDirty => Status::Success,
            MutationStatus::NotFound => {
                if cas_op {
                    Status::KeyEnoent
                } else {
                    self.queue_dirty(&item.key, item.vbucket, QueueOp::Set);
                    Status::Success
                }
            }
            MutationStatus::WasClean => {
                self.queue_dirty(&item.key, item.vbucket, QueueOp::Set);
                Status::Success
            }
            MutationStatus::InvalidVbucket => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                Status::NotMyVbucket
            }
        }
    }

    /// Store an item only if no live record exists.
    pub fn add(&self, item: &Item, cookie: Cookie) -> Status {
        if !self.traffic_enabled.load(Ordering::Acquire) {
            return Status::Tmpfail;
        }
        let Some(vb) = self.vbuckets.get(item.vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return Status::NotMyVbucket;
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return Status::NotMyVbucket;
            }
            VBucketState::Pending => {
                vb.add_pending_op(cookie);
                return Status::Ewouldblock;
            }
            VBucketState::Active => {}
        }
        if item.cas != 0 {
            // Adding with a CAS constraint makes no sense.
            return Status::NotStored;
        }
        match vb.ht.add(item, self.now(), true, true) {
            AddStatus::NoMem => Status::Enomem,
            AddStatus::Exists => Status::NotStored,
            AddStatus::Success | AddStatus::UnDel => {
                self.queue_dirty(&item.key, item.vbucket, QueueOp::Set);
                Status::Success
            }
        }
    }

    /// Read an item, scheduling a background fetch for ejected values.
    pub fn get(&self, key: &str, vbucket: u16, cookie: Cookie) -> GetValue {
        self.get_ext(key, vbucket, cookie, true, true)
    }

    pub fn get_ext(
        &self,
        key: &str,
        vbucket: u16,
        cookie: Cookie,
        queue_bg: bool,
        honor_states: bool,
    ) -> GetValue {
        if !self.traffic_enabled.load(Ordering::Acquire) {
            return GetValue {
                item: None,
                status: Status::Tmpfail,
                rowid: -1,
            };
        }
        let Some(vb) = self.vbuckets.get(vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return GetValue {
                item: None,
                status: Status::NotMyVbucket,
                rowid: -1,
            };
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica if honor_states => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return GetValue {
                    item: None,
                    status: Status::NotMyVbucket,
                    rowid: -1,
                };
            }
            VBucketState::Pending if honor_states => {
                vb.add_pending_op(cookie);
                return GetValue {
                    item: None,
                    status: Status::Ewouldblock,
                    rowid: -1,
                };
            }
            _ => {}
        }

        let now = self.now();
        let bg = {
            let (mut seg, bucket) = vb.ht.lock_key(key);
            let Some(idx) = self.fetch_valid_index(&vb, &mut seg, bucket, key, false, now) else {
                return GetValue::missing();
            };
            let v = vb.ht.value_at_mut(&mut seg, bucket, idx);
            if v.is_resident() {
                let mut item = v.to_item(vbucket);
                if v.is_locked(now) {
                    // Locked values surface an unusable CAS.
                    item.cas = u64::MAX;
                }
                let rowid = v.rowid();
                return GetValue {
                    item: Some(item),
                    status: Status::Success,
                    rowid,
                };
            }
            v.rowid()
        };
        if queue_bg {
            self.bg_fetch(key, vbucket, bg, cookie);
        }
        GetValue {
            item: None,
            status: Status::Ewouldblock,
            rowid: bg,
        }
    }

    /// Soft-delete a key; the record disappears once the deletion persists.
    pub fn del(&self, key: &str, vbucket: u16, cookie: Cookie) -> Status {
        if !self.traffic_enabled.load(Ordering::Acquire) {
            return Status::Tmpfail;
        }
        let Some(vb) = self.vbuckets.get(vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return Status::NotMyVbucket;
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return Status::NotMyVbucket;
            }
            VBucketState::Pending => {
                vb.add_pending_op(cookie);
                return Status::Ewouldblock;
            }
            VBucketState::Active => {}
        }
        match vb.ht.soft_delete(key, self.now()) {
            MutationStatus::NotFound => Status::KeyEnoent,
            MutationStatus::WasClean => {
                self.queue_dirty(key, vbucket, QueueOp::Del);
                Status::Success
            }
            _ => Status::Success,
        }
    }

    /// Soft-delete a batch of keys.
    pub fn delete_many(&self, keys: &[(u16, String)]) {
        for (vbid, key) in keys {
            let Some(vb) = self.vbuckets.get(*vbid) else {
                continue;
            };
            if vb.ht.soft_delete(key, self.now()) == MutationStatus::WasClean {
                self.queue_dirty(key, *vbid, QueueOp::Del);
            }
        }
    }

    /// Lock a value for `lock_timeout` seconds and bump its CAS.
    pub fn get_locked(
        &self,
        key: &str,
        vbucket: u16,
        cookie: Cookie,
        lock_timeout: u32,
    ) -> GetValue {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return GetValue {
                item: None,
                status: Status::NotMyVbucket,
                rowid: -1,
            };
        };
        if vb.state() != VBucketState::Active {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return GetValue {
                item: None,
                status: Status::NotMyVbucket,
                rowid: -1,
            };
        }
        let now = self.now();
        let rowid = {
            let (mut seg, bucket) = vb.ht.lock_key(key);
            let Some(idx) = self.fetch_valid_index(&vb, &mut seg, bucket, key, false, now) else {
                return GetValue::missing();
            };
            let v = vb.ht.value_at_mut(&mut seg, bucket, idx);
            if v.is_locked(now) {
                return GetValue {
                    item: None,
                    status: Status::Tmpfail,
                    rowid: v.rowid(),
                };
            }
            if v.is_resident() {
                v.lock(now + lock_timeout);
                v.set_cas(next_cas());
                let item = v.to_item(vbucket);
                let rowid = v.rowid();
                return GetValue {
                    item: Some(item),
                    status: Status::Success,
                    rowid,
                };
            }
            v.rowid()
        };
        self.bg_fetch(key, vbucket, rowid, cookie);
        GetValue {
            item: None,
            status: Status::Ewouldblock,
            rowid,
        }
    }

    /// Explicitly eject a value, returning a status and a message naming
    /// the outcome.
    pub fn evict_key(&self, key: &str, vbucket: u16) -> (Status, &'static str) {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            return (Status::NotMyVbucket, "Not my vbucket.");
        };
        if vb.state() != VBucketState::Active {
            return (Status::NotMyVbucket, "Not my vbucket.");
        }
        let now = self.now();
        let (mut seg, bucket) = vb.ht.lock_key(key);
        let Some(idx) = self.fetch_valid_index(&vb, &mut seg, bucket, key, false, now) else {
            return (Status::KeyEnoent, "Not found.");
        };
        let v = vb.ht.value_at_mut(&mut seg, bucket, idx);
        if !v.is_resident() {
            (Status::Success, "Already ejected.")
        } else if v.eject(&self.stats, now) {
            (Status::Success, "Ejected.")
        } else {
            (Status::Success, "Can't eject: Dirty or a small object.")
        }
    }

    /// Schedule a disk lookup that feeds `lookup` instead of the hash
    /// table. Used by per-key stats inspection.
    pub fn get_from_underlying(
        &self,
        key: &str,
        vbucket: u16,
        cookie: Cookie,
        lookup: LookupCallback,
    ) -> Status {
        let Some(vb) = self.vbuckets.get(vbucket) else {
            self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
            return Status::NotMyVbucket;
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => {
                self.stats.num_not_my_vbuckets.fetch_add(1, Ordering::Relaxed);
                return Status::NotMyVbucket;
            }
            VBucketState::Pending => {
                vb.add_pending_op(cookie);
                return Status::Ewouldblock;
            }
            VBucketState::Active => {}
        }
        let now = self.now();
        let rowid = {
            let (mut seg, bucket) = vb.ht.lock_key(key);
            let Some(idx) = self.fetch_valid_index(&vb, &mut seg, bucket, key, false, now) else {
                return Status::KeyEnoent;
            };
            vb.ht.value_at(&seg, bucket, idx).rowid()
        };
        self.bg_fetch_queue.fetch_add(1, Ordering::AcqRel);
        self.io_dispatcher.schedule(
            EngineTask::VKeyFetch {
                store: self.self_ref.clone(),
                key: key.to_string(),
                rowid,
                lookup,
            },
            Priority::VKeyStatBgFetcher,
            Duration::from_secs(self.config.bg_fetch_delay),
            false,
        );
        Status::Ewouldblock
    }

    /// Clear every active vbucket and schedule a backend reset.
    pub fn reset(&self) {
        for vbid in self.vbuckets.ids() {
            if let Some(vb) = self.vbuckets.get(vbid) {
                if vb.state() == VBucketState::Active {
                    let summary = vb.ht.clear();
                    debug!(vbid, items = summary.items, "cleared vbucket");
                }
            }
        }
        self.queue_dirty("", 0, QueueOp::Flush);
    }

    // ---- vbucket state management ---------------------------------------

    /// Set (or create) a vbucket's state. State change notifications and
    /// persistence are scheduled after the registry lock is released.
    pub fn set_vbucket_state(&self, vbid: u16, to: VBucketState) {
        if vbid as usize >= self.vbuckets.capacity() {
            warn!(vbid, "ignoring state change for out-of-range vbucket");
            return;
        }
        let existing = {
            let _guard = self.vbset_mutex.lock();
            match self.vbuckets.get(vbid) {
                Some(vb) => {
                    vb.set_state(to);
                    Some(vb)
                }
                None => {
                    let vb = Arc::new(VBucket::new(
                        vbid,
                        to,
                        self.config.ht_size,
                        self.config.ht_locks,
                        Arc::clone(&self.stats),
                    ));
                    self.vbuckets.add(vb);
                    None
                }
            }
        };
        if let Some(vb) = existing {
            self.nonio_dispatcher.schedule(
                EngineTask::NotifyVbStateChange {
                    vb,
                    notifier: Arc::clone(&self.notifier),
                },
                Priority::NotifyVbStateChange,
                Duration::ZERO,
                false,
            );
            self.io_dispatcher.schedule(
                EngineTask::SetVbState {
                    store: self.self_ref.clone(),
                    vbucket: vbid,
                    state: to,
                },
                Priority::VBucketPersist,
                Duration::ZERO,
                false,
            );
        }
    }

    pub(crate) fn complete_set_vb_state(&self, vbid: u16, state: VBucketState) {
        if !self.backend.set_vb_state(vbid, state.as_str()) {
            debug!(vbid, "rescheduling vbucket state persistence");
            self.io_dispatcher.schedule(
                EngineTask::SetVbState {
                    store: self.self_ref.clone(),
                    vbucket: vbid,
                    state,
                },
                Priority::VBucketPersist,
                VB_STATE_RETRY_DELAY,
                false,
            );
        }
    }

    /// Tear down a dead vbucket: remove it from memory synchronously and
    /// schedule the backend drop.
    pub fn delete_vbucket(&self, vbid: u16) -> bool {
        let vb = {
            let _guard = self.vbset_mutex.lock();
            match self.vbuckets.get(vbid) {
                Some(vb) if vb.state() == VBucketState::Dead => {
                    self.vbuckets.set_deleting(vbid, true);
                    self.vbuckets.remove(vbid)
                }
                _ => None,
            }
        };
        let Some(vb) = vb else {
            return false;
        };
        vb.ht.deactivate();
        let summary = vb.ht.clear();
        debug!(vbid, items = summary.items, "removed vbucket from memory");
        self.io_dispatcher.schedule(
            EngineTask::VBucketDeletion {
                store: self.self_ref.clone(),
                vbucket: vbid,
            },
            Priority::VBucketDeletion,
            Duration::ZERO,
            false,
        );
        true
    }

    pub(crate) fn complete_vbucket_deletion(&self, vbid: u16) {
        let proceed = {
            let _guard = self.vbset_mutex.lock();
            match self.vbuckets.get(vbid) {
                None => true,
                Some(vb) => vb.state() == VBucketState::Dead || self.vbuckets.is_deleting(vbid),
            }
        };
        if !proceed {
            return;
        }
        let ok = {
            let _timer = self.stats.disk_vb_del_histo.time();
            self.backend.del_vbucket(vbid)
        };
        if ok {
            self.vbuckets.set_deleting(vbid, false);
            self.stats.vbucket_deletions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.vbucket_del_fail.fetch_add(1, Ordering::Relaxed);
            debug!(vbid, "rescheduling vbucket deletion");
            self.io_dispatcher.schedule(
                EngineTask::VBucketDeletion {
                    store: self.self_ref.clone(),
                    vbucket: vbid,
                },
                Priority::VBucketDeletion,
                VB_DELETION_RETRY_DELAY,
                false,
            );
        }
    }

    // ---- background fetch ------------------------------------------------

    fn bg_fetch(&self, key: &str, vbucket: u16, rowid: i64, cookie: Cookie) {
        let queued = self.bg_fetch_queue.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(key, queued, "queued a background fetch");
        self.io_dispatcher.schedule(
            EngineTask::BgFetch {
                store: self.self_ref.clone(),
                key: key.to_string(),
                vbucket,
                rowid,
                cookie,
                init: Instant::now(),
            },
            Priority::BgFetcher,
            Duration::from_secs(self.config.bg_fetch_delay),
            false,
        );
    }

    pub(crate) fn complete_bg_fetch(
        &self,
        key: &str,
        vbucket: u16,
        rowid: i64,
        cookie: Cookie,
        init: Instant,
        start: Instant,
    ) {
        let remaining = self
            .bg_fetch_queue
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        debug!(key, remaining, "completed a background fetch");

        let gv = self.backend.get(key, rowid);
        let status = gv.status;
        {
            // Ordered against deletion: registry lock first, bucket lock
            // second.
            let _guard = self.vbset_mutex.lock();
            if let Some(vb) = self.vbuckets.get(vbucket) {
                if vb.state() == VBucketState::Active && status == Status::Success {
                    let now = self.now();
                    let (mut seg, bucket) = vb.ht.lock_key(key);
                    if let Some(idx) =
                        self.fetch_valid_index(&vb, &mut seg, bucket, key, false, now)
                    {
                        let v = vb.ht.value_at_mut(&mut seg, bucket, idx);
                        if !v.is_resident() {
                            if let Some(item) = gv.item.as_ref() {
                                v.restore_value(item.value.clone(), &self.stats);
                            }
                        }
                    }
                }
            }
        }

        let stop = Instant::now();
        // Skip the sample if the timestamps are out of order.
        if stop > start && start > init {
            self.stats.bg_num_operations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bg_wait_histo
                .record((start - init).as_micros() as u64);
            self.stats
                .bg_load_histo
                .record((stop - start).as_micros() as u64);
        }
        self.notifier.notify_io_complete(cookie, status);
    }

    pub(crate) fn complete_vkey_fetch(&self, key: &str, rowid: i64, lookup: &dyn Fn(GetValue)) {
        self.bg_fetch_queue.fetch_sub(1, Ordering::AcqRel);
        let gv = self.backend.get(key, rowid);
        lookup(gv);
    }

    // ---- warmup ----------------------------------------------------------

    /// Replay the backend into the hash tables.
    pub fn warmup(&self) {
        let mut has_purged = false;
        self.backend.dump(&mut |gv| self.warmup_load(gv, &mut has_purged));
        info!(
            warmed = self.stats.warmed_up.load(Ordering::Relaxed),
            "warmup complete"
        );
        if self.config.data_traffic_enabled {
            self.enable_traffic();
        }
    }

    fn warmup_load(&self, gv: GetValue, has_purged: &mut bool) {
        if let Some(item) = gv.item {
            if item.vbucket as usize >= self.vbuckets.capacity() {
                warn!(vbid = item.vbucket, "dropping warmup record for out-of-range vbucket");
                self.stats.warmed_up.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let vb = match self.vbuckets.get(item.vbucket) {
                Some(vb) => vb,
                None => {
                    let _guard = self.vbset_mutex.lock();
                    match self.vbuckets.get(item.vbucket) {
                        Some(vb) => vb,
                        None => {
                            let vb = Arc::new(VBucket::new(
                                item.vbucket,
                                VBucketState::Pending,
                                self.config.ht_size,
                                self.config.ht_locks,
                                Arc::clone(&self.stats),
                            ));
                            self.vbuckets.add(Arc::clone(&vb));
                            vb
                        }
                    }
                }
            };
            let retain = self.should_be_resident();
            let now = self.now();
            let mut status = vb.ht.add(&item, now, false, retain);
            if status == AddStatus::NoMem && !*has_purged {
                warn!("emergency purge to make room for warmup load");
                self.emergency_purge();
                *has_purged = true;
                status = vb.ht.add(&item, now, false, retain);
            }
            match status {
                AddStatus::Success | AddStatus::UnDel => {}
                AddStatus::Exists => {
                    warn!(key = %item.key, "duplicate key in warmup load");
                    self.stats.warm_dups.fetch_add(1, Ordering::Relaxed);
                }
                AddStatus::NoMem => {
                    if self.stats.warm_oom.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!("warmup load failure: max_size too low");
                    }
                }
            }
        }
        self.stats.warmed_up.fetch_add(1, Ordering::Relaxed);
    }

    fn should_be_resident(&self) -> bool {
        self.stats.current_size.load(Ordering::Relaxed)
            < self.stats.mem_low_wat.load(Ordering::Relaxed)
    }

    // ---- shared lookup helper --------------------------------------------

    /// Find a record, reaping it if expired. Deleted records are returned
    /// when `want_deleted`; expiry is ignored for them.
    pub(crate) fn fetch_valid_index(
        &self,
        vb: &VBucket,
        seg: &mut crate::hashtable::Segment,
        bucket: usize,
        key: &str,
        want_deleted: bool,
        now: u32,
    ) -> Option<usize> {
        let idx = vb.ht.unlocked_find_index(seg, bucket, key, want_deleted)?;
        let (deleted, expired) = {
            let v = vb.ht.value_at(seg, bucket, idx);
            (v.is_deleted(), v.is_expired(now))
        };
        if deleted {
            return Some(idx);
        }
        if expired {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            if vb.ht.unlocked_soft_delete(seg, bucket, key, now) == MutationStatus::WasClean {
                self.queue_dirty(key, vb.id(), QueueOp::Del);
            }
            return None;
        }
        Some(idx)
    }

    fn with_locked_value<F: FnOnce(&mut StoredValue)>(&self, vbid: u16, key: &str, f: F) -> bool {
        let Some(vb) = self.vbuckets.get(vbid) else {
            return false;
        };
        let (mut seg, bucket) = vb.ht.lock_key(key);
        match vb.ht.unlocked_find(&mut seg, bucket, key, true) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    // ---- mutation queue and flushing ------------------------------------

    pub(crate) fn queue_dirty(&self, key: &str, vbid: u16, op: QueueOp) {
        if !self.do_persistence {
            return;
        }
        let qi = QueuedItem::new(key, vbid, op, self.now());
        self.stats
            .mem_overhead
            .fetch_add(qi.size() as u64, Ordering::Relaxed);
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.towrite.push(qi);
        self.stats
            .queue_size
            .store(self.towrite.len() as u64, Ordering::Relaxed);
    }

    /// One flush pass. Returns the suggested delay before the next pass,
    /// or `None` when both queues were empty.
    pub(crate) fn do_flush(&self, shutdown: bool) -> Option<Duration> {
        let flush_start = self.now();
        if !self.begin_flush() {
            return None;
        }
        let mut rejects = VecDeque::new();
        let (hint, writes) = self.flush_queue(&mut rejects, shutdown);
        self.complete_flush(&mut rejects, flush_start);

        if !shutdown && self.bg_fetch_queue.load(Ordering::Acquire) > 0 {
            Some(PREEMPTED_RETRY_DELAY)
        } else if hint > 0 {
            Some(Duration::from_secs(hint as u64))
        } else if !self.towrite.is_empty() || !self.writing.lock().is_empty() {
            if writes > 0 {
                Some(Duration::ZERO)
            } else {
                Some(PREEMPTED_RETRY_DELAY)
            }
        } else {
            None
        }
    }

    /// Drain everything with the aging rules suspended; used at shutdown.
    pub(crate) fn flush_remaining(&self) {
        loop {
            let before = self.towrite.len() + self.writing.lock().len();
            if before == 0 {
                return;
            }
            let flush_start = self.now();
            if !self.begin_flush() {
                return;
            }
            let mut rejects = VecDeque::new();
            let _ = self.flush_queue(&mut rejects, true);
            self.complete_flush(&mut rejects, flush_start);
            let after = self.towrite.len() + self.writing.lock().len();
            if after >= before {
                debug!(remaining = after, "shutdown flush made no progress");
                return;
            }
        }
    }

    /// Move `towrite` into the working queue. False when nothing to do.
    fn begin_flush(&self) -> bool {
        let mut writing = self.writing.lock();
        if self.towrite.is_empty() && writing.is_empty() {
            self.stats.dirty_age.store(0, Ordering::Relaxed);
            return false;
        }
        self.towrite.drain_into(&mut writing);
        self.stats
            .flusher_todo
            .store(writing.len() as u64, Ordering::Relaxed);
        self.stats
            .queue_size
            .store(self.towrite.len() as u64, Ordering::Relaxed);
        debug!(
            flushing = writing.len(),
            queued = self.towrite.len(),
            "beginning flush"
        );
        true
    }

    /// Write the working queue out in transactions of up to
    /// `max_txn_size` items, stopping early when background fetches are
    /// waiting. Returns the smallest min-age gap seen and the number of
    /// backend writes issued.
    fn flush_queue(&self, rejects: &mut VecDeque<QueuedItem>, shutdown: bool) -> (u32, u64) {
        let mut oldest: u32 = 0;
        let mut writes: u64 = 0;
        loop {
            if self.writing.lock().is_empty() {
                break;
            }
            if !shutdown && self.bg_fetch_queue.load(Ordering::Acquire) > 0 {
                self.stats.flusher_preempts.fetch_add(1, Ordering::Relaxed);
                break;
            }
            self.backend.begin();
            for _ in 0..self.config.max_txn_size {
                if !shutdown && self.bg_fetch_queue.load(Ordering::Acquire) > 0 {
                    break;
                }
                let Some(qi) = self.writing.lock().pop_front() else {
                    break;
                };
                let gap = self.flush_one(qi, rejects, shutdown, &mut writes);
                if gap > 0 && (oldest == 0 || gap < oldest) {
                    oldest = gap;
                }
            }
            self.commit_with_retry();
        }
        (oldest, writes)
    }

    fn commit_with_retry(&self) {
        let commit_start = self.now();
        {
            let _timer = self.stats.disk_commit_histo.time();
            while !self.backend.commit() {
                self.stats.commit_failed.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.now().saturating_sub(commit_start) as u64;
        self.stats.commit_time.store(elapsed, Ordering::Relaxed);
        self.stats
            .cumulative_commit_time
            .fetch_add(elapsed, Ordering::Relaxed);
    }

    /// Push rejects back onto the front of the working queue and close out
    /// the pass's accounting.
    fn complete_flush(&self, rejects: &mut VecDeque<QueuedItem>, flush_start: u32) {
        {
            let mut writing = self.writing.lock();
            if writing.is_empty() {
                writing.append(rejects);
            } else {
                while let Some(qi) = rejects.pop_back() {
                    writing.push_front(qi);
                }
            }
            self.stats
                .flusher_todo
                .store(writing.len() as u64, Ordering::Relaxed);
            self.stats.queue_size.store(
                (self.towrite.len() + writing.len()) as u64,
                Ordering::Relaxed,
            );
        }
        let duration = self.now().saturating_sub(flush_start) as u64;
        self.stats.flush_duration.store(duration, Ordering::Relaxed);
        store_max(&self.stats.flush_duration_high_wat, duration);
        self.stats
            .cumulative_flush_time
            .fetch_add(duration, Ordering::Relaxed);
    }

    fn flush_one(
        &self,
        qi: QueuedItem,
        rejects: &mut VecDeque<QueuedItem>,
        shutdown: bool,
        writes: &mut u64,
    ) -> u32 {
        decr(&self.stats.mem_overhead, qi.size() as u64);
        decr(&self.stats.flusher_todo, 1);
        match qi.op {
            QueueOp::Flush => self.flush_one_delete_all(),
            QueueOp::Set | QueueOp::Del => {
                self.flush_one_del_or_set(qi, rejects, shutdown, writes)
            }
        }
    }

    fn flush_one_delete_all(&self) -> u32 {
        self.backend.reset();
        1
    }

    fn flush_one_del_or_set(
        &self,
        qi: QueuedItem,
        rejects: &mut VecDeque<QueuedItem>,
        shutdown: bool,
        writes: &mut u64,
    ) -> u32 {
        let Some(vb) = self.vbuckets.get(qi.vbucket) else {
            return 0;
        };
        let now = self.now();
        let min_age = if shutdown {
            0
        } else {
            self.stats.min_data_age.load(Ordering::Relaxed)
        };
        let age_cap = self.stats.queue_age_cap.load(Ordering::Relaxed);

        let (deleted, rowid, dirtied, snapshot) = {
            let (mut seg, bucket) = vb.ht.lock_key(&qi.key);
            let Some(idx) = vb.ht.unlocked_find_index(&seg, bucket, &qi.key, true) else {
                return 0;
            };
            let v = vb.ht.value_at_mut(&mut seg, bucket, idx);
            if !v.is_dirty() {
                return 0;
            }
            if !v.is_deleted() && v.is_expired(now + self.config.expiry_window) {
                // Not worth writing: it will be gone before it matters.
                self.stats.flush_expired.fetch_add(1, Ordering::Relaxed);
                v.mark_clean();
                return 0;
            }
            if v.is_pending_id() {
                self.reject(qi, rejects);
                return 0;
            }
            let data_age = now.saturating_sub(v.dirtied_at());
            let dirty_age = now.saturating_sub(qi.queued_at);
            if dirty_age > age_cap {
                self.stats.too_old.fetch_add(1, Ordering::Relaxed);
            } else if data_age < min_age {
                self.stats.too_young.fetch_add(1, Ordering::Relaxed);
                let gap = min_age - data_age;
                self.reject(qi, rejects);
                return gap;
            }
            let dirtied = v.mark_clean();
            self.stats.dirty_age.store(dirty_age as u64, Ordering::Relaxed);
            store_max(&self.stats.dirty_age_high_wat, dirty_age as u64);
            self.stats.data_age.store(data_age as u64, Ordering::Relaxed);
            store_max(&self.stats.data_age_high_wat, data_age as u64);

            let deleted = v.is_deleted();
            let rowid = v.rowid();
            let snapshot = if deleted {
                None
            } else {
                if rowid == -1 {
                    v.set_pending_id();
                }
                Some(v.to_item(qi.vbucket))
            };
            (deleted, rowid, dirtied, snapshot)
        };

        if self.vbuckets.is_deleting(qi.vbucket) {
            // The backend is about to erase this vbucket; writing now would
            // resurrect rows. Undo the clean-marking and retry once the
            // deletion has completed.
            self.with_locked_value(qi.vbucket, &qi.key, |v| {
                v.re_dirty(dirtied);
                v.clear_pending_id();
            });
            self.requeue_to_towrite(qi);
            return 0;
        }

        if deleted {
            let _timer = self.stats.disk_del_histo.time();
            let mut cb = |rows: i32| self.persist_del_done(&qi, dirtied, rows, rejects);
            if rowid > 0 {
                *writes += 1;
                self.backend.del(&qi.key, rowid, &mut cb);
            } else {
                // Never persisted; complete the deletion in memory only.
                cb(0);
            }
        } else {
            let snapshot = snapshot.expect("live record must snapshot");
            let _timer = if rowid == -1 {
                self.stats.disk_insert_histo.time()
            } else {
                self.stats.disk_update_histo.time()
            };
            *writes += 1;
            let mut cb =
                |rows: i32, new_rowid: i64| self.persist_set_done(&qi, dirtied, rows, new_rowid, rejects);
            self.backend.set(&snapshot, &mut cb);
        }
        0
    }

    fn reject(&self, qi: QueuedItem, rejects: &mut VecDeque<QueuedItem>) {
        self.stats
            .mem_overhead
            .fetch_add(qi.size() as u64, Ordering::Relaxed);
        rejects.push_back(qi);
    }

    fn requeue_to_towrite(&self, qi: QueuedItem) {
        self.stats
            .mem_overhead
            .fetch_add(qi.size() as u64, Ordering::Relaxed);
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.towrite.push(qi);
        self.stats
            .queue_size
            .store(self.towrite.len() as u64, Ordering::Relaxed);
    }

    fn redirty(&self, qi: &QueuedItem, dirtied: u32, rejects: &mut VecDeque<QueuedItem>) {
        self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
        self.with_locked_value(qi.vbucket, &qi.key, |v| v.re_dirty(dirtied));
        self.reject(qi.clone(), rejects);
    }

    /// Completion of a set persist.
    fn persist_set_done(
        &self,
        qi: &QueuedItem,
        dirtied: u32,
        rows: i32,
        new_rowid: i64,
        rejects: &mut VecDeque<QueuedItem>,
    ) {
        if rows == 1 {
            if new_rowid > 0 {
                self.stats.new_items.fetch_add(1, Ordering::Relaxed);
                if !self.with_locked_value(qi.vbucket, &qi.key, |v| v.set_rowid(new_rowid)) {
                    warn!(vbid = qi.vbucket, key = %qi.key, "failed to set rowid");
                }
                // Freshly persisted rows in non-active vbuckets are fair
                // game for immediate ejection under memory pressure.
                if let Some(vb) = self.vbuckets.get(qi.vbucket) {
                    if vb.state() != VBucketState::Active
                        && self.stats.current_size.load(Ordering::Relaxed)
                            > self.stats.mem_low_wat.load(Ordering::Relaxed)
                    {
                        let now = self.now();
                        let (mut seg, bucket) = vb.ht.lock_key(&qi.key);
                        if let Some(v) = vb.ht.unlocked_find(&mut seg, bucket, &qi.key, true) {
                            v.eject(&self.stats, now);
                        }
                    }
                }
            }
        } else if rows == 0 {
            // The target row vanished, most likely to a vbucket reset
            // between queueing and persisting. Dropping the write is safe;
            // clear pending-id so the record is not wedged.
            warn!(vbid = qi.vbucket, key = %qi.key, "persisted zero rows for update");
            self.with_locked_value(qi.vbucket, &qi.key, |v| v.clear_pending_id());
        } else {
            self.redirty(qi, dirtied, rejects);
        }
    }

    /// Completion of a delete persist.
    fn persist_del_done(
        &self,
        qi: &QueuedItem,
        dirtied: u32,
        rows: i32,
        rejects: &mut VecDeque<QueuedItem>,
    ) {
        if rows > 1 {
            error!(key = %qi.key, rows, "single-row delete affected multiple rows");
            std::process::abort();
        }
        if rows >= 0 {
            if rows > 0 {
                self.stats.del_items.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(vb) = self.vbuckets.get(qi.vbucket) {
                let (mut seg, bucket) = vb.ht.lock_key(&qi.key);
                if let Some(idx) = vb.ht.unlocked_find_index(&seg, bucket, &qi.key, true) {
                    let is_deleted = vb.ht.value_at(&seg, bucket, idx).is_deleted();
                    if is_deleted {
                        // The deletion is durable; drop the record.
                        if !vb.ht.unlocked_del(&mut seg, bucket, &qi.key) {
                            error!(key = %qi.key, "failed to remove a deleted record");
                            std::process::abort();
                        }
                    } else {
                        // Undeleted before the deletion landed; the next
                        // persist must insert a fresh row.
                        vb.ht.value_at_mut(&mut seg, bucket, idx).clear_rowid();
                    }
                }
            }
        } else {
            self.redirty(qi, dirtied, rejects);
        }
    }
}
