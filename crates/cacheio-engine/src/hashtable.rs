//! Sharded in-memory hash table of stored values.
//!
//! Buckets are spread over a fixed set of segment mutexes: bucket `b` is
//! guarded by lock `b % L`. Callers that need multi-step access take the
//! segment guard once via [`HashTable::lock_key`] and use the `unlocked_*`
//! operations under it. The table resizes up to the next prime at load
//! factor 0.75, holding every segment lock for the rebuild.

use crate::item::{next_cas, Item};
use bytes::Bytes;
use cacheio_common::stats::{decr, CacheStats};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default bucket count when the config asks for auto sizing.
const DEFAULT_HT_SIZE: usize = 3079;
/// Default segment-lock count when the config asks for auto sizing.
const DEFAULT_HT_LOCKS: usize = 5;

/// Outcome of a set or soft-delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// The memory ceiling would be exceeded.
    NoMem,
    /// CAS constraint not met.
    InvalidCas,
    /// The record is locked and the CAS did not match.
    IsLocked,
    /// No record for the key (a plain set still inserts in this case).
    NotFound,
    /// A previously clean record was dirtied; the caller must enqueue.
    WasClean,
    /// The record was already dirty; no enqueue needed.
    WasDirty,
    /// The table has been shut down (its vbucket is going away).
    InvalidVbucket,
}

/// Outcome of an add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    /// The memory ceiling would be exceeded.
    NoMem,
    /// A live record already exists.
    Exists,
    /// A fresh record was created.
    Success,
    /// A soft-deleted or expired record was reused.
    UnDel,
}

/// An in-memory record for a single key.
///
/// The value bytes may be absent ("non-resident") once ejected; the key,
/// flags and rowid stay behind so a later read can fetch from disk.
#[derive(Debug)]
pub struct StoredValue {
    key: String,
    value: Option<Bytes>,
    /// Length of the logical value, kept across ejection.
    val_len: usize,
    flags: u32,
    exptime: u32,
    cas: u64,
    rowid: i64,
    dirty: bool,
    deleted: bool,
    /// A persist is in flight that will assign the rowid; the value must
    /// not be ejected until it lands.
    pending_id: bool,
    locked_until: u32,
    /// Clock second at which the record was last dirtied.
    dirtied_at: u32,
}

const VALUE_OVERHEAD: usize = std::mem::size_of::<StoredValue>();

impl StoredValue {
    fn from_item(item: &Item, dirty: bool, now: u32) -> Self {
        let cas = if item.cas != 0 { item.cas } else { next_cas() };
        Self {
            key: item.key.clone(),
            value: Some(item.value.clone()),
            val_len: item.value.len(),
            flags: item.flags,
            exptime: item.exptime,
            cas,
            rowid: item.rowid,
            dirty,
            deleted: false,
            pending_id: false,
            locked_until: 0,
            dirtied_at: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn rowid(&self) -> i64 {
        self.rowid
    }

    pub fn dirtied_at(&self) -> u32 {
        self.dirtied_at
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_pending_id(&self) -> bool {
        self.pending_id
    }

    pub fn set_pending_id(&mut self) {
        self.pending_id = true;
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }

    pub fn is_locked(&self, now: u32) -> bool {
        self.locked_until > now
    }

    pub fn lock(&mut self, until: u32) {
        self.locked_until = until;
    }

    pub fn unlock(&mut self) {
        self.locked_until = 0;
    }

    /// Clear the dirty flag, returning the timestamp of the dirtying.
    pub fn mark_clean(&mut self) -> u32 {
        self.dirty = false;
        self.dirtied_at
    }

    pub fn mark_dirty(&mut self, now: u32) {
        self.dirty = true;
        self.dirtied_at = now;
    }

    /// Restore the dirty flag after a failed persist, keeping the original
    /// dirtying time so age-based scheduling is not reset.
    pub fn re_dirty(&mut self, dirtied_at: u32) {
        self.dirty = true;
        self.dirtied_at = dirtied_at;
    }

    /// Record the backend row id, completing an outstanding persist.
    pub fn set_rowid(&mut self, rowid: i64) {
        debug_assert!(self.rowid == -1 || self.rowid == rowid);
        self.rowid = rowid;
        self.pending_id = false;
    }

    /// Forget the row id so a subsequent set starts fresh.
    pub fn clear_rowid(&mut self) {
        self.rowid = -1;
        self.pending_id = false;
    }

    pub fn clear_pending_id(&mut self) {
        self.pending_id = false;
    }

    /// Resident footprint of this record.
    pub fn mem_size(&self) -> usize {
        VALUE_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Logical footprint, counting the value even when ejected.
    pub fn logical_size(&self) -> usize {
        VALUE_OVERHEAD + self.key.len() + self.val_len
    }

    /// Drop the value bytes to reclaim memory. Only a clean, resident,
    /// unlocked record with a known rowid may be ejected.
    pub fn eject(&mut self, stats: &CacheStats, now: u32) -> bool {
        if self.dirty
            || self.deleted
            || self.pending_id
            || self.rowid < 0
            || self.is_locked(now)
            || self.value.is_none()
        {
            return false;
        }
        self.value = None;
        decr(&stats.current_size, self.val_len as u64);
        stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
        stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Reinstall value bytes fetched from disk.
    pub fn restore_value(&mut self, value: Bytes, stats: &CacheStats) -> bool {
        if self.value.is_some() || self.deleted {
            return false;
        }
        stats
            .current_size
            .fetch_add(value.len() as u64, Ordering::Relaxed);
        decr(&stats.num_non_resident, 1);
        self.val_len = value.len();
        self.value = Some(value);
        true
    }

    /// Overwrite this record with a new item, dirtying and undeleting it.
    fn set_from(&mut self, item: &Item, now: u32, stats: &CacheStats) {
        let old_logical = self.val_len;
        if !self.is_resident() && !self.deleted {
            // Becoming resident again through an overwrite.
            decr(&stats.num_non_resident, 1);
        }
        let old_resident = self.value.as_ref().map_or(0, |v| v.len());
        let new_len = item.value.len();
        stats
            .current_size
            .fetch_add(new_len as u64, Ordering::Relaxed);
        decr(&stats.current_size, old_resident as u64);
        stats
            .total_cache_size
            .fetch_add(new_len as u64, Ordering::Relaxed);
        decr(&stats.total_cache_size, old_logical as u64);

        self.value = Some(item.value.clone());
        self.val_len = new_len;
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.cas = if item.cas != 0 { item.cas } else { next_cas() };
        self.deleted = false;
        self.mark_dirty(now);
    }

    /// Mark deleted, dropping the value bytes. The record stays behind
    /// until the deletion is persisted.
    fn soft_delete(&mut self, now: u32, stats: &CacheStats) {
        if !self.is_resident() && !self.deleted {
            decr(&stats.num_non_resident, 1);
        }
        let resident = self.value.as_ref().map_or(0, |v| v.len());
        decr(&stats.current_size, resident as u64);
        decr(&stats.total_cache_size, self.val_len as u64);
        self.value = None;
        self.val_len = 0;
        self.deleted = true;
        self.mark_dirty(now);
    }

    /// Snapshot this record as an item for the given vbucket.
    pub fn to_item(&self, vbucket: u16) -> Item {
        Item {
            key: self.key.clone(),
            vbucket,
            flags: self.flags,
            exptime: self.exptime,
            value: self.value.clone().unwrap_or_else(Bytes::new),
            cas: self.cas,
            rowid: self.rowid,
        }
    }
}

/// Chains owned by one segment lock.
#[derive(Debug, Default)]
pub struct Segment {
    chains: Vec<Vec<StoredValue>>,
}

/// Summary of a [`HashTable::clear`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearSummary {
    pub items: usize,
    pub resident_bytes: u64,
    pub logical_bytes: u64,
    pub non_resident: usize,
}

pub struct HashTable {
    segments: Vec<Mutex<Segment>>,
    size: AtomicUsize,
    num_items: AtomicUsize,
    active: AtomicBool,
    stats: Arc<CacheStats>,
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

fn next_prime(mut n: usize) -> usize {
    while !is_prime(n) {
        n += 1;
    }
    n
}

impl HashTable {
    /// Create a table with `size` buckets and `locks` segment mutexes;
    /// zero picks the defaults.
    pub fn new(size: usize, locks: usize, stats: Arc<CacheStats>) -> Self {
        let size = if size == 0 {
            DEFAULT_HT_SIZE
        } else {
            next_prime(size)
        };
        let locks = if locks == 0 { DEFAULT_HT_LOCKS } else { locks }.min(size);
        let per_segment = size.div_ceil(locks);
        let segments = (0..locks)
            .map(|_| {
                Mutex::new(Segment {
                    chains: (0..per_segment).map(|_| Vec::new()).collect(),
                })
            })
            .collect();
        Self {
            segments,
            size: AtomicUsize::new(size),
            num_items: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.num_items.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Refuse further mutations; used when the owning vbucket goes away.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Bucket index for a key under the current table size.
    pub fn bucket(&self, key: &str) -> usize {
        (hash_key(key) % self.size() as u64) as usize
    }

    /// Lock the segment guarding `bucket`.
    pub fn lock(&self, bucket: usize) -> MutexGuard<'_, Segment> {
        self.segments[bucket % self.segments.len()].lock()
    }

    /// Compute the bucket for `key` and lock its segment, revalidating
    /// against a concurrent resize.
    pub fn lock_key(&self, key: &str) -> (MutexGuard<'_, Segment>, usize) {
        let h = hash_key(key);
        loop {
            let size = self.size();
            let bucket = (h % size as u64) as usize;
            let guard = self.segments[bucket % self.segments.len()].lock();
            if self.size() == size {
                return (guard, bucket);
            }
        }
    }

    fn slot(&self, bucket: usize) -> usize {
        bucket / self.segments.len()
    }

    fn chain<'a>(&self, seg: &'a Segment, bucket: usize) -> &'a Vec<StoredValue> {
        &seg.chains[self.slot(bucket)]
    }

    fn chain_mut<'a>(&self, seg: &'a mut Segment, bucket: usize) -> &'a mut Vec<StoredValue> {
        let slot = self.slot(bucket);
        &mut seg.chains[slot]
    }

    /// Position of `key` in its chain, skipping deleted records unless
    /// `want_deleted`.
    pub fn unlocked_find_index(
        &self,
        seg: &Segment,
        bucket: usize,
        key: &str,
        want_deleted: bool,
    ) -> Option<usize> {
        self.chain(seg, bucket)
            .iter()
            .position(|v| v.key == key && (want_deleted || !v.deleted))
    }

    pub fn unlocked_find<'a>(
        &self,
        seg: &'a mut Segment,
        bucket: usize,
        key: &str,
        want_deleted: bool,
    ) -> Option<&'a mut StoredValue> {
        let idx = self.unlocked_find_index(seg, bucket, key, want_deleted)?;
        Some(&mut self.chain_mut(seg, bucket)[idx])
    }

    pub fn value_at<'a>(&self, seg: &'a Segment, bucket: usize, idx: usize) -> &'a StoredValue {
        &self.chain(seg, bucket)[idx]
    }

    pub fn value_at_mut<'a>(
        &self,
        seg: &'a mut Segment,
        bucket: usize,
        idx: usize,
    ) -> &'a mut StoredValue {
        &mut self.chain_mut(seg, bucket)[idx]
    }

    fn has_memory_for(&self, required: usize) -> bool {
        self.stats.current_size.load(Ordering::Relaxed) + required as u64
            <= self.stats.max_size.load(Ordering::Relaxed)
    }

    /// Store an item, creating or overwriting its record.
    pub fn set(&self, item: &Item, now: u32, enforce_mem: bool) -> MutationStatus {
        let status = {
            let (mut seg, bucket) = self.lock_key(&item.key);
            self.unlocked_set(&mut seg, bucket, item, now, enforce_mem)
        };
        if status == MutationStatus::NotFound {
            self.maybe_resize();
        }
        status
    }

    pub fn unlocked_set(
        &self,
        seg: &mut Segment,
        bucket: usize,
        item: &Item,
        now: u32,
        enforce_mem: bool,
    ) -> MutationStatus {
        if !self.is_active() {
            return MutationStatus::InvalidVbucket;
        }
        match self.unlocked_find_index(seg, bucket, &item.key, true) {
            Some(idx) => {
                let v = self.value_at_mut(seg, bucket, idx);
                if v.is_locked(now) {
                    if item.cas != v.cas {
                        return MutationStatus::IsLocked;
                    }
                    v.unlock();
                }
                if item.cas != 0 && (v.deleted || item.cas != v.cas) {
                    return if v.deleted {
                        MutationStatus::NotFound
                    } else {
                        MutationStatus::InvalidCas
                    };
                }
                let was_clean = !v.dirty;
                v.set_from(item, now, &self.stats);
                if was_clean {
                    MutationStatus::WasClean
                } else {
                    MutationStatus::WasDirty
                }
            }
            None => {
                if item.cas != 0 {
                    return MutationStatus::NotFound;
                }
                let v = StoredValue::from_item(item, true, now);
                if enforce_mem && !self.has_memory_for(v.mem_size()) {
                    return MutationStatus::NoMem;
                }
                self.insert_value(seg, bucket, v);
                MutationStatus::NotFound
            }
        }
    }

    /// Create a record only if no live one exists.
    pub fn add(&self, item: &Item, now: u32, dirty: bool, retain_value: bool) -> AddStatus {
        let status = {
            let (mut seg, bucket) = self.lock_key(&item.key);
            self.unlocked_add(&mut seg, bucket, item, now, dirty, retain_value)
        };
        if status == AddStatus::Success {
            self.maybe_resize();
        }
        status
    }

    pub fn unlocked_add(
        &self,
        seg: &mut Segment,
        bucket: usize,
        item: &Item,
        now: u32,
        dirty: bool,
        retain_value: bool,
    ) -> AddStatus {
        match self.unlocked_find_index(seg, bucket, &item.key, true) {
            Some(idx) => {
                let stats = Arc::clone(&self.stats);
                let v = self.value_at_mut(seg, bucket, idx);
                if !v.deleted && !v.is_expired(now) {
                    return AddStatus::Exists;
                }
                v.set_from(item, now, &stats);
                if !dirty {
                    v.mark_clean();
                    if item.rowid >= 0 {
                        v.set_rowid(item.rowid);
                    }
                }
                if !retain_value {
                    v.eject(&stats, now);
                }
                AddStatus::UnDel
            }
            None => {
                let mut v = StoredValue::from_item(item, dirty, now);
                if !self.has_memory_for(v.mem_size()) {
                    return AddStatus::NoMem;
                }
                if !dirty {
                    v.mark_clean();
                }
                self.insert_value(seg, bucket, v);
                if !retain_value {
                    if let Some(v) = self.unlocked_find(seg, bucket, &item.key, false) {
                        v.eject(&self.stats, now);
                    }
                }
                AddStatus::Success
            }
        }
    }

    fn insert_value(&self, seg: &mut Segment, bucket: usize, v: StoredValue) {
        self.stats
            .current_size
            .fetch_add(v.mem_size() as u64, Ordering::Relaxed);
        self.stats
            .total_cache_size
            .fetch_add(v.logical_size() as u64, Ordering::Relaxed);
        self.chain_mut(seg, bucket).push(v);
        self.num_items.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark a live record deleted, keeping it until the deletion persists.
    pub fn unlocked_soft_delete(
        &self,
        seg: &mut Segment,
        bucket: usize,
        key: &str,
        now: u32,
    ) -> MutationStatus {
        match self.unlocked_find(seg, bucket, key, false) {
            None => MutationStatus::NotFound,
            Some(v) => {
                let was_clean = !v.dirty;
                v.soft_delete(now, &self.stats);
                if was_clean {
                    MutationStatus::WasClean
                } else {
                    MutationStatus::WasDirty
                }
            }
        }
    }

    /// Convenience wrapper that takes the segment lock itself.
    pub fn soft_delete(&self, key: &str, now: u32) -> MutationStatus {
        let (mut seg, bucket) = self.lock_key(key);
        self.unlocked_soft_delete(&mut seg, bucket, key, now)
    }

    /// Physically remove a record. Only a record already marked deleted may
    /// be removed; returns false otherwise.
    pub fn unlocked_del(&self, seg: &mut Segment, bucket: usize, key: &str) -> bool {
        let Some(idx) = self.unlocked_find_index(seg, bucket, key, true) else {
            return false;
        };
        {
            let chain = self.chain(seg, bucket);
            if !chain[idx].deleted {
                return false;
            }
        }
        let v = self.chain_mut(seg, bucket).swap_remove(idx);
        decr(&self.stats.current_size, v.mem_size() as u64);
        decr(&self.stats.total_cache_size, v.logical_size() as u64);
        self.num_items.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Apply `f` to every record, one segment at a time.
    pub fn visit<F: FnMut(&mut StoredValue)>(&self, mut f: F) {
        for segment in &self.segments {
            let mut seg = segment.lock();
            for chain in &mut seg.chains {
                for v in chain.iter_mut() {
                    f(v);
                }
            }
        }
    }

    /// Drop every record, returning what was removed. Adjusts the global
    /// memory counters itself.
    pub fn clear(&self) -> ClearSummary {
        let mut summary = ClearSummary::default();
        for segment in &self.segments {
            let mut seg = segment.lock();
            for chain in &mut seg.chains {
                for v in chain.drain(..) {
                    summary.items += 1;
                    summary.resident_bytes += v.mem_size() as u64;
                    summary.logical_bytes += v.logical_size() as u64;
                    if !v.is_resident() && !v.deleted {
                        summary.non_resident += 1;
                    }
                }
            }
        }
        decr(&self.stats.current_size, summary.resident_bytes);
        decr(&self.stats.total_cache_size, summary.logical_bytes);
        decr(&self.stats.num_non_resident, summary.non_resident as u64);
        self.num_items.store(0, Ordering::Release);
        summary
    }

    fn maybe_resize(&self) {
        let items = self.len();
        if items * 4 > self.size() * 3 {
            self.resize(next_prime(items * 2));
        }
    }

    /// Rebuild with `new_size` buckets, holding every segment lock.
    fn resize(&self, new_size: usize) {
        let mut guards: Vec<MutexGuard<'_, Segment>> =
            self.segments.iter().map(|s| s.lock()).collect();
        let old_size = self.size();
        if new_size <= old_size {
            return;
        }
        let locks = self.segments.len();
        let per_segment = new_size.div_ceil(locks);

        let mut values = Vec::with_capacity(self.len());
        for guard in guards.iter_mut() {
            for chain in guard.chains.iter_mut() {
                values.append(chain);
            }
            guard.chains = (0..per_segment).map(|_| Vec::new()).collect();
        }
        self.size.store(new_size, Ordering::Release);
        for v in values {
            let bucket = (hash_key(&v.key) % new_size as u64) as usize;
            guards[bucket % locks].chains[bucket / locks].push(v);
        }
    }
}
