//! VBuckets: partitions of the keyspace, each with its own hash table,
//! state, and list of parked client operations.

use crate::hashtable::HashTable;
use cacheio_common::stats::CacheStats;
use cacheio_common::status::Status;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Opaque handle identifying a waiting client request.
pub type Cookie = u64;

/// Sink for asynchronous completions back to the protocol layer.
pub trait Notifier: Send + Sync {
    fn notify_io_complete(&self, cookie: Cookie, status: Status);
}

/// The replication/ownership state of a vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    /// Owned here; serves all traffic.
    Active,
    /// Receives replicated mutations only.
    Replica,
    /// Ownership transfer in progress; client ops are parked.
    Pending,
    /// Not owned; all traffic is rejected.
    Dead,
}

impl VBucketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(VBucketState::Active),
            "replica" => Some(VBucketState::Replica),
            "pending" => Some(VBucketState::Pending),
            "dead" => Some(VBucketState::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One keyspace partition. Shared: the map holds a strong reference and so
/// does every in-flight task that touches it, so the hash table (and its
/// locks) stay alive until the last task finishes.
pub struct VBucket {
    id: u16,
    state: RwLock<VBucketState>,
    pub ht: HashTable,
    pending_ops: Mutex<Vec<Cookie>>,
}

impl VBucket {
    pub fn new(
        id: u16,
        state: VBucketState,
        ht_size: usize,
        ht_locks: usize,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(state),
            ht: HashTable::new(ht_size, ht_locks, stats),
            pending_ops: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn set_state(&self, to: VBucketState) {
        *self.state.write() = to;
    }

    /// Park a client request until the vbucket leaves `pending`.
    /// Returns false when the cookie was already parked.
    pub fn add_pending_op(&self, cookie: Cookie) -> bool {
        let mut ops = self.pending_ops.lock();
        if ops.contains(&cookie) {
            return false;
        }
        ops.push(cookie);
        true
    }

    pub fn has_pending_ops(&self) -> bool {
        !self.pending_ops.lock().is_empty()
    }

    /// Drain and signal every parked request, once per cookie. Parked ops
    /// stay put while the vbucket is still `pending`.
    pub fn fire_all_ops(&self, notifier: &dyn Notifier) {
        let status = match self.state() {
            VBucketState::Active => Status::Success,
            VBucketState::Pending => return,
            VBucketState::Replica | VBucketState::Dead => Status::NotMyVbucket,
        };
        let cookies = std::mem::take(&mut *self.pending_ops.lock());
        for cookie in cookies {
            notifier.notify_io_complete(cookie, status);
        }
    }
}

/// Fixed-size registry of vbuckets plus the deletion-in-progress bitmap.
pub struct VBucketMap {
    buckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    deleting: Vec<AtomicBool>,
}

impl VBucketMap {
    pub fn new(max_vbuckets: u16) -> Self {
        let n = max_vbuckets as usize;
        Self {
            buckets: (0..n).map(|_| RwLock::new(None)).collect(),
            deleting: (0..n).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(vbid as usize)
            .and_then(|slot| slot.read().clone())
    }

    /// Install (or replace) a vbucket. Out-of-range ids are ignored; the
    /// caller is expected to have validated against `capacity`.
    pub fn add(&self, vb: Arc<VBucket>) {
        if let Some(slot) = self.buckets.get(vb.id() as usize) {
            *slot.write() = Some(vb);
        }
    }

    pub fn remove(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(vbid as usize)
            .and_then(|slot| slot.write().take())
    }

    /// Ids of all present vbuckets.
    pub fn ids(&self) -> Vec<u16> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.read().is_some())
            .map(|(i, _)| i as u16)
            .collect()
    }

    pub fn set_deleting(&self, vbid: u16, deleting: bool) {
        if let Some(flag) = self.deleting.get(vbid as usize) {
            flag.store(deleting, Ordering::Release);
        }
    }

    pub fn is_deleting(&self, vbid: u16) -> bool {
        self.deleting
            .get(vbid as usize)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}
