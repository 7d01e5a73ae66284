//! In-memory backend.
//!
//! Holds committed rows in a map and buffers the open transaction, so
//! commit failures keep the transaction intact for retry. Failure counters
//! let tests inject transient errors on any operation.

use super::{GetValue, KvBackend};
use crate::item::Item;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

#[derive(Debug, Clone)]
struct Row {
    item: Item,
}

#[derive(Debug, Clone)]
enum StagedOp {
    Set(i64, Item),
    Del(i64),
    DelVbucket(u16),
    Reset,
}

/// Map-backed implementation of [`KvBackend`] with fault injection.
#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<BTreeMap<i64, Row>>,
    staged: Mutex<Vec<StagedOp>>,
    vb_states: Mutex<BTreeMap<u16, String>>,
    next_rowid: AtomicI64,
    fail_commits: AtomicU32,
    fail_sets: AtomicU32,
    fail_dels: AtomicU32,
    fail_vb_dels: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            next_rowid: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Make the next `n` commits fail.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` row writes report a transient failure.
    pub fn fail_next_sets(&self, n: u32) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` row deletions report a transient failure.
    pub fn fail_next_dels(&self, n: u32) {
        self.fail_dels.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` vbucket drops fail.
    pub fn fail_next_vb_dels(&self, n: u32) {
        self.fail_vb_dels.store(n, Ordering::SeqCst);
    }

    /// Number of committed rows.
    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }

    /// Committed value for a key, if any.
    pub fn committed_value(&self, key: &str) -> Option<Item> {
        self.rows
            .lock()
            .values()
            .find(|r| r.item.key == key)
            .map(|r| r.item.clone())
    }

    pub fn vb_state(&self, vbucket: u16) -> Option<String> {
        self.vb_states.lock().get(&vbucket).cloned()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn staged_contains(&self, rowid: i64) -> bool {
        self.staged.lock().iter().any(|op| match op {
            StagedOp::Set(id, _) => *id == rowid,
            _ => false,
        })
    }
}

impl KvBackend for MemoryBackend {
    fn begin(&self) {}

    fn commit(&self) -> bool {
        if Self::take_failure(&self.fail_commits) {
            return false;
        }
        let staged = std::mem::take(&mut *self.staged.lock());
        let mut rows = self.rows.lock();
        for op in staged {
            match op {
                StagedOp::Set(rowid, item) => {
                    rows.insert(rowid, Row { item });
                }
                StagedOp::Del(rowid) => {
                    rows.remove(&rowid);
                }
                StagedOp::DelVbucket(vbucket) => {
                    rows.retain(|_, r| r.item.vbucket != vbucket);
                }
                StagedOp::Reset => rows.clear(),
            }
        }
        true
    }

    fn set(&self, item: &Item, cb: &mut dyn FnMut(i32, i64)) {
        if Self::take_failure(&self.fail_sets) {
            cb(-1, 0);
            return;
        }
        if item.rowid >= 0 {
            // Update in place; the row may have vanished underneath us.
            let exists = self.rows.lock().contains_key(&item.rowid) || self.staged_contains(item.rowid);
            if !exists {
                cb(0, 0);
                return;
            }
            self.staged
                .lock()
                .push(StagedOp::Set(item.rowid, item.clone()));
            cb(1, 0);
        } else {
            let rowid = self.next_rowid.fetch_add(1, Ordering::SeqCst);
            let mut stored = item.clone();
            stored.rowid = rowid;
            self.staged.lock().push(StagedOp::Set(rowid, stored));
            cb(1, rowid);
        }
    }

    fn del(&self, key: &str, rowid: i64, cb: &mut dyn FnMut(i32)) {
        if Self::take_failure(&self.fail_dels) {
            cb(-1);
            return;
        }
        let exists = {
            let rows = self.rows.lock();
            rows.get(&rowid).map(|r| r.item.key == key).unwrap_or(false)
        } || self.staged_contains(rowid);
        if exists {
            self.staged.lock().push(StagedOp::Del(rowid));
            cb(1);
        } else {
            cb(0);
        }
    }

    fn get(&self, key: &str, rowid: i64) -> GetValue {
        let rows = self.rows.lock();
        match rows.get(&rowid) {
            Some(row) if row.item.key == key => GetValue::found(row.item.clone(), rowid),
            _ => {
                // Fall back to a key scan; the row may have been rewritten.
                rows.values()
                    .find(|r| r.item.key == key)
                    .map(|r| GetValue::found(r.item.clone(), r.item.rowid))
                    .unwrap_or_else(GetValue::missing)
            }
        }
    }

    fn del_vbucket(&self, vbucket: u16) -> bool {
        if Self::take_failure(&self.fail_vb_dels) {
            return false;
        }
        // VBucket removal is not transactional with the flusher's batches.
        self.rows.lock().retain(|_, r| r.item.vbucket != vbucket);
        self.staged.lock().push(StagedOp::DelVbucket(vbucket));
        true
    }

    fn set_vb_state(&self, vbucket: u16, state: &str) -> bool {
        self.vb_states.lock().insert(vbucket, state.to_string());
        true
    }

    fn reset(&self) {
        self.staged.lock().clear();
        self.rows.lock().clear();
        self.vb_states.lock().clear();
    }

    fn dump(&self, cb: &mut dyn FnMut(GetValue)) {
        let rows: Vec<Item> = self.rows.lock().values().map(|r| r.item.clone()).collect();
        for item in rows {
            let rowid = item.rowid;
            cb(GetValue::found(item, rowid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, vbucket: u16) -> Item {
        Item::new(key, vbucket, 0, 0, "v")
    }

    fn persist(backend: &MemoryBackend, it: &Item) -> i64 {
        let mut rowid = -1;
        backend.begin();
        backend.set(it, &mut |rows, id| {
            assert_eq!(rows, 1);
            rowid = id;
        });
        assert!(backend.commit());
        rowid
    }

    #[test]
    fn test_set_assigns_rowid_once() {
        let backend = MemoryBackend::new();
        let rowid = persist(&backend, &item("k", 0));
        assert!(rowid > 0);

        let mut updated = item("k", 0);
        updated.rowid = rowid;
        backend.begin();
        backend.set(&updated, &mut |rows, id| {
            assert_eq!((rows, id), (1, 0));
        });
        assert!(backend.commit());
        assert_eq!(backend.row_count(), 1);
    }

    #[test]
    fn test_stale_update_reports_zero_rows() {
        let backend = MemoryBackend::new();
        let mut it = item("k", 0);
        it.rowid = 42; // Never existed.
        backend.begin();
        let mut seen = None;
        backend.set(&it, &mut |rows, id| seen = Some((rows, id)));
        assert_eq!(seen, Some((0, 0)));
    }

    #[test]
    fn test_del_and_missing_del() {
        let backend = MemoryBackend::new();
        let rowid = persist(&backend, &item("k", 0));

        backend.begin();
        let mut rows = -2;
        backend.del("k", rowid, &mut |r| rows = r);
        assert_eq!(rows, 1);
        assert!(backend.commit());
        assert_eq!(backend.row_count(), 0);

        backend.begin();
        backend.del("k", rowid, &mut |r| rows = r);
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_commit_failure_keeps_transaction() {
        let backend = MemoryBackend::new();
        backend.fail_next_commits(2);
        backend.begin();
        backend.set(&item("k", 0), &mut |_, _| {});
        assert!(!backend.commit());
        assert!(!backend.commit());
        assert!(backend.commit());
        assert_eq!(backend.row_count(), 1);
    }

    #[test]
    fn test_injected_set_failure() {
        let backend = MemoryBackend::new();
        backend.fail_next_sets(1);
        backend.begin();
        let mut seen = None;
        backend.set(&item("k", 0), &mut |rows, id| seen = Some((rows, id)));
        assert_eq!(seen, Some((-1, 0)));
    }

    #[test]
    fn test_del_vbucket_scopes_to_vbucket() {
        let backend = MemoryBackend::new();
        persist(&backend, &item("a", 1));
        persist(&backend, &item("b", 2));
        assert!(backend.del_vbucket(1));
        assert_eq!(backend.row_count(), 1);
        assert!(backend.committed_value("b").is_some());
    }

    #[test]
    fn test_dump_streams_committed_rows() {
        let backend = MemoryBackend::new();
        persist(&backend, &item("a", 0));
        persist(&backend, &item("b", 0));
        let mut keys = Vec::new();
        backend.dump(&mut |gv| keys.push(gv.item.unwrap().key));
        keys.sort();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn test_get_by_rowid() {
        let backend = MemoryBackend::new();
        let rowid = persist(&backend, &item("k", 0));
        let gv = backend.get("k", rowid);
        assert_eq!(gv.status, cacheio_common::Status::Success);
        assert_eq!(gv.rowid, rowid);
        assert!(backend.get("missing", 999).item.is_none());
    }
}
