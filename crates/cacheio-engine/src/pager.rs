//! Periodic eviction and expiry scans.

use crate::queue::QueueOp;
use crate::store::CacheStore;
use crate::vbucket::VBucketState;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const ITEM_PAGER_INTERVAL: Duration = Duration::from_secs(10);

impl CacheStore {
    /// Eject values until memory falls below the low watermark, taking a
    /// configured share from active vbuckets first, then replicas.
    pub fn run_item_pager(&self) {
        let stats = self.stats();
        let current = stats.current_size.load(Ordering::Relaxed);
        let high = stats.mem_high_wat.load(Ordering::Relaxed);
        if current <= high {
            return;
        }
        let low = stats.mem_low_wat.load(Ordering::Relaxed);
        let target = current.saturating_sub(low);
        let active_quota = target * self.config().pager_active_vb_pcnt as u64 / 100;
        debug!(current, target, "item pager starting");

        let now = self.now();
        let mut freed: u64 = 0;
        for vbid in self.vbucket_ids() {
            if freed >= active_quota {
                break;
            }
            let Some(vb) = self.get_vbucket(vbid) else {
                continue;
            };
            if vb.state() != VBucketState::Active {
                continue;
            }
            vb.ht.visit(|v| {
                if freed >= active_quota {
                    return;
                }
                let len = v.value().map_or(0, |b| b.len() as u64);
                if v.eject(stats, now) {
                    freed += len;
                }
            });
        }
        for vbid in self.vbucket_ids() {
            if stats.current_size.load(Ordering::Relaxed) <= low {
                break;
            }
            let Some(vb) = self.get_vbucket(vbid) else {
                continue;
            };
            if vb.state() != VBucketState::Replica {
                continue;
            }
            let mut done = false;
            vb.ht.visit(|v| {
                if done {
                    return;
                }
                v.eject(stats, now);
                if stats.current_size.load(Ordering::Relaxed) <= low {
                    done = true;
                }
            });
        }
        debug!(freed, "item pager done");
    }

    /// Soft-delete expired records, queueing their deletions.
    pub fn run_expiry_pager(&self) {
        let now = self.now();
        let mut expired: Vec<(u16, String)> = Vec::new();
        for vbid in self.vbucket_ids() {
            let Some(vb) = self.get_vbucket(vbid) else {
                continue;
            };
            vb.ht.visit(|v| {
                if !v.is_deleted() && v.is_expired(now) {
                    expired.push((vbid, v.key().to_string()));
                }
            });
        }
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "expiry pager reaping");
        for (vbid, key) in expired {
            self.delete_expired(vbid, &key);
        }
    }

    pub(crate) fn delete_expired(&self, vbid: u16, key: &str) {
        let Some(vb) = self.get_vbucket(vbid) else {
            return;
        };
        let now = self.now();
        let (mut seg, bucket) = vb.ht.lock_key(key);
        // Re-check under the lock; the record may have been touched since
        // the scan.
        let Some(idx) = vb.ht.unlocked_find_index(&seg, bucket, key, false) else {
            return;
        };
        let v = vb.ht.value_at(&seg, bucket, idx);
        if !v.is_expired(now) {
            return;
        }
        self.stats().expired.fetch_add(1, Ordering::Relaxed);
        if vb.ht.unlocked_soft_delete(&mut seg, bucket, key, now)
            == crate::hashtable::MutationStatus::WasClean
        {
            drop(seg);
            self.queue_dirty(key, vbid, QueueOp::Del);
        }
    }

    /// Drop every ejectable value. Used when warmup runs out of memory.
    pub(crate) fn emergency_purge(&self) {
        warn!("emergency purge: ejecting all clean values");
        let now = self.now();
        let stats = self.stats();
        for vbid in self.vbucket_ids() {
            if let Some(vb) = self.get_vbucket(vbid) {
                vb.ht.visit(|v| {
                    v.eject(stats, now);
                });
            }
        }
    }
}
