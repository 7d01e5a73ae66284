//! The tasks that run on the dispatchers.
//!
//! One tagged variant per task kind; the dispatcher dispatches on the tag.
//! Tasks hold weak store references so a store dropped without a clean
//! shutdown does not keep itself alive through its own queues.

use crate::backend::GetValue;
use crate::dispatcher::{Job, JobOutcome};
use crate::flusher::Flusher;
use crate::pager::ITEM_PAGER_INTERVAL;
use crate::store::CacheStore;
use crate::vbucket::{Cookie, Notifier, VBucket, VBucketState};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Receiver for a vkey-stat disk lookup.
pub type LookupCallback = Arc<dyn Fn(GetValue) + Send + Sync>;

pub enum EngineTask {
    /// Drive the flusher state machine.
    Flush(Arc<Flusher>),
    /// Load an ejected value from disk and reinstall it.
    BgFetch {
        store: Weak<CacheStore>,
        key: String,
        vbucket: u16,
        rowid: i64,
        cookie: Cookie,
        init: Instant,
    },
    /// Disk lookup feeding a caller-supplied callback.
    VKeyFetch {
        store: Weak<CacheStore>,
        key: String,
        rowid: i64,
        lookup: LookupCallback,
    },
    /// Signal parked operations after a state change.
    NotifyVbStateChange {
        vb: Arc<VBucket>,
        notifier: Arc<dyn Notifier>,
    },
    /// Persist a vbucket state name to the backend.
    SetVbState {
        store: Weak<CacheStore>,
        vbucket: u16,
        state: VBucketState,
    },
    /// Drop a dead vbucket's rows from the backend.
    VBucketDeletion {
        store: Weak<CacheStore>,
        vbucket: u16,
    },
    /// Periodic ejection scan.
    ItemPager { store: Weak<CacheStore> },
    /// Periodic expiry scan.
    ExpiryPager {
        store: Weak<CacheStore>,
        interval: Duration,
    },
}

impl Job for EngineTask {
    fn run(&mut self) -> JobOutcome {
        match self {
            EngineTask::Flush(flusher) => flusher.step(),
            EngineTask::BgFetch {
                store,
                key,
                vbucket,
                rowid,
                cookie,
                init,
            } => {
                if let Some(store) = store.upgrade() {
                    let start = Instant::now();
                    store.complete_bg_fetch(key, *vbucket, *rowid, *cookie, *init, start);
                }
                JobOutcome::Done
            }
            EngineTask::VKeyFetch {
                store,
                key,
                rowid,
                lookup,
            } => {
                if let Some(store) = store.upgrade() {
                    store.complete_vkey_fetch(key, *rowid, lookup.as_ref());
                }
                JobOutcome::Done
            }
            EngineTask::NotifyVbStateChange { vb, notifier } => {
                vb.fire_all_ops(notifier.as_ref());
                JobOutcome::Done
            }
            EngineTask::SetVbState {
                store,
                vbucket,
                state,
            } => {
                if let Some(store) = store.upgrade() {
                    store.complete_set_vb_state(*vbucket, *state);
                }
                JobOutcome::Done
            }
            EngineTask::VBucketDeletion { store, vbucket } => {
                if let Some(store) = store.upgrade() {
                    store.complete_vbucket_deletion(*vbucket);
                }
                JobOutcome::Done
            }
            EngineTask::ItemPager { store } => match store.upgrade() {
                Some(store) => {
                    store.run_item_pager();
                    JobOutcome::Reschedule(ITEM_PAGER_INTERVAL)
                }
                None => JobOutcome::Done,
            },
            EngineTask::ExpiryPager { store, interval } => match store.upgrade() {
                Some(store) => {
                    store.run_expiry_pager();
                    JobOutcome::Reschedule(*interval)
                }
                None => JobOutcome::Done,
            },
        }
    }

    fn describe(&self) -> String {
        match self {
            EngineTask::Flush(_) => "running the flusher".to_string(),
            EngineTask::BgFetch { key, .. } => {
                format!("fetching item from disk: {key}")
            }
            EngineTask::VKeyFetch { key, .. } => {
                format!("fetching item from disk for vkey stat: {key}")
            }
            EngineTask::NotifyVbStateChange { vb, .. } => {
                format!("notifying state change of vbucket {}", vb.id())
            }
            EngineTask::SetVbState { vbucket, state, .. } => {
                format!("setting vbucket {vbucket} state to {state}")
            }
            EngineTask::VBucketDeletion { vbucket, .. } => {
                format!("removing vbucket {vbucket} from disk")
            }
            EngineTask::ItemPager { .. } => "paging out items".to_string(),
            EngineTask::ExpiryPager { .. } => "paging out expired items".to_string(),
        }
    }
}
