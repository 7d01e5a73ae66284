//! Eventually-persistent vbucket cache core.
//!
//! The keyspace is partitioned into vbuckets, each backed by a sharded
//! in-memory hash table. Mutations are acknowledged from memory and queued
//! for a background flusher that writes them to a durable backend in
//! batched transactions; reads of ejected values are completed through
//! asynchronous background fetches. Two priority dispatchers drive all
//! background work.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  protocol layer  │  (external)
//! └────────┬─────────┘
//!          │ get/set/add/del
//! ┌────────▼─────────┐     ┌─────────────────┐
//! │    CacheStore    │────▶│ towrite/writing │
//! │  VBucketMap      │     └────────┬────────┘
//! │  HashTables      │              │ flusher (I/O dispatcher)
//! └────────┬─────────┘     ┌────────▼────────┐
//!          │ bg fetch      │    KvBackend    │
//!          └──────────────▶│  (durable log)  │
//!                          └─────────────────┘
//! ```

pub mod backend;
pub mod dispatcher;
pub mod flusher;
pub mod hashtable;
pub mod item;
mod pager;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod vbucket;

pub use backend::{BackendError, FileBackend, GetValue, KvBackend, MemoryBackend};
pub use dispatcher::{Dispatcher, Job, JobOutcome, Priority, TaskId};
pub use flusher::{Flusher, FlusherState};
pub use hashtable::{AddStatus, HashTable, MutationStatus, StoredValue};
pub use item::Item;
pub use queue::{MutationQueue, QueueOp, QueuedItem};
pub use store::CacheStore;
pub use vbucket::{Cookie, Notifier, VBucket, VBucketMap, VBucketState};
