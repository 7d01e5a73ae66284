//! Mutation queue feeding the flusher.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The kind of mutation a queued item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Set,
    Del,
    /// Reset the entire backend store.
    Flush,
}

/// A compact description of a pending mutation to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub key: String,
    pub vbucket: u16,
    pub op: QueueOp,
    /// Clock second at which the item entered the queue.
    pub queued_at: u32,
}

impl QueuedItem {
    pub fn new(key: impl Into<String>, vbucket: u16, op: QueueOp, queued_at: u32) -> Self {
        Self {
            key: key.into(),
            vbucket,
            op,
            queued_at,
        }
    }

    /// Bookkeeping footprint, charged against `mem_overhead`.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len()
    }
}

/// Unbounded many-producer FIFO, drained wholesale by its single consumer.
#[derive(Debug, Default)]
pub struct MutationQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    len: AtomicUsize,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: QueuedItem) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.len.store(items.len(), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the entire queue contents onto the back of `out`, preserving
    /// FIFO order. The internal lock is held only for the splice.
    pub fn drain_into(&self, out: &mut VecDeque<QueuedItem>) {
        let mut items = self.items.lock();
        if out.is_empty() {
            *out = std::mem::take(&mut *items);
        } else {
            out.append(&mut items);
        }
        self.len.store(0, Ordering::Release);
    }
}
