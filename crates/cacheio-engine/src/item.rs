//! Client-visible item snapshot.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Produce a process-unique CAS value.
pub fn next_cas() -> u64 {
    CAS_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A key/value pair as it crosses the engine boundary: into the store on a
/// mutation, out of it on a read, and down to the backend on a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub vbucket: u16,
    pub flags: u32,
    /// Absolute expiry deadline in clock seconds; zero means never.
    pub exptime: u32,
    pub value: Bytes,
    /// Zero means "no CAS constraint" on the way in.
    pub cas: u64,
    /// Backend row identifier; -1 when not (yet) persisted.
    pub rowid: i64,
}

impl Item {
    pub fn new(
        key: impl Into<String>,
        vbucket: u16,
        flags: u32,
        exptime: u32,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            vbucket,
            flags,
            exptime,
            value: value.into(),
            cas: 0,
            rowid: -1,
        }
    }

    /// Stamp a fresh CAS on this item.
    pub fn assign_cas(&mut self) {
        self.cas = next_cas();
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_cas_is_unique() {
        let a = next_cas();
        let b = next_cas();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_item_defaults() {
        let item = Item::new("k", 3, 7, 0, "payload");
        assert_eq!(item.cas, 0);
        assert_eq!(item.rowid, -1);
        assert_eq!(item.vbucket, 3);
        assert_eq!(&item.value[..], b"payload");
    }
}
