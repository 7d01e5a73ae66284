//! Status codes surfaced to the protocol engine layer.

use std::fmt;

/// Outcome of a cache operation as reported to the protocol front-end.
///
/// These are logical results, not errors: every mutation and lookup path
/// returns one of these rather than unwinding across component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Operation completed.
    Success,
    /// No such key.
    KeyEnoent,
    /// Key exists (CAS mismatch, or an add over a live key).
    KeyEexists,
    /// This node does not own the vbucket in the request.
    NotMyVbucket,
    /// The operation was queued; completion is signalled asynchronously.
    Ewouldblock,
    /// The memory ceiling was reached.
    Enomem,
    /// The item could not be stored.
    NotStored,
    /// Transient condition; the caller should retry later.
    Tmpfail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::KeyEnoent => "key_enoent",
            Status::KeyEexists => "key_eexists",
            Status::NotMyVbucket => "not_my_vbucket",
            Status::Ewouldblock => "ewouldblock",
            Status::Enomem => "enomem",
            Status::NotStored => "not_stored",
            Status::Tmpfail => "tmpfail",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
