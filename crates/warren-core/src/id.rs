//! Identifier newtypes shared across the tracker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a persisted record (user, daemon, path, connection).
///
/// Allocated by the persistence collaborator; `0` is never a valid id.
pub type RecordId = u64;

/// Identifier of a live transport session.
///
/// Allocated by the transport layer when a socket is accepted and never
/// reused for the lifetime of the process. Distinct from a daemon id: one
/// daemon may have any number of live sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session id from a raw counter value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw counter value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}
