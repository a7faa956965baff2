//! The persisted graph: users, daemons, paths, and connections.
//!
//! These records are owned by the persistence collaborator (`Store`); the
//! tracker reads and mutates them through it. Invariants:
//!
//! - a path is a "connection" iff exactly one `ConnectionRecord` points at it
//! - a connection has exactly one owning path
//! - a connection carries at most one server assignment, and at most one
//!   client assignment unless it is `fixed` (multi-client)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::RecordId;

/// Role a daemon plays on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A registered account.
///
/// Created unconfirmed by the Init transaction; `confirm_code` is cleared
/// and `confirmed` set once the code is exchanged for the account token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: RecordId,
    pub email: String,
    pub token: String,
    pub confirm_code: Option<String>,
    pub confirmed: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates an unconfirmed user pending a new record id.
    pub fn unconfirmed(email: String, token: String, confirm_code: String) -> Self {
        Self {
            id: 0,
            email,
            token,
            confirm_code: Some(confirm_code),
            confirmed: false,
            created_at: Utc::now(),
        }
    }
}

/// A persisted, user-owned daemon identity.
///
/// Distinct from a live session: one daemon record may have several open
/// sessions bound to it at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRecord {
    pub id: RecordId,
    pub user_id: RecordId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl DaemonRecord {
    /// Creates a daemon record pending a new record id.
    pub fn new(user_id: RecordId, name: String) -> Self {
        Self {
            id: 0,
            user_id,
            name,
            created_at: Utc::now(),
        }
    }
}

/// A node in a user's hierarchical namespace.
///
/// `name` is a single segment; the full name is reconstructed by walking
/// the `parent_id` chain. Paths are unique per (user, parent, name). Every
/// path carries a redeemable token granting the client role anywhere in its
/// subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    pub id: RecordId,
    pub user_id: RecordId,
    pub parent_id: Option<RecordId>,
    pub name: String,
    pub token: String,
}

impl PathRecord {
    pub fn new(user_id: RecordId, parent_id: Option<RecordId>, name: String, token: String) -> Self {
        Self {
            id: 0,
            user_id,
            parent_id,
            name,
            token,
        }
    }
}

/// One daemon's role assignment on a connection.
///
/// `address`/`port` record the endpoint the daemon announced when it
/// attached (empty when it relied on the connection's static endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub daemon_id: RecordId,
    pub role: Role,
    pub address: String,
    pub port: String,
}

/// The terminal, attachable object of a path.
///
/// Carries the server-granting token, the optional static endpoint, and the
/// current role assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: RecordId,
    pub path_id: RecordId,
    pub token: String,
    pub fixed: bool,
    pub connect_address: String,
    pub connect_port: String,
    pub assignments: Vec<Assignment>,
}

impl ConnectionRecord {
    pub fn new(
        path_id: RecordId,
        token: String,
        fixed: bool,
        connect_address: String,
        connect_port: String,
    ) -> Self {
        Self {
            id: 0,
            path_id,
            token,
            fixed,
            connect_address,
            connect_port,
            assignments: Vec::new(),
        }
    }

    /// Returns the current server assignment, if any.
    pub fn server(&self) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.role == Role::Server)
    }

    /// Returns all client assignments.
    pub fn clients(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.iter().filter(|a| a.role == Role::Client)
    }

    /// Returns the assignment held by `daemon_id` in `role`, if any.
    pub fn assignment(&self, daemon_id: RecordId, role: Role) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|a| a.daemon_id == daemon_id && a.role == role)
    }

    /// Removes every assignment held by `daemon_id` in `role`.
    ///
    /// Returns true when something was removed.
    pub fn unassign(&mut self, daemon_id: RecordId, role: Role) -> bool {
        let before = self.assignments.len();
        self.assignments
            .retain(|a| !(a.daemon_id == daemon_id && a.role == role));
        self.assignments.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionRecord {
        ConnectionRecord::new(1, "tok".into(), false, String::new(), String::new())
    }

    #[test]
    fn test_assignment_roundtrip() {
        let mut conn = connection();
        conn.assignments.push(Assignment {
            daemon_id: 7,
            role: Role::Server,
            address: "10.0.0.5".into(),
            port: "5432".into(),
        });

        assert!(conn.server().is_some());
        assert!(conn.assignment(7, Role::Server).is_some());
        assert!(conn.assignment(7, Role::Client).is_none());
        assert_eq!(conn.clients().count(), 0);

        assert!(conn.unassign(7, Role::Server));
        assert!(conn.server().is_none());
        assert!(!conn.unassign(7, Role::Server));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Server.to_string(), "server");
        assert_eq!(Role::Client.to_string(), "client");
    }

    #[test]
    fn test_user_unconfirmed() {
        let user = User::unconfirmed("a@b".into(), "t".into(), "c".into());
        assert!(!user.confirmed);
        assert_eq!(user.confirm_code.as_deref(), Some("c"));
        assert_eq!(user.id, 0);
    }
}
