//! Persistence collaborator for the tracker.
//!
//! The tracker never talks to a database directly; every handler goes
//! through the [`Store`] trait. Deployments back it with a relational
//! store; tests and standalone runs use [`MemoryStore`].
//!
//! Save semantics: a record with `id == 0` is inserted under a freshly
//! allocated id (returned); any other id updates the existing record.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::id::RecordId;
use crate::record::{ConnectionRecord, DaemonRecord, PathRecord, User};

/// Errors surfaced by the persistence collaborator.
///
/// Handlers treat any of these as infrastructure failures: logged with the
/// causal chain, request left unanswered.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Update of a record that does not exist.
    #[error("record not found: {kind} id {id}")]
    NotFound { kind: &'static str, id: RecordId },

    /// Backend failure (connection lost, constraint violation, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Generates an opaque credential token (32 hex chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generates a short email-friendly confirm code (8 hex chars).
pub fn generate_confirm_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The persistence collaborator.
///
/// Finders return `Ok(None)` / empty vectors for absent records; errors are
/// reserved for backend failures. `paths_by_parent` returns children sorted
/// by name, which fixes the traversal order of every subtree walk.
#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn user_by_id(&self, id: RecordId) -> StoreResult<Option<User>>;
    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn user_by_token(&self, token: &str) -> StoreResult<Option<User>>;
    async fn save_user(&self, user: User) -> StoreResult<RecordId>;
    async fn delete_user(&self, id: RecordId) -> StoreResult<()>;

    // Daemons
    async fn daemon_by_id(&self, id: RecordId) -> StoreResult<Option<DaemonRecord>>;
    async fn daemon_by_user_and_name(
        &self,
        user_id: RecordId,
        name: &str,
    ) -> StoreResult<Option<DaemonRecord>>;
    async fn daemons_by_user(&self, user_id: RecordId) -> StoreResult<Vec<DaemonRecord>>;
    async fn save_daemon(&self, daemon: DaemonRecord) -> StoreResult<RecordId>;
    async fn delete_daemon(&self, id: RecordId) -> StoreResult<()>;

    // Paths
    async fn path_by_id(&self, id: RecordId) -> StoreResult<Option<PathRecord>>;
    async fn path_by_token(&self, token: &str) -> StoreResult<Option<PathRecord>>;
    /// Children of `parent_id` (`None` = roots) for one user, sorted by name.
    async fn paths_by_parent(
        &self,
        user_id: RecordId,
        parent_id: Option<RecordId>,
    ) -> StoreResult<Vec<PathRecord>>;
    async fn save_path(&self, path: PathRecord) -> StoreResult<RecordId>;
    async fn delete_path(&self, id: RecordId) -> StoreResult<()>;

    // Connections
    async fn connection_by_path(&self, path_id: RecordId) -> StoreResult<Option<ConnectionRecord>>;
    async fn connection_by_token(&self, token: &str) -> StoreResult<Option<ConnectionRecord>>;
    /// Every connection holding an assignment for `daemon_id`.
    async fn connections_with_daemon(
        &self,
        daemon_id: RecordId,
    ) -> StoreResult<Vec<ConnectionRecord>>;
    async fn save_connection(&self, connection: ConnectionRecord) -> StoreResult<RecordId>;
    async fn delete_connection(&self, id: RecordId) -> StoreResult<()>;
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn Store>;

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct Tables {
    next_id: RecordId,
    users: HashMap<RecordId, User>,
    daemons: HashMap<RecordId, DaemonRecord>,
    paths: HashMap<RecordId, PathRecord>,
    connections: HashMap<RecordId, ConnectionRecord>,
}

impl Tables {
    fn allocate(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory `Store` backed by hash maps.
///
/// Used by the test suite and by standalone deployments that do not need
/// durability.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning a shared trait object.
    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_by_id(&self, id: RecordId) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn user_by_token(&self, token: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.token == token).cloned())
    }

    async fn save_user(&self, mut user: User) -> StoreResult<RecordId> {
        let mut tables = self.tables.write().await;
        if user.id == 0 {
            user.id = tables.allocate();
        } else if !tables.users.contains_key(&user.id) {
            return Err(StoreError::NotFound {
                kind: "user",
                id: user.id,
            });
        }
        let id = user.id;
        tables.users.insert(id, user);
        Ok(id)
    }

    async fn delete_user(&self, id: RecordId) -> StoreResult<()> {
        self.tables.write().await.users.remove(&id);
        Ok(())
    }

    async fn daemon_by_id(&self, id: RecordId) -> StoreResult<Option<DaemonRecord>> {
        Ok(self.tables.read().await.daemons.get(&id).cloned())
    }

    async fn daemon_by_user_and_name(
        &self,
        user_id: RecordId,
        name: &str,
    ) -> StoreResult<Option<DaemonRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .daemons
            .values()
            .find(|d| d.user_id == user_id && d.name == name)
            .cloned())
    }

    async fn daemons_by_user(&self, user_id: RecordId) -> StoreResult<Vec<DaemonRecord>> {
        let tables = self.tables.read().await;
        let mut daemons: Vec<DaemonRecord> = tables
            .daemons
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        daemons.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(daemons)
    }

    async fn save_daemon(&self, mut daemon: DaemonRecord) -> StoreResult<RecordId> {
        let mut tables = self.tables.write().await;
        if daemon.id == 0 {
            daemon.id = tables.allocate();
        } else if !tables.daemons.contains_key(&daemon.id) {
            return Err(StoreError::NotFound {
                kind: "daemon",
                id: daemon.id,
            });
        }
        let id = daemon.id;
        tables.daemons.insert(id, daemon);
        Ok(id)
    }

    async fn delete_daemon(&self, id: RecordId) -> StoreResult<()> {
        self.tables.write().await.daemons.remove(&id);
        Ok(())
    }

    async fn path_by_id(&self, id: RecordId) -> StoreResult<Option<PathRecord>> {
        Ok(self.tables.read().await.paths.get(&id).cloned())
    }

    async fn path_by_token(&self, token: &str) -> StoreResult<Option<PathRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.paths.values().find(|p| p.token == token).cloned())
    }

    async fn paths_by_parent(
        &self,
        user_id: RecordId,
        parent_id: Option<RecordId>,
    ) -> StoreResult<Vec<PathRecord>> {
        let tables = self.tables.read().await;
        let mut children: Vec<PathRecord> = tables
            .paths
            .values()
            .filter(|p| p.user_id == user_id && p.parent_id == parent_id)
            .cloned()
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn save_path(&self, mut path: PathRecord) -> StoreResult<RecordId> {
        let mut tables = self.tables.write().await;
        if path.id == 0 {
            path.id = tables.allocate();
        } else if !tables.paths.contains_key(&path.id) {
            return Err(StoreError::NotFound {
                kind: "path",
                id: path.id,
            });
        }
        let id = path.id;
        tables.paths.insert(id, path);
        Ok(id)
    }

    async fn delete_path(&self, id: RecordId) -> StoreResult<()> {
        self.tables.write().await.paths.remove(&id);
        Ok(())
    }

    async fn connection_by_path(&self, path_id: RecordId) -> StoreResult<Option<ConnectionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .connections
            .values()
            .find(|c| c.path_id == path_id)
            .cloned())
    }

    async fn connection_by_token(&self, token: &str) -> StoreResult<Option<ConnectionRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .connections
            .values()
            .find(|c| c.token == token)
            .cloned())
    }

    async fn connections_with_daemon(
        &self,
        daemon_id: RecordId,
    ) -> StoreResult<Vec<ConnectionRecord>> {
        let tables = self.tables.read().await;
        let mut conns: Vec<ConnectionRecord> = tables
            .connections
            .values()
            .filter(|c| c.assignments.iter().any(|a| a.daemon_id == daemon_id))
            .cloned()
            .collect();
        conns.sort_by_key(|c| c.id);
        Ok(conns)
    }

    async fn save_connection(&self, mut connection: ConnectionRecord) -> StoreResult<RecordId> {
        let mut tables = self.tables.write().await;
        if connection.id == 0 {
            connection.id = tables.allocate();
        } else if !tables.connections.contains_key(&connection.id) {
            return Err(StoreError::NotFound {
                kind: "connection",
                id: connection.id,
            });
        }
        let id = connection.id;
        tables.connections.insert(id, connection);
        Ok(id)
    }

    async fn delete_connection(&self, id: RecordId) -> StoreResult<()> {
        self.tables.write().await.connections.remove(&id);
        Ok(())
    }
}
