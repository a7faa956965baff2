//! Warren Core - Shared types for the tunnel tracker
//!
//! This crate provides the domain model shared between the tracker daemon
//! (warrend) and the wire protocol crate:
//!
//! - `id` - session and record identifiers
//! - `grammar` - name/email/path/endpoint validation
//! - `record` - the persisted graph (users, daemons, paths, connections)
//! - `store` - the persistence collaborator trait plus an in-memory store
//! - `graph` - read-side walks over the persisted path tree
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod grammar;
pub mod graph;
pub mod id;
pub mod record;
pub mod store;

// Re-exports for convenience
pub use grammar::{
    validate_connection_name, validate_email, validate_endpoint, validate_name, validate_path,
    PathSpec,
};
pub use id::{RecordId, SessionId};
pub use record::{Assignment, ConnectionRecord, DaemonRecord, PathRecord, Role, User};
pub use store::{
    generate_confirm_code, generate_token, MemoryStore, SharedStore, Store, StoreError,
    StoreResult,
};
