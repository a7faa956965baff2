//! Registry actor commands, errors, and reply payloads.
//!
//! This module defines the message types for communicating with the
//! `RegistryActor`: commands carrying oneshot reply channels, the
//! registry error enum, and the read-side snapshot types handlers and
//! the connections-list builder consume.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use warren_core::{RecordId, Role, SessionId};
use warren_protocol::ServerMessage;

/// Outbound channel of one live session's connection task.
pub type SessionSender = mpsc::Sender<ServerMessage>;

// ============================================================================
// Reply payloads
// ============================================================================

/// Everything a Register transaction binds to a session.
#[derive(Debug, Clone)]
pub struct DaemonBinding {
    pub daemon_id: RecordId,
    pub user_id: RecordId,
    pub email: String,
    pub name: String,
    pub identity: String,
    pub key: String,
    pub hostname: String,
    pub version: String,
    /// LAN addresses the daemon announced for same-network shortcuts.
    pub internal_addresses: Vec<String>,
}

/// Per-name participation state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnState {
    pub role: Role,
    /// Number of punch matches completed on this name. A client with
    /// zero matches is eligible to request a punch.
    pub peer_count: u32,
}

/// Read-side copy of one session's registry entry.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub remote_addr: SocketAddr,
    pub identity: Option<String>,
    pub key: Option<String>,
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub daemon_id: Option<RecordId>,
    pub daemon_name: Option<String>,
    pub user_id: Option<RecordId>,
    pub email: Option<String>,
    pub internal_addresses: Vec<String>,
    pub connections: HashMap<String, ConnState>,
}

/// A live session reachable for pushes.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub session_id: SessionId,
    pub tx: SessionSender,
    /// The session's TCP-observed remote address, the destination for
    /// punch datagrams.
    pub remote_addr: SocketAddr,
}

/// Session displaced from a role slot by a later attach.
#[derive(Debug, Clone)]
pub struct Evicted {
    pub session_id: SessionId,
    pub daemon_id: Option<RecordId>,
}

/// One live participant on a waiting entry.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub session_id: SessionId,
    pub daemon_id: Option<RecordId>,
    pub daemon_name: Option<String>,
}

/// Live participation on one connection name.
#[derive(Debug, Clone, Default)]
pub struct WaitingSnapshot {
    pub server: Option<PeerInfo>,
    pub clients: Vec<PeerInfo>,
}

/// Liveness annotation for a daemons-list entry.
#[derive(Debug, Clone)]
pub struct Presence {
    pub hostname: Option<String>,
    pub version: Option<String>,
    pub address: String,
}

/// Request ids and reachable ends handed out when a punch pair is created.
#[derive(Debug, Clone)]
pub struct PairCreated {
    pub client_request: u64,
    pub server_request: u64,
    pub client: SessionLink,
    pub server: SessionLink,
}

/// One matched side of a completed punch pair.
#[derive(Debug, Clone)]
pub struct PairEnd {
    pub session_id: SessionId,
    pub tx: SessionSender,
    pub addr: SocketAddr,
}

/// A punch pair with both external addresses observed.
#[derive(Debug, Clone)]
pub struct MatchedPair {
    pub name: String,
    pub client: PairEnd,
    pub server: PairEnd,
}

/// Outcome of recording one side's externally observed address.
#[derive(Debug, Clone)]
pub enum PairUpdate {
    /// No pending pair knows this request id.
    NotFound,
    /// One side recorded; waiting for the other.
    Partial,
    /// Both sides observed; the pair has been removed.
    Matched(Box<MatchedPair>),
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The registry has reached its maximum session capacity.
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The identity hash is already bound with a different daemon or key.
    #[error("identity already bound to a different daemon or key")]
    IdentityMismatch,

    /// The session is not eligible to start a punch on this name.
    #[error("session is not an unmatched client on this connection")]
    PunchNotEligible,

    /// No live server is waiting on this connection name.
    #[error("no server is waiting on this connection")]
    NoWaitingServer,

    /// The response channel was closed before receiving a response.
    #[error("registry channel closed")]
    ChannelClosed,
}

// ============================================================================
// Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a freshly accepted session.
    AddClient {
        session_id: SessionId,
        tx: SessionSender,
        cancel: CancellationToken,
        remote_addr: SocketAddr,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Remove a session and cascade through every table it touched:
    /// identity set, daemon runtime (deleted if empty), waiting entries,
    /// and pending punch pairs.
    RemoveClient {
        session_id: SessionId,
        respond_to: oneshot::Sender<()>,
    },

    /// Bind a session to a daemon identity. Re-registration under a
    /// different daemon detaches the old binding first.
    RegisterDaemon {
        session_id: SessionId,
        binding: Box<DaemonBinding>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Toggle a session's participation on a connection name and keep
    /// the waiting entry in sync. Activation of an exclusive role slot
    /// returns the sessions it displaced.
    UpdateConnection {
        name: String,
        session_id: SessionId,
        role: Role,
        active: bool,
        /// Connection permits multiple simultaneous clients.
        fixed: bool,
        /// Server's announced LAN addresses (server activation only).
        internal_addresses: Vec<String>,
        respond_to: oneshot::Sender<Vec<Evicted>>,
    },

    /// Bulk detach on one name. `session_ids: None` clears everyone.
    /// Replies with the session ids actually detached.
    RemoveConnection {
        name: String,
        session_ids: Option<Vec<SessionId>>,
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// Start punch bookkeeping for an eligible client. Checked inside
    /// the actor so an interleaved attach cannot invalidate it.
    CreatePair {
        name: String,
        client_session: SessionId,
        expires_at: Instant,
        respond_to: oneshot::Sender<Result<PairCreated, RegistryError>>,
    },

    /// Record one side's externally observed address.
    UpdatePair {
        request_id: u64,
        addr: SocketAddr,
        respond_to: oneshot::Sender<PairUpdate>,
    },

    /// Drop punch pairs whose TTL elapsed. Fire-and-forget.
    SweepPairs { now: Instant },

    /// Read one session's registry entry.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionSnapshot>>,
    },

    /// Live sessions bound to a daemon.
    SessionsOfDaemon {
        daemon_id: RecordId,
        respond_to: oneshot::Sender<Vec<SessionLink>>,
    },

    /// Snapshots of every live session claiming an identity hash.
    IdentitySessions {
        identity: String,
        respond_to: oneshot::Sender<Vec<SessionSnapshot>>,
    },

    /// Liveness annotation for one daemon, if any session is bound.
    DaemonPresence {
        daemon_id: RecordId,
        respond_to: oneshot::Sender<Option<Presence>>,
    },

    /// Live participation on one connection name.
    WaitingState {
        name: String,
        respond_to: oneshot::Sender<WaitingSnapshot>,
    },

    /// Trigger the cancel token of each listed session, force-closing
    /// its transport.
    CancelSessions {
        session_ids: Vec<SessionId>,
        respond_to: oneshot::Sender<()>,
    },
}
