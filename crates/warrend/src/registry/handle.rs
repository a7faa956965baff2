//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` is a cheap-to-clone wrapper around the actor's
//! command channel. Handlers, the transport layer, and the sweepers all
//! talk to the registry through it.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed` or a
//!   harmless default, matching what the caller can act on

use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use warren_core::{RecordId, Role, SessionId};

use super::commands::{
    DaemonBinding, Evicted, PairCreated, PairUpdate, Presence, RegistryCommand, RegistryError,
    SessionLink, SessionSender, SessionSnapshot, WaitingSnapshot,
};

/// Handle for interacting with the registry actor.
///
/// Cheap to clone; every method is async and communicates with the actor
/// over the command channel.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Registers a freshly accepted session.
    pub async fn add_client(
        &self,
        session_id: SessionId,
        tx: SessionSender,
        cancel: CancellationToken,
        remote_addr: SocketAddr,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::AddClient {
            session_id,
            tx,
            cancel,
            remote_addr,
            respond_to,
        })
        .await?
    }

    /// Removes a session, cascading through every table it touched.
    /// Waits for the cascade to complete.
    pub async fn remove_client(&self, session_id: SessionId) {
        let _ = self
            .request(|respond_to| RegistryCommand::RemoveClient {
                session_id,
                respond_to,
            })
            .await;
    }

    /// Binds a session to a daemon identity.
    pub async fn register_daemon(
        &self,
        session_id: SessionId,
        binding: DaemonBinding,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::RegisterDaemon {
            session_id,
            binding: Box::new(binding),
            respond_to,
        })
        .await?
    }

    /// Toggles a session's participation on a connection name. Returns
    /// the sessions displaced from an exclusive role slot.
    pub async fn update_connection(
        &self,
        name: String,
        session_id: SessionId,
        role: Role,
        active: bool,
        fixed: bool,
        internal_addresses: Vec<String>,
    ) -> Result<Vec<Evicted>, RegistryError> {
        self.request(|respond_to| RegistryCommand::UpdateConnection {
            name,
            session_id,
            role,
            active,
            fixed,
            internal_addresses,
            respond_to,
        })
        .await
    }

    /// Bulk detach on one name; returns the session ids actually detached.
    pub async fn remove_connection(
        &self,
        name: String,
        session_ids: Option<Vec<SessionId>>,
    ) -> Result<Vec<SessionId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::RemoveConnection {
            name,
            session_ids,
            respond_to,
        })
        .await
    }

    /// Starts punch bookkeeping for an eligible client.
    pub async fn create_pair(
        &self,
        name: String,
        client_session: SessionId,
        expires_at: Instant,
    ) -> Result<PairCreated, RegistryError> {
        self.request(|respond_to| RegistryCommand::CreatePair {
            name,
            client_session,
            expires_at,
            respond_to,
        })
        .await?
    }

    /// Records one side's externally observed address.
    pub async fn update_pair(&self, request_id: u64, addr: SocketAddr) -> PairUpdate {
        self.request(|respond_to| RegistryCommand::UpdatePair {
            request_id,
            addr,
            respond_to,
        })
        .await
        .unwrap_or(PairUpdate::NotFound)
    }

    /// Fire-and-forget expiry sweep.
    pub async fn sweep_pairs(&self, now: Instant) {
        let _ = self.sender.send(RegistryCommand::SweepPairs { now }).await;
    }

    /// Reads one session's registry entry.
    pub async fn get_session(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        self.request(|respond_to| RegistryCommand::GetSession {
            session_id,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Live sessions bound to a daemon.
    pub async fn sessions_of_daemon(&self, daemon_id: RecordId) -> Vec<SessionLink> {
        self.request(|respond_to| RegistryCommand::SessionsOfDaemon {
            daemon_id,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    /// Snapshots of every live session claiming an identity hash.
    pub async fn identity_sessions(&self, identity: String) -> Vec<SessionSnapshot> {
        self.request(|respond_to| RegistryCommand::IdentitySessions {
            identity,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    /// Liveness annotation for one daemon, if any session is bound.
    pub async fn daemon_presence(&self, daemon_id: RecordId) -> Option<Presence> {
        self.request(|respond_to| RegistryCommand::DaemonPresence {
            daemon_id,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Live participation on one connection name.
    pub async fn waiting_state(&self, name: String) -> WaitingSnapshot {
        self.request(|respond_to| RegistryCommand::WaitingState { name, respond_to })
            .await
            .unwrap_or_default()
    }

    /// Force-closes the listed sessions' transports.
    pub async fn cancel_sessions(&self, session_ids: Vec<SessionId>) {
        let _ = self
            .request(|respond_to| RegistryCommand::CancelSessions {
                session_ids,
                respond_to,
            })
            .await;
    }

    /// Returns `true` if the actor is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
