//! Registry actor - owns all live tracker state and processes commands.
//!
//! The actor is the single owner of session, daemon-runtime, identity,
//! waiting, and punch-pair state. It receives commands via an mpsc
//! channel and processes them sequentially: every mutation is
//! synchronous and I/O-free, so no command can observe a half-applied
//! cascade.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_core::{RecordId, Role, SessionId};

use super::commands::{
    ConnState, DaemonBinding, Evicted, MatchedPair, PairCreated, PairEnd, PairUpdate, PeerInfo,
    Presence, RegistryCommand, RegistryError, SessionLink, SessionSender, SessionSnapshot,
    WaitingSnapshot,
};

// ============================================================================
// Internal state
// ============================================================================

/// One live session's registry entry.
struct SessionEntry {
    tx: SessionSender,
    cancel: CancellationToken,
    remote_addr: SocketAddr,
    identity: Option<String>,
    key: Option<String>,
    hostname: Option<String>,
    version: Option<String>,
    daemon_id: Option<RecordId>,
    internal_addresses: Vec<String>,
    /// connection name → participation state
    connections: HashMap<String, ConnState>,
}

/// Runtime record of a daemon with at least one live session.
struct DaemonRuntime {
    name: String,
    user_id: RecordId,
    email: String,
    sessions: HashSet<SessionId>,
}

/// Readiness on one connection name.
#[derive(Default)]
struct WaitingEntry {
    /// Server session plus its announced LAN addresses.
    server: Option<(SessionId, Vec<String>)>,
    clients: HashSet<SessionId>,
}

impl WaitingEntry {
    fn is_empty(&self) -> bool {
        self.server.is_none() && self.clients.is_empty()
    }
}

/// Short-lived NAT pairing record.
struct PunchPair {
    name: String,
    client_session: SessionId,
    server_session: SessionId,
    client_request: u64,
    server_request: u64,
    client_addr: Option<SocketAddr>,
    server_addr: Option<SocketAddr>,
    expires_at: Instant,
}

// ============================================================================
// Registry actor
// ============================================================================

/// The registry actor - owns all live tracker state.
///
/// Implements the actor pattern: receives commands via mpsc channel and
/// processes them sequentially in a single task. Registry state is a
/// derived cache over the persisted graph plus open sessions; no entry
/// may outlive every session that justifies it, which is why
/// `handle_remove_client` performs the entire cascade in one method.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    max_sessions: usize,

    sessions: HashMap<SessionId, SessionEntry>,
    daemons: HashMap<RecordId, DaemonRuntime>,
    /// identity hash → sessions claiming it
    identities: HashMap<String, HashSet<SessionId>>,
    /// connection name → readiness entry
    waiting: HashMap<String, WaitingEntry>,
    /// pair id → punch pair
    pairs: HashMap<u64, PunchPair>,
    /// request id → pair id, both directions of every pair
    request_index: HashMap<u64, u64>,

    next_pair_id: u64,
    next_request_id: u64,
}

impl RegistryActor {
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>, max_sessions: usize) -> Self {
        Self {
            receiver,
            max_sessions,
            sessions: HashMap::new(),
            daemons: HashMap::new(),
            identities: HashMap::new(),
            waiting: HashMap::new(),
            pairs: HashMap::new(),
            request_index: HashMap::new(),
            next_pair_id: 1,
            next_request_id: 1,
        }
    }

    /// Runs the actor event loop until the channel closes.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::AddClient {
                session_id,
                tx,
                cancel,
                remote_addr,
                respond_to,
            } => {
                let result = self.handle_add_client(session_id, tx, cancel, remote_addr);
                let _ = respond_to.send(result);
            }
            RegistryCommand::RemoveClient {
                session_id,
                respond_to,
            } => {
                self.handle_remove_client(session_id);
                let _ = respond_to.send(());
            }
            RegistryCommand::RegisterDaemon {
                session_id,
                binding,
                respond_to,
            } => {
                let result = self.handle_register_daemon(session_id, *binding);
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdateConnection {
                name,
                session_id,
                role,
                active,
                fixed,
                internal_addresses,
                respond_to,
            } => {
                let evicted = self.handle_update_connection(
                    &name,
                    session_id,
                    role,
                    active,
                    fixed,
                    internal_addresses,
                );
                let _ = respond_to.send(evicted);
            }
            RegistryCommand::RemoveConnection {
                name,
                session_ids,
                respond_to,
            } => {
                let affected = self.handle_remove_connection(&name, session_ids);
                let _ = respond_to.send(affected);
            }
            RegistryCommand::CreatePair {
                name,
                client_session,
                expires_at,
                respond_to,
            } => {
                let result = self.handle_create_pair(&name, client_session, expires_at);
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdatePair {
                request_id,
                addr,
                respond_to,
            } => {
                let result = self.handle_update_pair(request_id, addr);
                let _ = respond_to.send(result);
            }
            RegistryCommand::SweepPairs { now } => {
                self.handle_sweep_pairs(now);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.snapshot(session_id));
            }
            RegistryCommand::SessionsOfDaemon {
                daemon_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions_of_daemon(daemon_id));
            }
            RegistryCommand::IdentitySessions {
                identity,
                respond_to,
            } => {
                let snapshots = self
                    .identities
                    .get(&identity)
                    .map(|ids| ids.iter().filter_map(|id| self.snapshot(*id)).collect())
                    .unwrap_or_default();
                let _ = respond_to.send(snapshots);
            }
            RegistryCommand::DaemonPresence {
                daemon_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.daemon_presence(daemon_id));
            }
            RegistryCommand::WaitingState { name, respond_to } => {
                let _ = respond_to.send(self.waiting_snapshot(&name));
            }
            RegistryCommand::CancelSessions {
                session_ids,
                respond_to,
            } => {
                for id in session_ids {
                    if let Some(entry) = self.sessions.get(&id) {
                        entry.cancel.cancel();
                    }
                }
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn handle_add_client(
        &mut self,
        session_id: SessionId,
        tx: SessionSender,
        cancel: CancellationToken,
        remote_addr: SocketAddr,
    ) -> Result<(), RegistryError> {
        if self.sessions.len() >= self.max_sessions {
            warn!(
                session_id = %session_id,
                current = self.sessions.len(),
                max = self.max_sessions,
                "Registry is full, rejecting session"
            );
            return Err(RegistryError::RegistryFull {
                max: self.max_sessions,
            });
        }

        self.sessions.insert(
            session_id,
            SessionEntry {
                tx,
                cancel,
                remote_addr,
                identity: None,
                key: None,
                hostname: None,
                version: None,
                daemon_id: None,
                internal_addresses: Vec::new(),
                connections: HashMap::new(),
            },
        );

        info!(
            session_id = %session_id,
            remote_addr = %remote_addr,
            total_sessions = self.sessions.len(),
            "Session added"
        );
        Ok(())
    }

    /// The one cascade that must be atomic and total: removing a session
    /// unwinds every table it touched so nothing orphaned remains.
    fn handle_remove_client(&mut self, session_id: SessionId) {
        let entry = match self.sessions.remove(&session_id) {
            Some(e) => e,
            None => {
                debug!(session_id = %session_id, "Remove for unknown session, ignoring");
                return;
            }
        };

        // Identity set
        if let Some(identity) = &entry.identity {
            if let Some(set) = self.identities.get_mut(identity) {
                set.remove(&session_id);
                if set.is_empty() {
                    self.identities.remove(identity);
                }
            }
        }

        // Daemon runtime, deleted when its session set empties
        if let Some(daemon_id) = entry.daemon_id {
            if let Some(runtime) = self.daemons.get_mut(&daemon_id) {
                runtime.sessions.remove(&session_id);
                if runtime.sessions.is_empty() {
                    self.daemons.remove(&daemon_id);
                    debug!(daemon_id, "Daemon runtime removed (no sessions left)");
                }
            }
        }

        // Every waiting entry the session touched
        for name in entry.connections.keys() {
            if let Some(waiting) = self.waiting.get_mut(name) {
                if waiting
                    .server
                    .as_ref()
                    .is_some_and(|(sid, _)| *sid == session_id)
                {
                    waiting.server = None;
                }
                waiting.clients.remove(&session_id);
                if waiting.is_empty() {
                    self.waiting.remove(name);
                }
            }
        }

        // Pending punch pairs involving the session
        let stale: Vec<u64> = self
            .pairs
            .iter()
            .filter(|(_, p)| p.client_session == session_id || p.server_session == session_id)
            .map(|(id, _)| *id)
            .collect();
        for pair_id in stale {
            self.drop_pair(pair_id);
        }

        info!(
            session_id = %session_id,
            remaining_sessions = self.sessions.len(),
            "Session removed"
        );
    }

    // ========================================================================
    // Daemon binding
    // ========================================================================

    fn handle_register_daemon(
        &mut self,
        session_id: SessionId,
        binding: DaemonBinding,
    ) -> Result<(), RegistryError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(RegistryError::SessionNotFound(session_id));
        }

        // Impersonation guard: every live session already claiming this
        // identity must agree on daemon and key.
        if let Some(claimants) = self.identities.get(&binding.identity) {
            for other_id in claimants {
                if *other_id == session_id {
                    continue;
                }
                if let Some(other) = self.sessions.get(other_id) {
                    let daemon_ok = other.daemon_id == Some(binding.daemon_id);
                    let key_ok = other.key.as_deref() == Some(binding.key.as_str());
                    if !daemon_ok || !key_ok {
                        warn!(
                            session_id = %session_id,
                            identity = %binding.identity,
                            "Identity claim disagrees with an existing bound session"
                        );
                        return Err(RegistryError::IdentityMismatch);
                    }
                }
            }
        }

        // Re-registration under a different daemon detaches the old binding.
        self.detach_binding(session_id);

        let entry = match self.sessions.get_mut(&session_id) {
            Some(e) => e,
            None => return Err(RegistryError::SessionNotFound(session_id)),
        };
        entry.identity = Some(binding.identity.clone());
        entry.key = Some(binding.key);
        entry.hostname = Some(binding.hostname);
        entry.version = Some(binding.version);
        entry.daemon_id = Some(binding.daemon_id);
        entry.internal_addresses = binding.internal_addresses;

        self.identities
            .entry(binding.identity)
            .or_default()
            .insert(session_id);

        let runtime = self
            .daemons
            .entry(binding.daemon_id)
            .or_insert_with(|| DaemonRuntime {
                name: binding.name.clone(),
                user_id: binding.user_id,
                email: binding.email.clone(),
                sessions: HashSet::new(),
            });
        runtime.name = binding.name;
        runtime.sessions.insert(session_id);

        info!(
            session_id = %session_id,
            daemon_id = binding.daemon_id,
            "Session bound to daemon"
        );
        Ok(())
    }

    /// Removes a session's current daemon/identity binding, if any.
    fn detach_binding(&mut self, session_id: SessionId) {
        let (old_identity, old_daemon) = match self.sessions.get_mut(&session_id) {
            Some(entry) => (entry.identity.take(), entry.daemon_id.take()),
            None => return,
        };

        if let Some(identity) = old_identity {
            if let Some(set) = self.identities.get_mut(&identity) {
                set.remove(&session_id);
                if set.is_empty() {
                    self.identities.remove(&identity);
                }
            }
        }
        if let Some(daemon_id) = old_daemon {
            if let Some(runtime) = self.daemons.get_mut(&daemon_id) {
                runtime.sessions.remove(&session_id);
                if runtime.sessions.is_empty() {
                    self.daemons.remove(&daemon_id);
                }
            }
        }
    }

    // ========================================================================
    // Connection participation
    // ========================================================================

    fn handle_update_connection(
        &mut self,
        name: &str,
        session_id: SessionId,
        role: Role,
        active: bool,
        fixed: bool,
        internal_addresses: Vec<String>,
    ) -> Vec<Evicted> {
        if !active {
            self.deactivate(name, session_id);
            return Vec::new();
        }

        if !self.sessions.contains_key(&session_id) {
            debug!(session_id = %session_id, name, "Update for unknown session, ignoring");
            return Vec::new();
        }

        // The client slot is held per daemon, not per session: sibling
        // sessions of the same daemon (remote attach activates all of
        // them) share it, and only a different daemon displaces.
        let caller_daemon = self.sessions.get(&session_id).and_then(|e| e.daemon_id);
        let mut evicted_ids: Vec<SessionId> = Vec::new();
        if role == Role::Client && !fixed {
            if let Some(entry) = self.waiting.get(name) {
                evicted_ids.extend(entry.clients.iter().copied().filter(|sid| {
                    *sid != session_id
                        && (caller_daemon.is_none()
                            || self.sessions.get(sid).and_then(|e| e.daemon_id) != caller_daemon)
                }));
            }
        }

        {
            let entry = self.waiting.entry(name.to_string()).or_default();

            match role {
                Role::Server => {
                    // "At most one live server" is enforced here, inside the
                    // actor, so interleaved handlers cannot both win the slot.
                    if let Some((old, _)) = &entry.server {
                        if *old != session_id {
                            evicted_ids.push(*old);
                        }
                    }
                    entry.server = Some((session_id, internal_addresses));
                    entry.clients.remove(&session_id);
                }
                Role::Client => {
                    for sid in &evicted_ids {
                        entry.clients.remove(sid);
                    }
                    if entry
                        .server
                        .as_ref()
                        .is_some_and(|(sid, _)| *sid == session_id)
                    {
                        entry.server = None;
                    }
                    entry.clients.insert(session_id);
                }
            }
        }

        // Clear evicted sessions' own participation records.
        let mut evicted = Vec::with_capacity(evicted_ids.len());
        for old in evicted_ids {
            let daemon_id = self.sessions.get_mut(&old).and_then(|e| {
                e.connections.remove(name);
                e.daemon_id
            });
            debug!(session_id = %old, name, "Session evicted from role slot");
            evicted.push(Evicted {
                session_id: old,
                daemon_id,
            });
        }

        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.connections.insert(
                name.to_string(),
                ConnState {
                    role,
                    peer_count: 0,
                },
            );
        }

        debug!(session_id = %session_id, name, role = %role, "Connection activated");
        evicted
    }

    fn deactivate(&mut self, name: &str, session_id: SessionId) {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            entry.connections.remove(name);
        }
        if let Some(waiting) = self.waiting.get_mut(name) {
            if waiting
                .server
                .as_ref()
                .is_some_and(|(sid, _)| *sid == session_id)
            {
                waiting.server = None;
            }
            waiting.clients.remove(&session_id);
            if waiting.is_empty() {
                self.waiting.remove(name);
            }
        }
        debug!(session_id = %session_id, name, "Connection deactivated");
    }

    fn handle_remove_connection(
        &mut self,
        name: &str,
        session_ids: Option<Vec<SessionId>>,
    ) -> Vec<SessionId> {
        let targets: Vec<SessionId> = match session_ids {
            Some(ids) => ids,
            None => self
                .waiting
                .get(name)
                .map(|w| {
                    let mut all: Vec<SessionId> = w.clients.iter().copied().collect();
                    if let Some((sid, _)) = &w.server {
                        all.push(*sid);
                    }
                    all
                })
                .unwrap_or_default(),
        };

        let mut affected = Vec::new();
        for sid in targets {
            let was_active = self
                .sessions
                .get(&sid)
                .is_some_and(|e| e.connections.contains_key(name));
            if was_active {
                self.deactivate(name, sid);
                affected.push(sid);
            }
        }
        affected
    }

    // ========================================================================
    // Punch pairs
    // ========================================================================

    fn handle_create_pair(
        &mut self,
        name: &str,
        client_session: SessionId,
        expires_at: Instant,
    ) -> Result<PairCreated, RegistryError> {
        // Eligibility is re-validated here: the caller must still be an
        // unmatched client, and a server must still be waiting.
        let eligible = self
            .sessions
            .get(&client_session)
            .and_then(|e| e.connections.get(name))
            .is_some_and(|c| c.role == Role::Client && c.peer_count == 0);
        if !eligible {
            return Err(RegistryError::PunchNotEligible);
        }

        let server_session = match self.waiting.get(name).and_then(|w| w.server.as_ref()) {
            Some((sid, _)) => *sid,
            None => return Err(RegistryError::NoWaitingServer),
        };

        let client_link = self.link(client_session)?;
        let server_link = self.link(server_session)?;

        let pair_id = self.next_pair_id;
        self.next_pair_id += 1;
        let client_request = self.next_request_id;
        let server_request = self.next_request_id + 1;
        self.next_request_id += 2;

        self.pairs.insert(
            pair_id,
            PunchPair {
                name: name.to_string(),
                client_session,
                server_session,
                client_request,
                server_request,
                client_addr: None,
                server_addr: None,
                expires_at,
            },
        );
        self.request_index.insert(client_request, pair_id);
        self.request_index.insert(server_request, pair_id);

        debug!(
            name,
            client = %client_session,
            server = %server_session,
            "Punch pair created"
        );

        Ok(PairCreated {
            client_request,
            server_request,
            client: client_link,
            server: server_link,
        })
    }

    fn handle_update_pair(&mut self, request_id: u64, addr: SocketAddr) -> PairUpdate {
        let pair_id = match self.request_index.get(&request_id) {
            Some(id) => *id,
            None => return PairUpdate::NotFound,
        };
        let pair = match self.pairs.get_mut(&pair_id) {
            Some(p) => p,
            None => return PairUpdate::NotFound,
        };

        if request_id == pair.client_request {
            pair.client_addr = Some(addr);
        } else {
            pair.server_addr = Some(addr);
        }

        let (client_addr, server_addr) = match (pair.client_addr, pair.server_addr) {
            (Some(c), Some(s)) => (c, s),
            _ => return PairUpdate::Partial,
        };

        // Both sides observed: take the pair down and mark both sessions
        // matched on the name.
        let name = pair.name.clone();
        let client_session = pair.client_session;
        let server_session = pair.server_session;
        self.drop_pair(pair_id);

        for sid in [client_session, server_session] {
            if let Some(conn) = self
                .sessions
                .get_mut(&sid)
                .and_then(|e| e.connections.get_mut(&name))
            {
                conn.peer_count += 1;
            }
        }

        let client = match self.link(client_session) {
            Ok(l) => l,
            Err(_) => return PairUpdate::NotFound,
        };
        let server = match self.link(server_session) {
            Ok(l) => l,
            Err(_) => return PairUpdate::NotFound,
        };

        debug!(name = %name, "Punch pair matched");

        PairUpdate::Matched(Box::new(MatchedPair {
            name,
            client: PairEnd {
                session_id: client.session_id,
                tx: client.tx,
                addr: client_addr,
            },
            server: PairEnd {
                session_id: server.session_id,
                tx: server.tx,
                addr: server_addr,
            },
        }))
    }

    fn handle_sweep_pairs(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .pairs
            .iter()
            .filter(|(_, p)| p.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for pair_id in expired {
            if let Some(pair) = self.pairs.get(&pair_id) {
                debug!(name = %pair.name, "Punch pair expired");
            }
            self.drop_pair(pair_id);
        }
    }

    fn drop_pair(&mut self, pair_id: u64) {
        if let Some(pair) = self.pairs.remove(&pair_id) {
            self.request_index.remove(&pair.client_request);
            self.request_index.remove(&pair.server_request);
        }
    }

    // ========================================================================
    // Read queries
    // ========================================================================

    fn link(&self, session_id: SessionId) -> Result<SessionLink, RegistryError> {
        self.sessions
            .get(&session_id)
            .map(|e| SessionLink {
                session_id,
                tx: e.tx.clone(),
                remote_addr: e.remote_addr,
            })
            .ok_or(RegistryError::SessionNotFound(session_id))
    }

    fn snapshot(&self, session_id: SessionId) -> Option<SessionSnapshot> {
        let entry = self.sessions.get(&session_id)?;
        let runtime = entry.daemon_id.and_then(|id| self.daemons.get(&id));
        Some(SessionSnapshot {
            session_id,
            remote_addr: entry.remote_addr,
            identity: entry.identity.clone(),
            key: entry.key.clone(),
            hostname: entry.hostname.clone(),
            version: entry.version.clone(),
            daemon_id: entry.daemon_id,
            daemon_name: runtime.map(|r| r.name.clone()),
            user_id: runtime.map(|r| r.user_id),
            email: runtime.map(|r| r.email.clone()),
            internal_addresses: entry.internal_addresses.clone(),
            connections: entry.connections.clone(),
        })
    }

    fn sessions_of_daemon(&self, daemon_id: RecordId) -> Vec<SessionLink> {
        self.daemons
            .get(&daemon_id)
            .map(|runtime| {
                runtime
                    .sessions
                    .iter()
                    .filter_map(|sid| self.link(*sid).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn daemon_presence(&self, daemon_id: RecordId) -> Option<Presence> {
        let runtime = self.daemons.get(&daemon_id)?;
        let entry = runtime
            .sessions
            .iter()
            .find_map(|sid| self.sessions.get(sid))?;
        Some(Presence {
            hostname: entry.hostname.clone(),
            version: entry.version.clone(),
            address: entry.remote_addr.ip().to_string(),
        })
    }

    fn waiting_snapshot(&self, name: &str) -> WaitingSnapshot {
        let entry = match self.waiting.get(name) {
            Some(e) => e,
            None => return WaitingSnapshot::default(),
        };

        let peer = |sid: SessionId| -> PeerInfo {
            let entry = self.sessions.get(&sid);
            let daemon_id = entry.and_then(|e| e.daemon_id);
            PeerInfo {
                session_id: sid,
                daemon_id,
                daemon_name: daemon_id
                    .and_then(|id| self.daemons.get(&id))
                    .map(|r| r.name.clone()),
            }
        };

        WaitingSnapshot {
            server: entry.server.as_ref().map(|(sid, _)| peer(*sid)),
            clients: entry.clients.iter().map(|sid| peer(*sid)).collect(),
        }
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    fn table_sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.daemons.len(),
            self.identities.len(),
            self.waiting.len(),
            self.pairs.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use warren_protocol::ServerMessage;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn create_actor() -> RegistryActor {
        let (_tx, rx) = mpsc::channel(16);
        RegistryActor::new(rx, 100)
    }

    fn add_session(actor: &mut RegistryActor, raw: u64) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(16);
        let (respond, _) = oneshot::channel();
        actor.handle_command(RegistryCommand::AddClient {
            session_id: SessionId::new(raw),
            tx,
            cancel: CancellationToken::new(),
            remote_addr: test_addr(40000 + raw as u16),
            respond_to: respond,
        });
        rx
    }

    fn binding(daemon_id: RecordId, name: &str) -> Box<DaemonBinding> {
        Box::new(DaemonBinding {
            daemon_id,
            user_id: 1,
            email: "alice@example.com".into(),
            name: name.into(),
            identity: format!("id-{daemon_id}"),
            key: format!("key-{daemon_id}"),
            hostname: "host".into(),
            version: "1.0".into(),
            internal_addresses: Vec::new(),
        })
    }

    fn bind(actor: &mut RegistryActor, raw: u64, daemon_id: RecordId, name: &str) {
        let (respond, _) = oneshot::channel();
        actor.handle_command(RegistryCommand::RegisterDaemon {
            session_id: SessionId::new(raw),
            binding: binding(daemon_id, name),
            respond_to: respond,
        });
    }

    fn activate(actor: &mut RegistryActor, raw: u64, name: &str, role: Role, fixed: bool) -> Vec<Evicted> {
        actor.handle_update_connection(
            name,
            SessionId::new(raw),
            role,
            true,
            fixed,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_remove_client_leaves_no_residual_entries() {
        let mut actor = create_actor();
        let _rx = add_session(&mut actor, 1);
        bind(&mut actor, 1, 10, "office");
        activate(&mut actor, 1, "alice@example.com/db", Role::Server, false);

        actor.handle_remove_client(SessionId::new(1));

        assert_eq!(actor.session_count(), 0);
        assert_eq!(actor.table_sizes(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_server_eviction_at_most_one_holds() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);
        bind(&mut actor, 1, 10, "office");
        bind(&mut actor, 2, 11, "laptop");

        let first = activate(&mut actor, 1, "alice@example.com/db", Role::Server, false);
        assert!(first.is_empty());

        let second = activate(&mut actor, 2, "alice@example.com/db", Role::Server, false);
        assert_eq!(second.len(), 1);
        assert_eq!(second.first().map(|e| e.session_id), Some(SessionId::new(1)));

        let snap = actor.waiting_snapshot("alice@example.com/db");
        assert_eq!(
            snap.server.map(|p| p.session_id),
            Some(SessionId::new(2))
        );
        // The evicted session no longer records participation.
        let s1 = actor.snapshot(SessionId::new(1)).expect("session");
        assert!(s1.connections.is_empty());
    }

    #[tokio::test]
    async fn test_fixed_connection_allows_multiple_clients() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);

        assert!(activate(&mut actor, 1, "alice@example.com/db", Role::Client, true).is_empty());
        assert!(activate(&mut actor, 2, "alice@example.com/db", Role::Client, true).is_empty());

        let snap = actor.waiting_snapshot("alice@example.com/db");
        assert_eq!(snap.clients.len(), 2);
    }

    #[tokio::test]
    async fn test_sibling_sessions_share_client_slot() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);
        let _rx_c = add_session(&mut actor, 3);
        bind(&mut actor, 1, 10, "office");
        bind(&mut actor, 2, 10, "office");
        bind(&mut actor, 3, 11, "laptop");

        // Two sessions of the same daemon both activate; neither displaces
        // the other.
        assert!(activate(&mut actor, 1, "alice@example.com/db", Role::Client, false).is_empty());
        assert!(activate(&mut actor, 2, "alice@example.com/db", Role::Client, false).is_empty());
        let snap = actor.waiting_snapshot("alice@example.com/db");
        assert_eq!(snap.clients.len(), 2);

        // A different daemon takes the slot and displaces both siblings.
        let evicted = activate(&mut actor, 3, "alice@example.com/db", Role::Client, false);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|e| e.daemon_id == Some(10)));

        let snap = actor.waiting_snapshot("alice@example.com/db");
        assert_eq!(snap.clients.len(), 1);
        assert_eq!(
            snap.clients.first().map(|p| p.session_id),
            Some(SessionId::new(3))
        );
    }

    #[tokio::test]
    async fn test_single_client_slot_evicts_on_non_fixed() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);

        assert!(activate(&mut actor, 1, "alice@example.com/db", Role::Client, false).is_empty());
        let evicted = activate(&mut actor, 2, "alice@example.com/db", Role::Client, false);
        assert_eq!(evicted.len(), 1);

        let snap = actor.waiting_snapshot("alice@example.com/db");
        assert_eq!(snap.clients.len(), 1);
    }

    #[tokio::test]
    async fn test_pair_lifecycle_match() {
        let mut actor = create_actor();
        let _rx_s = add_session(&mut actor, 1);
        let _rx_c = add_session(&mut actor, 2);
        activate(&mut actor, 1, "alice@example.com/db", Role::Server, false);
        activate(&mut actor, 2, "alice@example.com/db", Role::Client, false);

        let created = actor
            .handle_create_pair(
                "alice@example.com/db",
                SessionId::new(2),
                Instant::now() + Duration::from_secs(10),
            )
            .expect("pair created");
        assert_ne!(created.client_request, created.server_request);

        let first = actor.handle_update_pair(created.client_request, test_addr(5001));
        assert!(matches!(first, PairUpdate::Partial));

        let second = actor.handle_update_pair(created.server_request, test_addr(5002));
        match second {
            PairUpdate::Matched(m) => {
                assert_eq!(m.client.addr, test_addr(5001));
                assert_eq!(m.server.addr, test_addr(5002));
            }
            other => panic!("expected Matched, got {other:?}"),
        }

        // Both request ids are unresolvable afterward.
        assert!(matches!(
            actor.handle_update_pair(created.client_request, test_addr(5001)),
            PairUpdate::NotFound
        ));
        assert!(matches!(
            actor.handle_update_pair(created.server_request, test_addr(5002)),
            PairUpdate::NotFound
        ));

        // Matched client is no longer eligible for another punch.
        let again = actor.handle_create_pair(
            "alice@example.com/db",
            SessionId::new(2),
            Instant::now() + Duration::from_secs(10),
        );
        assert!(matches!(again, Err(RegistryError::PunchNotEligible)));
    }

    #[tokio::test]
    async fn test_pair_expiry_sweep() {
        let mut actor = create_actor();
        let _rx_s = add_session(&mut actor, 1);
        let _rx_c = add_session(&mut actor, 2);
        activate(&mut actor, 1, "alice@example.com/db", Role::Server, false);
        activate(&mut actor, 2, "alice@example.com/db", Role::Client, false);

        let now = Instant::now();
        let created = actor
            .handle_create_pair("alice@example.com/db", SessionId::new(2), now)
            .expect("pair created");

        let partial = actor.handle_update_pair(created.client_request, test_addr(5001));
        assert!(matches!(partial, PairUpdate::Partial));

        actor.handle_sweep_pairs(now + Duration::from_millis(1));

        assert!(matches!(
            actor.handle_update_pair(created.server_request, test_addr(5002)),
            PairUpdate::NotFound
        ));
    }

    #[tokio::test]
    async fn test_create_pair_requires_waiting_server() {
        let mut actor = create_actor();
        let _rx_c = add_session(&mut actor, 2);
        activate(&mut actor, 2, "alice@example.com/db", Role::Client, false);

        let result = actor.handle_create_pair(
            "alice@example.com/db",
            SessionId::new(2),
            Instant::now() + Duration::from_secs(10),
        );
        assert!(matches!(result, Err(RegistryError::NoWaitingServer)));
    }

    #[tokio::test]
    async fn test_identity_impersonation_guard() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);

        let result = actor.handle_register_daemon(
            SessionId::new(1),
            DaemonBinding {
                daemon_id: 10,
                user_id: 1,
                email: "alice@example.com".into(),
                name: "office".into(),
                identity: "shared-identity".into(),
                key: "key-a".into(),
                hostname: "h".into(),
                version: "1".into(),
                internal_addresses: Vec::new(),
            },
        );
        assert!(result.is_ok());

        // Same identity, different daemon and key: rejected.
        let result = actor.handle_register_daemon(
            SessionId::new(2),
            DaemonBinding {
                daemon_id: 11,
                user_id: 1,
                email: "alice@example.com".into(),
                name: "laptop".into(),
                identity: "shared-identity".into(),
                key: "key-b".into(),
                hostname: "h".into(),
                version: "1".into(),
                internal_addresses: Vec::new(),
            },
        );
        assert!(matches!(result, Err(RegistryError::IdentityMismatch)));
    }

    #[tokio::test]
    async fn test_rebind_detaches_old_daemon() {
        let mut actor = create_actor();
        let _rx = add_session(&mut actor, 1);
        bind(&mut actor, 1, 10, "office");
        bind(&mut actor, 1, 11, "laptop");

        let snap = actor.snapshot(SessionId::new(1)).expect("session");
        assert_eq!(snap.daemon_id, Some(11));
        // Old daemon runtime is gone with its last session.
        assert!(actor.sessions_of_daemon(10).is_empty());
        assert_eq!(actor.sessions_of_daemon(11).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_connection_returns_affected() {
        let mut actor = create_actor();
        let _rx_a = add_session(&mut actor, 1);
        let _rx_b = add_session(&mut actor, 2);
        activate(&mut actor, 1, "alice@example.com/db", Role::Server, false);
        activate(&mut actor, 2, "alice@example.com/db", Role::Client, false);

        let affected = actor.handle_remove_connection("alice@example.com/db", None);
        assert_eq!(affected.len(), 2);
        assert!(actor.waiting.is_empty());
    }

    #[tokio::test]
    async fn test_registry_full() {
        let (_tx, rx) = mpsc::channel(16);
        let mut actor = RegistryActor::new(rx, 1);
        let _rx = add_session(&mut actor, 1);

        let (tx, _rx2) = mpsc::channel(16);
        let result = actor.handle_add_client(
            SessionId::new(2),
            tx,
            CancellationToken::new(),
            test_addr(40002),
        );
        assert!(matches!(result, Err(RegistryError::RegistryFull { max: 1 })));
    }
}
