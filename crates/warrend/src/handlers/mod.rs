//! Protocol transaction handlers, one per request kind.
//!
//! Common shape: resolve the caller's session, resolve its bound daemon
//! via the store where required, validate grammar, execute the domain
//! operation against the persisted graph, mutate the registry, reply
//! with exactly one frame carrying a closed result code, and push fresh
//! connections-list snapshots to every other session of affected
//! daemons.
//!
//! Domain outcomes never surface as errors; only infrastructure failures
//! (store, registry channel) escape as `HandlerError`, which the
//! connection task logs and answers with silence (the client retries on
//! its own timeout).

mod account;
mod attach;
mod bulk;
mod create;
mod delete;
mod import;
mod punch;
mod register;
mod tree;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::debug;

use warren_core::{
    grammar, graph, DaemonRecord, PathSpec, RecordId, SessionId, SharedStore, StoreError, User,
};
use warren_protocol::{ClientMessage, ServerMessage};

use crate::connlist;
use crate::locks::NameLocks;
use crate::mailer::Mailer;
use crate::registry::{RegistryError, RegistryHandle, SessionSnapshot};

/// Everything a handler needs to run one transaction.
#[derive(Clone)]
pub struct HandlerCtx {
    pub session_id: SessionId,
    pub registry: RegistryHandle,
    pub store: SharedStore,
    pub mailer: Arc<dyn Mailer>,
    /// The tracker's UDP socket, the send path for punch datagrams.
    pub punch_socket: Arc<UdpSocket>,
    /// Serializes persisted read-modify-writes per connection name.
    pub name_locks: Arc<NameLocks>,
    /// TTL for freshly created punch pairs.
    pub pair_ttl: Duration,
    /// Sender address for account-bootstrap mail.
    pub mail_from: String,
}

/// Infrastructure failures escaping a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("registry unavailable: {0}")]
    Registry(RegistryError),

    #[error("session {0} is gone")]
    SessionGone(SessionId),
}

impl From<RegistryError> for HandlerError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

/// Dispatches one decoded request to its handler.
///
/// `Ok(None)` means no response frame is owed (`Alive`, or a UDP-only
/// kind arriving over TCP).
pub async fn dispatch(
    ctx: &HandlerCtx,
    msg: ClientMessage,
) -> Result<Option<ServerMessage>, HandlerError> {
    let kind = msg.kind();
    debug!(session_id = %ctx.session_id, kind, "Dispatching request");

    let response = match msg {
        ClientMessage::Alive => return Ok(None),
        ClientMessage::AddressResponse { .. } => {
            // UDP-only kind; over TCP it carries no usable source address.
            debug!(session_id = %ctx.session_id, "AddressResponse over TCP, ignoring");
            return Ok(None);
        }
        ClientMessage::Register {
            message_id,
            token,
            name,
            identity,
            key,
            hostname,
            version,
            internal_addresses,
        } => {
            register::handle(
                ctx,
                message_id,
                token,
                name,
                identity,
                key,
                hostname,
                version,
                internal_addresses,
            )
            .await?
        }
        ClientMessage::Create {
            message_id,
            path,
            fixed,
            role,
            connect_address,
            connect_port,
        } => create::handle(ctx, message_id, path, fixed, role, connect_address, connect_port).await?,
        ClientMessage::Attach {
            message_id,
            token,
            connect_address,
            connect_port,
        } => attach::handle_attach(ctx, message_id, None, token, connect_address, connect_port).await?,
        ClientMessage::RemoteAttach {
            message_id,
            daemon_name,
            token,
            connect_address,
            connect_port,
        } => {
            attach::handle_attach(
                ctx,
                message_id,
                Some(daemon_name),
                token,
                connect_address,
                connect_port,
            )
            .await?
        }
        ClientMessage::Detach { message_id, name } => {
            attach::handle_detach(ctx, message_id, None, name).await?
        }
        ClientMessage::RemoteDetach {
            message_id,
            daemon_name,
            name,
        } => attach::handle_detach(ctx, message_id, Some(daemon_name), name).await?,
        ClientMessage::Connect { message_id, token } => {
            bulk::handle_connect(ctx, message_id, token).await?
        }
        ClientMessage::Disconnect { message_id, name } => {
            bulk::handle_disconnect(ctx, message_id, name).await?
        }
        ClientMessage::Delete { message_id, path } => {
            delete::handle_delete(ctx, message_id, path).await?
        }
        ClientMessage::DeleteDaemon { message_id, name } => {
            delete::handle_delete_daemon(ctx, message_id, name).await?
        }
        ClientMessage::Tree { message_id, path } => tree::handle_tree(ctx, message_id, path).await?,
        ClientMessage::DaemonsList { message_id, path } => {
            tree::handle_daemons_list(ctx, message_id, path).await?
        }
        ClientMessage::Import { message_id, token } => {
            import::handle_import(ctx, message_id, token).await?
        }
        ClientMessage::LookupIdentity {
            message_id,
            identity,
        } => import::handle_lookup_identity(ctx, message_id, identity).await?,
        ClientMessage::Init { message_id, email } => {
            account::handle_init(ctx, message_id, email).await?
        }
        ClientMessage::Confirm {
            message_id,
            email,
            code,
        } => account::handle_confirm(ctx, message_id, email, code).await?,
        ClientMessage::Punch { message_id, name } => punch::handle(ctx, message_id, name).await?,
    };

    Ok(Some(response))
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Reads the caller's registry entry; a missing entry means the session
/// is mid-teardown and the request can be dropped.
pub(crate) async fn caller(ctx: &HandlerCtx) -> Result<SessionSnapshot, HandlerError> {
    ctx.registry
        .get_session(ctx.session_id)
        .await
        .ok_or(HandlerError::SessionGone(ctx.session_id))
}

/// Resolves the caller's bound daemon record and owning user, or `None`
/// when the session never registered.
pub(crate) async fn bound_daemon(
    ctx: &HandlerCtx,
    snapshot: &SessionSnapshot,
) -> Result<Option<(DaemonRecord, User)>, HandlerError> {
    let daemon_id = match snapshot.daemon_id {
        Some(id) => id,
        None => return Ok(None),
    };
    let daemon = match ctx.store.daemon_by_id(daemon_id).await? {
        Some(d) => d,
        None => return Ok(None),
    };
    let user = match ctx.store.user_by_id(daemon.user_id).await? {
        Some(u) => u,
        None => return Ok(None),
    };
    Ok(Some((daemon, user)))
}

/// Resolves a path spec to its terminal record inside `user`'s namespace.
///
/// A non-empty email prefix addressing a different user resolves to
/// nothing: callers cannot operate on foreign namespaces by name.
pub(crate) async fn resolve_own_path(
    ctx: &HandlerCtx,
    user: &User,
    spec: &PathSpec,
) -> Result<Option<warren_core::PathRecord>, HandlerError> {
    if !spec.email.is_empty() && spec.email != user.email {
        return Ok(None);
    }
    Ok(graph::resolve(ctx.store.as_ref(), user.id, &spec.segments).await?)
}

/// Resolves a fully-qualified connection name to its owning user and
/// terminal path, crossing user namespaces.
pub(crate) async fn resolve_named_path(
    ctx: &HandlerCtx,
    spec: &PathSpec,
) -> Result<Option<(User, warren_core::PathRecord)>, HandlerError> {
    let owner = match ctx.store.user_by_email(&spec.email).await? {
        Some(u) => u,
        None => return Ok(None),
    };
    let path = match graph::resolve(ctx.store.as_ref(), owner.id, &spec.segments).await? {
        Some(p) => p,
        None => return Ok(None),
    };
    Ok(Some((owner, path)))
}

/// Validates a path argument, returning the parsed spec.
pub(crate) fn parse_path(path: &str) -> Option<PathSpec> {
    grammar::validate_path(path)
}

/// Pushes fresh snapshots to every session of each daemon in `daemons`,
/// excluding `skip` (the requester, whose copy rides in the response).
pub(crate) async fn push_snapshots(
    ctx: &HandlerCtx,
    daemons: impl IntoIterator<Item = RecordId>,
    skip: Option<SessionId>,
) {
    let unique: BTreeSet<RecordId> = daemons.into_iter().collect();
    for daemon_id in unique {
        connlist::push_to_daemon(&ctx.store, &ctx.registry, daemon_id, skip).await;
    }
}

/// Daemons with a live participant on `name`, for snapshot fan-out.
pub(crate) async fn live_daemons_on(ctx: &HandlerCtx, name: &str) -> Vec<RecordId> {
    let waiting = ctx.registry.waiting_state(name.to_string()).await;
    let mut daemons: Vec<RecordId> = waiting
        .clients
        .iter()
        .filter_map(|p| p.daemon_id)
        .collect();
    if let Some(server) = waiting.server {
        if let Some(id) = server.daemon_id {
            daemons.push(id);
        }
    }
    daemons
}
