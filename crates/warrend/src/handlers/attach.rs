//! Attach, RemoteAttach, Detach, RemoteDetach: token redemption and role
//! assignment on the persisted graph, mirrored into the registry.

use tracing::info;

use warren_core::{
    grammar, graph, Assignment, ConnectionRecord, DaemonRecord, PathRecord, RecordId, Role,
};
use warren_protocol::{ResultCode, ServerMessage};

use crate::connlist;

use super::{bound_daemon, caller, HandlerCtx, HandlerError};

/// Resolves a redeemed token to its connection and granted role.
///
/// A path token grants the client role on the first connection of its
/// subtree; a connection token grants the server role on its own path.
async fn redeem(
    ctx: &HandlerCtx,
    token: &str,
) -> Result<Option<(PathRecord, ConnectionRecord, Role)>, HandlerError> {
    if let Some(root) = ctx.store.path_by_token(token).await? {
        return Ok(graph::first_connection(ctx.store.as_ref(), &root)
            .await?
            .map(|(path, conn)| (path, conn, Role::Client)));
    }
    if let Some(conn) = ctx.store.connection_by_token(token).await? {
        let path = ctx
            .store
            .path_by_id(conn.path_id)
            .await?
            .ok_or(warren_core::StoreError::NotFound {
                kind: "path",
                id: conn.path_id,
            })?;
        return Ok(Some((path, conn, Role::Server)));
    }
    Ok(None)
}

pub async fn handle_attach(
    ctx: &HandlerCtx,
    message_id: u64,
    target_daemon: Option<String>,
    token: String,
    connect_address: Option<String>,
    connect_port: Option<String>,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Attached {
        message_id,
        result,
        name: None,
        updates: None,
    };

    let override_addr = connect_address.unwrap_or_default();
    let override_port = connect_port.unwrap_or_default();
    if !grammar::validate_endpoint(&override_addr, &override_port) {
        return Ok(reject(ResultCode::InvalidAddress));
    }

    let snapshot = caller(ctx).await?;
    let (own_daemon, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };

    // RemoteAttach operates on another daemon of the same account.
    let own_daemon_id = own_daemon.id;
    let daemon: DaemonRecord = match &target_daemon {
        None => own_daemon,
        Some(name) => match ctx.store.daemon_by_user_and_name(user.id, name).await? {
            Some(d) => d,
            None => return Ok(reject(ResultCode::DaemonNotFound)),
        },
    };

    let (path, _, role) = match redeem(ctx, &token).await? {
        Some(resolved) => resolved,
        None => {
            // Distinguish a known path token over an empty subtree from an
            // unknown token.
            if ctx.store.path_by_token(&token).await?.is_some() {
                return Ok(reject(ResultCode::PathNotFound));
            }
            return Ok(reject(ResultCode::Rejected));
        }
    };

    // The record is re-read under the name lock; the redeemed copy may be
    // stale by the time a concurrent attach on the same name releases it.
    let name = graph::full_name(ctx.store.as_ref(), &path).await?;
    let _guard = ctx.name_locks.lock(&name).await;
    let mut conn = match ctx.store.connection_by_path(path.id).await? {
        Some(c) => c,
        None => return Ok(reject(ResultCode::PathNotFound)),
    };

    // A server must end up with a concrete endpoint to forward into.
    let effective_addr = if override_addr.is_empty() && override_port.is_empty() {
        conn.connect_address.as_str()
    } else {
        override_addr.as_str()
    };
    if role == Role::Server && effective_addr == "*" {
        return Ok(reject(ResultCode::InvalidAddress));
    }

    if conn.assignment(daemon.id, role).is_some() {
        return Ok(reject(ResultCode::AlreadyAttached));
    }

    // Displace persisted occupants of an exclusive slot.
    let mut displaced: Vec<RecordId> = Vec::new();
    match role {
        Role::Server => {
            if let Some(old) = conn.server().map(|a| a.daemon_id) {
                conn.unassign(old, Role::Server);
                displaced.push(old);
            }
        }
        Role::Client if !conn.fixed => {
            let old: Vec<RecordId> = conn.clients().map(|a| a.daemon_id).collect();
            for id in old {
                conn.unassign(id, Role::Client);
                displaced.push(id);
            }
        }
        Role::Client => {}
    }

    conn.assignments.push(Assignment {
        daemon_id: daemon.id,
        role,
        address: override_addr,
        port: override_port,
    });
    let fixed = conn.fixed;
    ctx.store.save_connection(conn).await?;

    // Activate the live side. A local attach activates the calling
    // session; a remote attach activates every open session of the target.
    let mut evicted_daemons: Vec<RecordId> = displaced.clone();
    let sessions = match target_daemon {
        None => vec![ctx.session_id],
        Some(_) => ctx
            .registry
            .sessions_of_daemon(daemon.id)
            .await
            .into_iter()
            .map(|link| link.session_id)
            .collect(),
    };
    for session_id in sessions {
        // Server activation records the attaching session's own announced
        // LAN addresses, not the requester's.
        let internal = match role {
            Role::Server => ctx
                .registry
                .get_session(session_id)
                .await
                .map(|s| s.internal_addresses)
                .unwrap_or_default(),
            Role::Client => Vec::new(),
        };
        let evicted = ctx
            .registry
            .update_connection(name.clone(), session_id, role, true, fixed, internal)
            .await?;
        evicted_daemons.extend(evicted.into_iter().filter_map(|e| e.daemon_id));
    }

    info!(
        session_id = %ctx.session_id,
        name = %name,
        role = %role,
        daemon = %daemon.name,
        "Daemon attached"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, own_daemon_id).await?;
    let mut affected = evicted_daemons;
    affected.push(daemon.id);
    affected.extend(super::live_daemons_on(ctx, &name).await);
    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(ServerMessage::Attached {
        message_id,
        result: ResultCode::Accepted,
        name: Some(name),
        updates: Some(updates),
    })
}

pub async fn handle_detach(
    ctx: &HandlerCtx,
    message_id: u64,
    target_daemon: Option<String>,
    name: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Detached {
        message_id,
        result,
        updates: None,
    };

    let spec = match grammar::validate_connection_name(&name) {
        Some(s) => s,
        None => return Ok(reject(ResultCode::InvalidPath)),
    };

    let snapshot = caller(ctx).await?;
    let (own_daemon, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };
    let daemon = match &target_daemon {
        None => own_daemon.clone(),
        Some(target) => match ctx.store.daemon_by_user_and_name(user.id, target).await? {
            Some(d) => d,
            None => return Ok(reject(ResultCode::DaemonNotFound)),
        },
    };

    let (_owner, path) = match super::resolve_named_path(ctx, &spec).await? {
        Some(resolved) => resolved,
        None => return Ok(reject(ResultCode::PathNotFound)),
    };
    let full = graph::full_name(ctx.store.as_ref(), &path).await?;
    let _guard = ctx.name_locks.lock(&full).await;
    let mut conn = match ctx.store.connection_by_path(path.id).await? {
        Some(c) => c,
        None => return Ok(reject(ResultCode::PathNotFound)),
    };

    let roles: Vec<Role> = [Role::Server, Role::Client]
        .into_iter()
        .filter(|r| conn.assignment(daemon.id, *r).is_some())
        .collect();
    if roles.is_empty() {
        // Never attached: reply without mutating anything.
        return Ok(reject(ResultCode::NotAttached));
    }

    for role in &roles {
        conn.unassign(daemon.id, *role);
    }
    let fixed = conn.fixed;
    ctx.store.save_connection(conn).await?;

    for link in ctx.registry.sessions_of_daemon(daemon.id).await {
        for role in &roles {
            ctx.registry
                .update_connection(full.clone(), link.session_id, *role, false, fixed, Vec::new())
                .await?;
        }
    }

    info!(
        session_id = %ctx.session_id,
        name = %full,
        daemon = %daemon.name,
        "Daemon detached"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, own_daemon.id).await?;
    let mut affected = vec![daemon.id];
    affected.extend(super::live_daemons_on(ctx, &full).await);
    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(ServerMessage::Detached {
        message_id,
        result: ResultCode::Accepted,
        updates: Some(updates),
    })
}
