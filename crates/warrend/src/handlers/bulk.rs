//! Connect and Disconnect: subtree-wide client attachment.

use tracing::info;

use warren_core::{grammar, graph, Assignment, RecordId, Role};
use warren_protocol::{ResultCode, ServerMessage};

use crate::connlist;

use super::{bound_daemon, caller, HandlerCtx, HandlerError};

pub async fn handle_connect(
    ctx: &HandlerCtx,
    message_id: u64,
    token: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::ConnectDone {
        message_id,
        result,
        attached: 0,
        updates: None,
    };

    let snapshot = caller(ctx).await?;
    let (daemon, _user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };

    // Bulk redemption takes a path token only; connection tokens grant a
    // single server slot and make no sense over a subtree.
    let root = match ctx.store.path_by_token(&token).await? {
        Some(p) => p,
        None => return Ok(reject(ResultCode::Rejected)),
    };
    let targets = graph::connections_in(ctx.store.as_ref(), &root).await?;
    if targets.is_empty() {
        return Ok(reject(ResultCode::PathNotFound));
    }

    let mut attached: u32 = 0;
    let mut affected: Vec<RecordId> = Vec::new();
    for (path, _) in targets {
        let name = graph::full_name(ctx.store.as_ref(), &path).await?;
        // Re-read under the name lock; the subtree walk's copy may be stale.
        let _guard = ctx.name_locks.lock(&name).await;
        let mut conn = match ctx.store.connection_by_path(path.id).await? {
            Some(c) => c,
            None => continue,
        };
        if conn.assignment(daemon.id, Role::Client).is_some() {
            continue;
        }

        if !conn.fixed {
            let old: Vec<RecordId> = conn.clients().map(|a| a.daemon_id).collect();
            for id in old {
                conn.unassign(id, Role::Client);
                affected.push(id);
            }
        }
        conn.assignments.push(Assignment {
            daemon_id: daemon.id,
            role: Role::Client,
            address: String::new(),
            port: String::new(),
        });
        let fixed = conn.fixed;
        ctx.store.save_connection(conn).await?;

        let evicted = ctx
            .registry
            .update_connection(
                name.clone(),
                ctx.session_id,
                Role::Client,
                true,
                fixed,
                Vec::new(),
            )
            .await?;
        affected.extend(evicted.into_iter().filter_map(|e| e.daemon_id));
        affected.extend(super::live_daemons_on(ctx, &name).await);
        attached += 1;
    }

    info!(
        session_id = %ctx.session_id,
        daemon = %daemon.name,
        attached,
        "Bulk connect done"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, daemon.id).await?;
    affected.push(daemon.id);
    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(ServerMessage::ConnectDone {
        message_id,
        result: ResultCode::Accepted,
        attached,
        updates: Some(updates),
    })
}

pub async fn handle_disconnect(
    ctx: &HandlerCtx,
    message_id: u64,
    name: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::DisconnectDone {
        message_id,
        result,
        detached: 0,
        updates: None,
    };

    let spec = match grammar::validate_connection_name(&name) {
        Some(s) => s,
        None => return Ok(reject(ResultCode::InvalidPath)),
    };

    let snapshot = caller(ctx).await?;
    let (daemon, _user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };

    let (_owner, root) = match super::resolve_named_path(ctx, &spec).await? {
        Some(resolved) => resolved,
        None => return Ok(reject(ResultCode::PathNotFound)),
    };

    // Detaching nothing is still a success; `detached` reports the count.
    let mut detached: u32 = 0;
    let mut affected: Vec<RecordId> = Vec::new();
    for (path, _) in graph::connections_in(ctx.store.as_ref(), &root).await? {
        let full = graph::full_name(ctx.store.as_ref(), &path).await?;
        let _guard = ctx.name_locks.lock(&full).await;
        let mut conn = match ctx.store.connection_by_path(path.id).await? {
            Some(c) => c,
            None => continue,
        };
        if !conn.unassign(daemon.id, Role::Client) {
            continue;
        }
        let fixed = conn.fixed;
        ctx.store.save_connection(conn).await?;

        for link in ctx.registry.sessions_of_daemon(daemon.id).await {
            ctx.registry
                .update_connection(
                    full.clone(),
                    link.session_id,
                    Role::Client,
                    false,
                    fixed,
                    Vec::new(),
                )
                .await?;
        }
        affected.extend(super::live_daemons_on(ctx, &full).await);
        detached += 1;
    }

    info!(
        session_id = %ctx.session_id,
        daemon = %daemon.name,
        detached,
        "Bulk disconnect done"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, daemon.id).await?;
    affected.push(daemon.id);
    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(ServerMessage::DisconnectDone {
        message_id,
        result: ResultCode::Accepted,
        detached,
        updates: Some(updates),
    })
}
