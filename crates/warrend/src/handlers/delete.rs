//! Delete and DeleteDaemon: destructive graph operations.

use tracing::info;

use warren_core::{graph, grammar, RecordId, Role};
use warren_protocol::{ConnectionsList, ResultCode, ServerMessage};

use crate::connlist;

use super::{bound_daemon, caller, HandlerCtx, HandlerError};

pub async fn handle_delete(
    ctx: &HandlerCtx,
    message_id: u64,
    path: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Deleted {
        message_id,
        result,
        updates: None,
    };

    let spec = match super::parse_path(&path) {
        Some(s) => s,
        None => return Ok(reject(ResultCode::InvalidPath)),
    };

    let snapshot = caller(ctx).await?;
    let (daemon, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };

    let root = match super::resolve_own_path(ctx, &user, &spec).await? {
        Some(p) => p,
        None => return Ok(reject(ResultCode::PathNotFound)),
    };

    // Preorder walk; deletion happens leaves-first by reversing it.
    let ordered = graph::subtree(ctx.store.as_ref(), &root).await?;

    let mut affected: Vec<RecordId> = Vec::new();
    for node in &ordered {
        let name = graph::full_name(ctx.store.as_ref(), node).await?;
        // Under the name lock so an in-flight attach cannot resurrect the
        // record between removal and deletion.
        let _guard = ctx.name_locks.lock(&name).await;
        let conn = match ctx.store.connection_by_path(node.id).await? {
            Some(c) => c,
            None => continue,
        };

        // Everyone attached, persisted or live, loses this connection.
        affected.extend(conn.assignments.iter().map(|a| a.daemon_id));
        affected.extend(super::live_daemons_on(ctx, &name).await);
        ctx.registry.remove_connection(name, None).await?;
        ctx.store.delete_connection(conn.id).await?;
    }
    for node in ordered.iter().rev() {
        ctx.store.delete_path(node.id).await?;
    }

    info!(
        session_id = %ctx.session_id,
        path = %spec.qualified(&user.email),
        "Subtree deleted"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, daemon.id).await?;
    affected.push(daemon.id);
    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(ServerMessage::Deleted {
        message_id,
        result: ResultCode::Accepted,
        updates: Some(updates),
    })
}

pub async fn handle_delete_daemon(
    ctx: &HandlerCtx,
    message_id: u64,
    name: String,
) -> Result<ServerMessage, HandlerError> {
    let done = |result| ServerMessage::DaemonDeleted { message_id, result };

    if !grammar::validate_name(&name) {
        return Ok(done(ResultCode::Rejected));
    }

    let snapshot = caller(ctx).await?;
    let (_own, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(done(ResultCode::Rejected)),
    };
    let target = match ctx.store.daemon_by_user_and_name(user.id, &name).await? {
        Some(d) => d,
        None => return Ok(done(ResultCode::DaemonNotFound)),
    };

    let links = ctx.registry.sessions_of_daemon(target.id).await;
    let session_ids: Vec<_> = links.iter().map(|l| l.session_id).collect();

    // Release every persisted assignment the daemon holds.
    let mut affected: Vec<RecordId> = Vec::new();
    for stale in ctx.store.connections_with_daemon(target.id).await? {
        let path = ctx
            .store
            .path_by_id(stale.path_id)
            .await?
            .ok_or(warren_core::StoreError::NotFound {
                kind: "path",
                id: stale.path_id,
            })?;
        let full = graph::full_name(ctx.store.as_ref(), &path).await?;
        let _guard = ctx.name_locks.lock(&full).await;
        let mut conn = match ctx.store.connection_by_path(path.id).await? {
            Some(c) => c,
            None => continue,
        };
        conn.unassign(target.id, Role::Server);
        conn.unassign(target.id, Role::Client);
        affected.extend(conn.assignments.iter().map(|a| a.daemon_id));

        affected.extend(super::live_daemons_on(ctx, &full).await);
        ctx.registry
            .remove_connection(full, Some(session_ids.clone()))
            .await?;
        ctx.store.save_connection(conn).await?;
    }

    // Each open session gets an empty snapshot, then its transport closes.
    for link in &links {
        let _ = link
            .tx
            .send(ServerMessage::ConnectionsList {
                updates: ConnectionsList::empty(),
            })
            .await;
    }
    ctx.registry.cancel_sessions(session_ids).await;
    ctx.store.delete_daemon(target.id).await?;

    info!(
        session_id = %ctx.session_id,
        daemon = %target.name,
        "Daemon deleted"
    );

    super::push_snapshots(ctx, affected, Some(ctx.session_id)).await;

    Ok(done(ResultCode::Accepted))
}
