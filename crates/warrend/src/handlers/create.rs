//! Create: mint a path chain and its terminal connection, optionally
//! attaching the caller in one role straight away.

use tracing::info;

use warren_core::{
    generate_token, grammar, Assignment, ConnectionRecord, PathRecord, RecordId, Role,
};
use warren_protocol::{ResultCode, ServerMessage};

use crate::connlist;

use super::{bound_daemon, caller, HandlerCtx, HandlerError};

pub async fn handle(
    ctx: &HandlerCtx,
    message_id: u64,
    path: String,
    fixed: bool,
    role: Option<Role>,
    connect_address: String,
    connect_port: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Created {
        message_id,
        result,
        path_token: None,
        connection_token: None,
        updates: None,
    };

    let spec = match super::parse_path(&path) {
        Some(s) => s,
        None => return Ok(reject(ResultCode::InvalidPath)),
    };
    if !grammar::validate_endpoint(&connect_address, &connect_port) {
        return Ok(reject(ResultCode::InvalidAddress));
    }
    // A server cannot serve a wildcard endpoint; it has nothing to forward to.
    if role == Some(Role::Server) && connect_address == "*" {
        return Ok(reject(ResultCode::InvalidAddress));
    }

    let snapshot = caller(ctx).await?;
    let (daemon, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };
    // Creation stays inside the caller's own namespace.
    if !spec.email.is_empty() && spec.email != user.email {
        return Ok(reject(ResultCode::InvalidPath));
    }

    // Two concurrent creates of the same name race the existence check;
    // the second must observe the first's connection.
    let name = spec.qualified(&user.email);
    let _guard = ctx.name_locks.lock(&name).await;

    // Walk the chain, creating missing segments as we go.
    let mut parent_id: Option<RecordId> = None;
    let mut terminal: Option<PathRecord> = None;
    for segment in &spec.segments {
        let children = ctx.store.paths_by_parent(user.id, parent_id).await?;
        let node = match children.into_iter().find(|p| &p.name == segment) {
            Some(existing) => existing,
            None => {
                let id = ctx
                    .store
                    .save_path(PathRecord::new(
                        user.id,
                        parent_id,
                        segment.clone(),
                        generate_token(),
                    ))
                    .await?;
                ctx.store
                    .path_by_id(id)
                    .await?
                    .ok_or(warren_core::StoreError::NotFound { kind: "path", id })?
            }
        };
        parent_id = Some(node.id);
        terminal = Some(node);
    }
    let terminal = match terminal {
        Some(t) => t,
        // validate_path guarantees at least one segment
        None => return Ok(reject(ResultCode::InvalidPath)),
    };

    if ctx.store.connection_by_path(terminal.id).await?.is_some() {
        return Ok(reject(ResultCode::PathExists));
    }

    let mut conn = ConnectionRecord::new(
        terminal.id,
        generate_token(),
        fixed,
        connect_address,
        connect_port,
    );
    let connection_token = conn.token.clone();
    let path_token = terminal.token.clone();

    if let Some(role) = role {
        conn.assignments.push(Assignment {
            daemon_id: daemon.id,
            role,
            address: String::new(),
            port: String::new(),
        });
    }
    ctx.store.save_connection(conn).await?;

    if let Some(role) = role {
        let internal = match role {
            Role::Server => snapshot.internal_addresses.clone(),
            Role::Client => Vec::new(),
        };
        // Fresh connection: nothing to evict.
        ctx.registry
            .update_connection(name.clone(), ctx.session_id, role, true, fixed, internal)
            .await?;
    }

    info!(
        session_id = %ctx.session_id,
        name = %name,
        role = ?role,
        "Connection created"
    );

    let updates = connlist::build(&ctx.store, &ctx.registry, daemon.id).await?;
    super::push_snapshots(ctx, [daemon.id], Some(ctx.session_id)).await;

    Ok(ServerMessage::Created {
        message_id,
        result: ResultCode::Accepted,
        path_token: Some(path_token),
        connection_token: Some(connection_token),
        updates: Some(updates),
    })
}
