//! Import and LookupIdentity: read-only token and identity resolution.

use warren_core::graph;
use warren_protocol::{ImportEntry, ResultCode, ServerMessage};

use super::{HandlerCtx, HandlerError};

/// Import resolves a path token to the connections it would grant,
/// without attaching anything.
pub async fn handle_import(
    ctx: &HandlerCtx,
    message_id: u64,
    token: String,
) -> Result<ServerMessage, HandlerError> {
    let root = match ctx.store.path_by_token(&token).await? {
        Some(p) => p,
        None => {
            return Ok(ServerMessage::Imported {
                message_id,
                result: ResultCode::Rejected,
                entries: Vec::new(),
            })
        }
    };

    let mut entries = Vec::new();
    for (path, conn) in graph::connections_in(ctx.store.as_ref(), &root).await? {
        entries.push(ImportEntry {
            name: graph::full_name(ctx.store.as_ref(), &path).await?,
            fixed: conn.fixed,
            connect_address: conn.connect_address,
            connect_port: conn.connect_port,
        });
    }

    Ok(ServerMessage::Imported {
        message_id,
        result: ResultCode::Accepted,
        entries,
    })
}

/// Resolves a live identity hash to its public key and daemon name.
pub async fn handle_lookup_identity(
    ctx: &HandlerCtx,
    message_id: u64,
    identity: String,
) -> Result<ServerMessage, HandlerError> {
    let sessions = ctx.registry.identity_sessions(identity).await;
    let hit = sessions
        .into_iter()
        .find(|s| s.key.as_deref().is_some_and(|k| !k.is_empty()));

    match hit {
        Some(s) => Ok(ServerMessage::Identity {
            message_id,
            result: ResultCode::Accepted,
            key: s.key,
            name: s.daemon_name,
        }),
        None => Ok(ServerMessage::Identity {
            message_id,
            result: ResultCode::DaemonNotFound,
            key: None,
            name: None,
        }),
    }
}
