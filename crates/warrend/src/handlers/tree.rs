//! Tree and DaemonsList: read-only views over the caller's namespace.

use std::collections::{BTreeSet, HashMap};

use warren_core::{graph, ConnectionRecord, RecordId, Role};
use warren_protocol::{DaemonInfo, ResultCode, ServerMessage, TreeNode};

use super::{bound_daemon, caller, HandlerCtx, HandlerError};

pub async fn handle_tree(
    ctx: &HandlerCtx,
    message_id: u64,
    path: String,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::TreeView {
        message_id,
        result,
        root: None,
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

    // Prefetch the whole subtree, then assemble bottom-up so the builder
    // stays synchronous.
    let ordered = graph::subtree(ctx.store.as_ref(), &root).await?;
    let mut connections: HashMap<RecordId, ConnectionRecord> = HashMap::new();
    for node in &ordered {
        if let Some(conn) = ctx.store.connection_by_path(node.id).await? {
            connections.insert(node.id, conn);
        }
    }

    let mut children_of: HashMap<RecordId, Vec<TreeNode>> = HashMap::new();
    let mut built_root = None;
    for node in ordered.iter().rev() {
        let mut children = children_of.remove(&node.id).unwrap_or_default();
        // reversed iteration collected them in reverse name order
        children.reverse();

        let (connection, node_type, servers, clients) = match connections.get(&node.id) {
            Some(conn) => {
                let node_type = [Role::Server, Role::Client]
                    .into_iter()
                    .find(|r| conn.assignment(daemon.id, *r).is_some());
                (
                    true,
                    node_type,
                    conn.server().is_some() as u32,
                    conn.clients().count() as u32,
                )
            }
            None => (false, None, 0, 0),
        };

        let built = TreeNode {
            name: node.name.clone(),
            connection,
            node_type,
            servers_number: servers,
            clients_number: clients,
            children,
        };
        if node.id == root.id {
            built_root = Some(built);
        } else if let Some(parent_id) = node.parent_id {
            children_of.entry(parent_id).or_default().push(built);
        }
    }

    Ok(ServerMessage::TreeView {
        message_id,
        result: ResultCode::Accepted,
        root: built_root,
    })
}

pub async fn handle_daemons_list(
    ctx: &HandlerCtx,
    message_id: u64,
    path: Option<String>,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Daemons {
        message_id,
        result,
        daemons: Vec::new(),
    };

    let snapshot = caller(ctx).await?;
    let (_daemon, user) = match bound_daemon(ctx, &snapshot).await? {
        Some(pair) => pair,
        None => return Ok(reject(ResultCode::Rejected)),
    };

    let records = match path {
        // No path: every daemon of the account.
        None => ctx.store.daemons_by_user(user.id).await?,
        // With a path: the daemons attached somewhere under it.
        Some(path) => {
            let spec = match super::parse_path(&path) {
                Some(s) => s,
                None => return Ok(reject(ResultCode::InvalidPath)),
            };
            let root = match super::resolve_own_path(ctx, &user, &spec).await? {
                Some(p) => p,
                None => return Ok(reject(ResultCode::PathNotFound)),
            };
            let mut ids: BTreeSet<RecordId> = BTreeSet::new();
            for (_, conn) in graph::connections_in(ctx.store.as_ref(), &root).await? {
                ids.extend(conn.assignments.iter().map(|a| a.daemon_id));
            }
            let mut found = Vec::new();
            for id in ids {
                if let Some(record) = ctx.store.daemon_by_id(id).await? {
                    found.push(record);
                }
            }
            found
        }
    };

    let mut daemons = Vec::with_capacity(records.len());
    for record in records {
        let presence = ctx.registry.daemon_presence(record.id).await;
        let online = presence.is_some();
        let (hostname, version, address) = match presence {
            Some(p) => (p.hostname, p.version, Some(p.address)),
            None => (None, None, None),
        };
        daemons.push(DaemonInfo {
            id: record.id,
            name: record.name,
            online,
            hostname,
            version,
            address,
        });
    }
    daemons.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ServerMessage::Daemons {
        message_id,
        result: ResultCode::Accepted,
        daemons,
    })
}
