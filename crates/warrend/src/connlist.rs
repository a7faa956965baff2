//! Per-daemon attachment snapshot builder.
//!
//! Read-side aggregator: collects one daemon's role assignments from the
//! persisted graph, annotates each with the live opposite-role peers
//! known to the registry, and pushes the result to every open session of
//! the daemon. Topology-changing handlers call this for each affected
//! daemon.

use tracing::{debug, warn};

use warren_core::{graph, RecordId, Role, SessionId, SharedStore, StoreError, StoreResult};
use warren_protocol::{ConnectionInfo, ConnectionsList, ServerMessage};

use crate::registry::RegistryHandle;

/// Builds the attachment snapshot for one daemon.
pub async fn build(
    store: &SharedStore,
    registry: &RegistryHandle,
    daemon_id: RecordId,
) -> StoreResult<ConnectionsList> {
    let mut list = ConnectionsList::default();

    for conn in store.connections_with_daemon(daemon_id).await? {
        let path = store
            .path_by_id(conn.path_id)
            .await?
            .ok_or(StoreError::NotFound {
                kind: "path",
                id: conn.path_id,
            })?;
        let name = graph::full_name(store.as_ref(), &path).await?;
        let waiting = registry.waiting_state(name.clone()).await;

        for role in [Role::Server, Role::Client] {
            let assignment = match conn.assignment(daemon_id, role) {
                Some(a) => a,
                None => continue,
            };

            // Live opposite-role daemons, by display name.
            let peers: Vec<String> = match role {
                Role::Server => waiting
                    .clients
                    .iter()
                    .filter_map(|p| p.daemon_name.clone())
                    .collect(),
                Role::Client => waiting
                    .server
                    .iter()
                    .filter_map(|p| p.daemon_name.clone())
                    .collect(),
            };

            // Per-attach override takes precedence over the static endpoint.
            let (address, port) = if assignment.address.is_empty() && assignment.port.is_empty() {
                (conn.connect_address.clone(), conn.connect_port.clone())
            } else {
                (assignment.address.clone(), assignment.port.clone())
            };

            let info = ConnectionInfo {
                name: name.clone(),
                fixed: conn.fixed,
                connect_address: address,
                connect_port: port,
                peers,
            };
            match role {
                Role::Server => list.server_connections.push(info),
                Role::Client => list.client_connections.push(info),
            }
        }
    }

    list.server_connections.sort_by(|a, b| a.name.cmp(&b.name));
    list.client_connections.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(list)
}

/// Builds and pushes a fresh snapshot to every live session of `daemon_id`,
/// excluding `skip` (whose copy rides in its own response frame).
///
/// Store failures are logged and the push is skipped; a daemon missing a
/// snapshot recovers on its next topology change.
pub async fn push_to_daemon(
    store: &SharedStore,
    registry: &RegistryHandle,
    daemon_id: RecordId,
    skip: Option<SessionId>,
) {
    let updates = match build(store, registry, daemon_id).await {
        Ok(list) => list,
        Err(e) => {
            warn!(daemon_id, error = %e, "Failed to build connections list");
            return;
        }
    };

    for link in registry.sessions_of_daemon(daemon_id).await {
        if Some(link.session_id) == skip {
            continue;
        }
        if link
            .tx
            .send(ServerMessage::ConnectionsList {
                updates: updates.clone(),
            })
            .await
            .is_err()
        {
            debug!(session_id = %link.session_id, "Session gone while pushing snapshot");
        }
    }
}
