//! Protocol message types for tracker communication.

use serde::{Deserialize, Serialize};
use warren_core::{RecordId, Role};

/// Closed result code carried by every response.
///
/// Domain outcomes are never raised as errors; each handler maps every
/// validation and lookup outcome to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Accepted,
    Rejected,
    InvalidPath,
    InvalidAddress,
    PathNotFound,
    PathExists,
    NameExists,
    AlreadyAttached,
    NotAttached,
    DaemonNotFound,
}

/// Messages sent by daemons to the tracker.
///
/// Every request carries a client-chosen `message_id` echoed back in the
/// response. `Alive` is the keepalive no-op; `AddressResponse` is the only
/// kind accepted on the UDP socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive no-op, valid on both transports, never dispatched.
    Alive,

    /// Bind this session to a daemon identity.
    Register {
        message_id: u64,
        /// Account token minted by Init/Confirm.
        token: String,
        /// Daemon display name, unique per user.
        name: String,
        /// Identity hash shared by every session of the same daemon.
        identity: String,
        /// Public key for peer verification.
        key: String,
        hostname: String,
        version: String,
        /// LAN addresses announced for same-network shortcuts.
        #[serde(default)]
        internal_addresses: Vec<String>,
    },

    /// Create a path and its terminal connection.
    Create {
        message_id: u64,
        path: String,
        #[serde(default)]
        fixed: bool,
        /// Role to attach the caller in immediately, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(default)]
        connect_address: String,
        #[serde(default)]
        connect_port: String,
    },

    /// Redeem a token and attach the calling daemon.
    Attach {
        message_id: u64,
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        connect_address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connect_port: Option<String>,
    },

    /// Redeem a token and attach another of the caller's daemons.
    RemoteAttach {
        message_id: u64,
        daemon_name: String,
        token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        connect_address: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connect_port: Option<String>,
    },

    /// Detach the calling daemon from a connection.
    Detach {
        message_id: u64,
        /// Fully-qualified connection name.
        name: String,
    },

    /// Detach another of the caller's daemons from a connection.
    RemoteDetach {
        message_id: u64,
        daemon_name: String,
        name: String,
    },

    /// Bulk attach: redeem a path token against the whole subtree.
    Connect {
        message_id: u64,
        token: String,
    },

    /// Bulk detach: drop every client attachment under a name prefix.
    Disconnect {
        message_id: u64,
        /// Fully-qualified name prefix.
        name: String,
    },

    /// Recursively delete a path subtree in the caller's namespace.
    Delete {
        message_id: u64,
        path: String,
    },

    /// Delete one of the caller's daemons and close its sessions.
    DeleteDaemon {
        message_id: u64,
        name: String,
    },

    /// Render the caller's subtree with role/peer annotations.
    Tree {
        message_id: u64,
        path: String,
    },

    /// List the caller's daemons, or the daemons touching a subtree.
    DaemonsList {
        message_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Read-only token resolution over a subtree.
    Import {
        message_id: u64,
        token: String,
    },

    /// Look up the public key/name behind a live identity hash.
    LookupIdentity {
        message_id: u64,
        identity: String,
    },

    /// Begin account bootstrap: create an unconfirmed user, email a code.
    Init {
        message_id: u64,
        email: String,
    },

    /// Exchange the emailed confirm code for the account token.
    Confirm {
        message_id: u64,
        email: String,
        code: String,
    },

    /// Request NAT hole-punch coordination on a connection.
    Punch {
        message_id: u64,
        name: String,
    },

    /// UDP-only: answers an `AddressRequest`; the tracker records the
    /// datagram's source as the externally observed address.
    AddressResponse {
        request_id: u64,
    },
}

impl ClientMessage {
    /// Returns the request correlation id, if this kind carries one.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Self::Alive | Self::AddressResponse { .. } => None,
            Self::Register { message_id, .. }
            | Self::Create { message_id, .. }
            | Self::Attach { message_id, .. }
            | Self::RemoteAttach { message_id, .. }
            | Self::Detach { message_id, .. }
            | Self::RemoteDetach { message_id, .. }
            | Self::Connect { message_id, .. }
            | Self::Disconnect { message_id, .. }
            | Self::Delete { message_id, .. }
            | Self::DeleteDaemon { message_id, .. }
            | Self::Tree { message_id, .. }
            | Self::DaemonsList { message_id, .. }
            | Self::Import { message_id, .. }
            | Self::LookupIdentity { message_id, .. }
            | Self::Init { message_id, .. }
            | Self::Confirm { message_id, .. }
            | Self::Punch { message_id, .. } => Some(*message_id),
        }
    }

    /// Short label for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Register { .. } => "register",
            Self::Create { .. } => "create",
            Self::Attach { .. } => "attach",
            Self::RemoteAttach { .. } => "remote_attach",
            Self::Detach { .. } => "detach",
            Self::RemoteDetach { .. } => "remote_detach",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Delete { .. } => "delete",
            Self::DeleteDaemon { .. } => "delete_daemon",
            Self::Tree { .. } => "tree",
            Self::DaemonsList { .. } => "daemons_list",
            Self::Import { .. } => "import",
            Self::LookupIdentity { .. } => "lookup_identity",
            Self::Init { .. } => "init",
            Self::Confirm { .. } => "confirm",
            Self::Punch { .. } => "punch",
            Self::AddressResponse { .. } => "address_response",
        }
    }
}

/// Messages sent by the tracker to daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Keepalive no-op.
    Alive,

    Registered {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    Created {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        path_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    Attached {
        message_id: u64,
        result: ResultCode,
        /// Fully-qualified name of the connection actually attached.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    Detached {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    ConnectDone {
        message_id: u64,
        result: ResultCode,
        attached: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    DisconnectDone {
        message_id: u64,
        result: ResultCode,
        detached: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    Deleted {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        updates: Option<ConnectionsList>,
    },

    DaemonDeleted {
        message_id: u64,
        result: ResultCode,
    },

    TreeView {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        root: Option<TreeNode>,
    },

    Daemons {
        message_id: u64,
        result: ResultCode,
        daemons: Vec<DaemonInfo>,
    },

    Imported {
        message_id: u64,
        result: ResultCode,
        entries: Vec<ImportEntry>,
    },

    Identity {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    InitDone {
        message_id: u64,
        result: ResultCode,
    },

    Confirmed {
        message_id: u64,
        result: ResultCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    PunchStarted {
        message_id: u64,
        result: ResultCode,
    },

    /// Push: fresh attachment snapshot for the receiving daemon.
    ConnectionsList {
        updates: ConnectionsList,
    },

    /// Push: answer over UDP with this request id.
    AddressRequest {
        request_id: u64,
    },

    /// Push: the peer's externally observed endpoint is known.
    PeerAvailable {
        name: String,
        address: String,
        port: u16,
    },
}

impl ServerMessage {
    /// Short label for structured logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::Registered { .. } => "registered",
            Self::Created { .. } => "created",
            Self::Attached { .. } => "attached",
            Self::Detached { .. } => "detached",
            Self::ConnectDone { .. } => "connect_done",
            Self::DisconnectDone { .. } => "disconnect_done",
            Self::Deleted { .. } => "deleted",
            Self::DaemonDeleted { .. } => "daemon_deleted",
            Self::TreeView { .. } => "tree_view",
            Self::Daemons { .. } => "daemons",
            Self::Imported { .. } => "imported",
            Self::Identity { .. } => "identity",
            Self::InitDone { .. } => "init_done",
            Self::Confirmed { .. } => "confirmed",
            Self::PunchStarted { .. } => "punch_started",
            Self::ConnectionsList { .. } => "connections_list",
            Self::AddressRequest { .. } => "address_request",
            Self::PeerAvailable { .. } => "peer_available",
        }
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// Per-daemon attachment snapshot pushed after topology changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsList {
    pub server_connections: Vec<ConnectionInfo>,
    pub client_connections: Vec<ConnectionInfo>,
}

impl ConnectionsList {
    /// The snapshot sent when a daemon is being deleted.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// One attachment in a connections-list snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Fully-qualified connection name.
    pub name: String,
    pub fixed: bool,
    pub connect_address: String,
    pub connect_port: String,
    /// Display names of live opposite-role daemons.
    pub peers: Vec<String>,
}

/// One node of a Tree response, depth-first, parent before children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    /// True when this path owns a connection.
    pub connection: bool,
    /// The caller's role on the connection, if attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<Role>,
    pub servers_number: u32,
    pub clients_number: u32,
    pub children: Vec<TreeNode>,
}

/// One entry of a Daemons-List response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub id: RecordId,
    pub name: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// One entry of an Import response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub name: String,
    pub fixed: bool,
    pub connect_address: String,
    pub connect_port: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_json_tagging() {
        let msg = ClientMessage::Punch {
            message_id: 9,
            name: "alice@example.com/db".into(),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"punch\""));
        assert!(json.contains("\"message_id\":9"));
    }

    #[test]
    fn test_message_id_extraction() {
        assert_eq!(ClientMessage::Alive.message_id(), None);
        assert_eq!(
            ClientMessage::AddressResponse { request_id: 3 }.message_id(),
            None
        );
        let msg = ClientMessage::Tree {
            message_id: 17,
            path: "/db".into(),
        };
        assert_eq!(msg.message_id(), Some(17));
    }

    #[test]
    fn test_result_code_wire_names() {
        let json = serde_json::to_string(&ResultCode::InvalidAddress).expect("serialize");
        assert_eq!(json, "\"invalid_address\"");
        let parsed: ResultCode = serde_json::from_str("\"not_attached\"").expect("parse");
        assert_eq!(parsed, ResultCode::NotAttached);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::Attached {
            message_id: 4,
            result: ResultCode::Accepted,
            name: Some("alice@example.com/db".into()),
            updates: Some(ConnectionsList {
                server_connections: vec![],
                client_connections: vec![ConnectionInfo {
                    name: "alice@example.com/db".into(),
                    fixed: false,
                    connect_address: "10.0.0.5".into(),
                    connect_port: "5432".into(),
                    peers: vec!["office".into()],
                }],
            }),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        let parsed: ServerMessage = serde_json::from_str(&json).expect("parse");
        match parsed {
            ServerMessage::Attached { result, updates, .. } => {
                assert_eq!(result, ResultCode::Accepted);
                let updates = updates.expect("updates present");
                assert_eq!(updates.client_connections.len(), 1);
            }
            other => panic!("expected Attached, got {other:?}"),
        }
    }
}
