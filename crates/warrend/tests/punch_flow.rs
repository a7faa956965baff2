//! Integration tests for NAT hole-punch coordination.
//!
//! A live server and client are set up on one connection, then the punch
//! transaction is driven end to end: eligibility, the address-request
//! datagrams delivered to both sides, address observation, matching, and
//! expiry. Each fake daemon holds a real UDP socket whose bound address
//! doubles as the session's observed remote address, so the datagrams
//! land where a real deployment would send them.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warren_core::{MemoryStore, Role, SessionId, SharedStore};
use warren_protocol::{decode_server_datagram, ClientMessage, ResultCode, ServerMessage};
use warrend::handlers::{self, HandlerCtx};
use warrend::locks::NameLocks;
use warrend::mailer::LogMailer;
use warrend::registry::{spawn_registry, PairUpdate, RegistryHandle};

// ============================================================================
// Test Helpers
// ============================================================================

async fn open_session(
    registry: &RegistryHandle,
    store: &SharedStore,
    n: u64,
    pair_ttl: Duration,
) -> (HandlerCtx, mpsc::Receiver<ServerMessage>, UdpSocket) {
    // The daemon-side socket; its address is what the tracker observes.
    let daemon_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind daemon udp");
    let remote_addr = daemon_socket.local_addr().expect("local addr");

    let session_id = SessionId::new(n);
    let (tx, rx) = mpsc::channel(64);
    registry
        .add_client(session_id, tx, CancellationToken::new(), remote_addr)
        .await
        .expect("session admitted");

    let ctx = HandlerCtx {
        session_id,
        registry: registry.clone(),
        store: Arc::clone(store),
        mailer: Arc::new(LogMailer),
        punch_socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind tracker udp")),
        name_locks: Arc::new(NameLocks::new()),
        pair_ttl,
        mail_from: "tracker@warren.invalid".into(),
    };
    (ctx, rx, daemon_socket)
}

async fn send(ctx: &HandlerCtx, msg: ClientMessage) -> ServerMessage {
    handlers::dispatch(ctx, msg)
        .await
        .expect("no infrastructure failure")
        .expect("response frame owed")
}

/// Reads the next address-request datagram off a daemon's socket.
async fn address_request(socket: &UdpSocket) -> Option<u64> {
    let mut buf = [0u8; 2048];
    match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _source))) => match decode_server_datagram(&buf[..len]) {
            Ok(ServerMessage::AddressRequest { request_id }) => Some(request_id),
            _ => None,
        },
        _ => None,
    }
}

/// One server session and one client session live on
/// `alice@example.com/svc`, ready to punch.
async fn punch_ready(
    pair_ttl: Duration,
) -> (
    RegistryHandle,
    SharedStore,
    (HandlerCtx, mpsc::Receiver<ServerMessage>, UdpSocket),
    (HandlerCtx, mpsc::Receiver<ServerMessage>, UdpSocket),
) {
    let registry = spawn_registry(64);
    let store = MemoryStore::shared();

    let (alice, alice_rx, alice_socket) = open_session(&registry, &store, 1, pair_ttl).await;
    send(
        &alice,
        ClientMessage::Init {
            message_id: 1,
            email: "alice@example.com".into(),
        },
    )
    .await;
    let code = store
        .user_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap()
        .confirm_code
        .unwrap();
    let alice_token = match send(
        &alice,
        ClientMessage::Confirm {
            message_id: 2,
            email: "alice@example.com".into(),
            code,
        },
    )
    .await
    {
        ServerMessage::Confirmed { token: Some(t), .. } => t,
        other => panic!("expected Confirmed, got {other:?}"),
    };
    send(
        &alice,
        ClientMessage::Register {
            message_id: 3,
            token: alice_token,
            name: "home".into(),
            identity: "id-a".into(),
            key: "key-a".into(),
            hostname: "h".into(),
            version: "1".into(),
            internal_addresses: vec![],
        },
    )
    .await;
    let path_token = match send(
        &alice,
        ClientMessage::Create {
            message_id: 4,
            path: "/svc".into(),
            fixed: false,
            role: Some(Role::Server),
            connect_address: "10.0.0.5".into(),
            connect_port: "80".into(),
        },
    )
    .await
    {
        ServerMessage::Created {
            path_token: Some(t),
            ..
        } => t,
        other => panic!("expected Created, got {other:?}"),
    };

    let (bob, bob_rx, bob_socket) = open_session(&registry, &store, 2, pair_ttl).await;
    send(
        &bob,
        ClientMessage::Init {
            message_id: 5,
            email: "bob@example.com".into(),
        },
    )
    .await;
    let code = store
        .user_by_email("bob@example.com")
        .await
        .unwrap()
        .unwrap()
        .confirm_code
        .unwrap();
    let bob_token = match send(
        &bob,
        ClientMessage::Confirm {
            message_id: 6,
            email: "bob@example.com".into(),
            code,
        },
    )
    .await
    {
        ServerMessage::Confirmed { token: Some(t), .. } => t,
        other => panic!("expected Confirmed, got {other:?}"),
    };
    send(
        &bob,
        ClientMessage::Register {
            message_id: 7,
            token: bob_token,
            name: "laptop".into(),
            identity: "id-b".into(),
            key: "key-b".into(),
            hostname: "h".into(),
            version: "1".into(),
            internal_addresses: vec![],
        },
    )
    .await;
    send(
        &bob,
        ClientMessage::Attach {
            message_id: 8,
            token: path_token,
            connect_address: None,
            connect_port: None,
        },
    )
    .await;

    (
        registry,
        store,
        (alice, alice_rx, alice_socket),
        (bob, bob_rx, bob_socket),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_punch_match_end_to_end() {
    let (registry, _store, (_alice, _alice_rx, alice_socket), (bob, _bob_rx, bob_socket)) =
        punch_ready(Duration::from_secs(5)).await;

    let response = send(
        &bob,
        ClientMessage::Punch {
            message_id: 20,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::Accepted,
            ..
        }
    ));

    // Each side's request arrives as a UDP datagram on its own socket.
    let client_request = address_request(&bob_socket).await.expect("client address request");
    let server_request = address_request(&alice_socket)
        .await
        .expect("server address request");
    assert_ne!(client_request, server_request);

    // The UDP loop would record each datagram's source like this.
    let client_ext: SocketAddr = "203.0.113.10:50000".parse().unwrap();
    let server_ext: SocketAddr = "198.51.100.7:60000".parse().unwrap();
    assert!(matches!(
        registry.update_pair(client_request, client_ext).await,
        PairUpdate::Partial
    ));
    let matched = match registry.update_pair(server_request, server_ext).await {
        PairUpdate::Matched(pair) => pair,
        other => panic!("expected Matched, got {other:?}"),
    };
    assert_eq!(matched.name, "alice@example.com/svc");
    assert_eq!(matched.client.addr, client_ext);
    assert_eq!(matched.server.addr, server_ext);

    // Consumed: neither request id resolves again.
    assert!(matches!(
        registry.update_pair(client_request, client_ext).await,
        PairUpdate::NotFound
    ));

    // A matched client is no longer eligible.
    let response = send(
        &bob,
        ClientMessage::Punch {
            message_id: 21,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::Rejected,
            ..
        }
    ));
}

#[tokio::test]
async fn test_punch_requires_waiting_server() {
    let (registry, _store, (alice, _alice_rx, _alice_socket), (bob, _bob_rx, _bob_socket)) =
        punch_ready(Duration::from_secs(5)).await;

    // The server is the wrong side to initiate.
    let response = send(
        &alice,
        ClientMessage::Punch {
            message_id: 1,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::Rejected,
            ..
        }
    ));

    // Grammar is checked before eligibility.
    let response = send(
        &bob,
        ClientMessage::Punch {
            message_id: 2,
            name: "/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::InvalidPath,
            ..
        }
    ));

    // With the server gone there is nobody to rendezvous with.
    registry.remove_client(alice.session_id).await;
    let response = send(
        &bob,
        ClientMessage::Punch {
            message_id: 3,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::Rejected,
            ..
        }
    ));
}

#[tokio::test]
async fn test_expired_pair_is_swept() {
    let (registry, _store, (_alice, _alice_rx, alice_socket), (bob, _bob_rx, bob_socket)) =
        punch_ready(Duration::from_millis(50)).await;

    send(
        &bob,
        ClientMessage::Punch {
            message_id: 1,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    let client_request = address_request(&bob_socket).await.expect("client address request");
    let _ = address_request(&alice_socket).await;

    registry.sweep_pairs(Instant::now() + Duration::from_secs(1)).await;

    let ext: SocketAddr = "203.0.113.10:50000".parse().unwrap();
    assert!(matches!(
        registry.update_pair(client_request, ext).await,
        PairUpdate::NotFound
    ));

    // An abandoned pair does not burn the client's eligibility.
    let response = send(
        &bob,
        ClientMessage::Punch {
            message_id: 2,
            name: "alice@example.com/svc".into(),
        },
    )
    .await;
    assert!(matches!(
        response,
        ServerMessage::PunchStarted {
            result: ResultCode::Accepted,
            ..
        }
    ));
}
