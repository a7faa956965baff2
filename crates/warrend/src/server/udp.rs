//! UDP receive loop: address observation for punch pairs.
//!
//! The only datagram the tracker accepts is `AddressResponse`; its
//! source address is the sender's externally observed endpoint. When
//! both sides of a pair have been observed, each side is told the
//! other's endpoint over its TCP session.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_protocol::{decode_datagram, ClientMessage, ServerMessage};

use crate::registry::{PairUpdate, RegistryHandle};

/// Largest datagram worth reading; anything bigger is not ours.
const MAX_DATAGRAM: usize = 2048;

pub async fn run(socket: Arc<UdpSocket>, registry: RegistryHandle, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("UDP receiver shutting down");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };

                let request_id = match decode_datagram(&buf[..len]) {
                    Ok(ClientMessage::AddressResponse { request_id }) => request_id,
                    Ok(other) => {
                        debug!(src = %src, kind = other.kind(), "Unexpected datagram kind");
                        continue;
                    }
                    Err(e) => {
                        debug!(src = %src, error = %e, "Undecodable datagram");
                        continue;
                    }
                };

                match registry.update_pair(request_id, src).await {
                    PairUpdate::NotFound => {
                        debug!(src = %src, request_id, "Stale or unknown address response");
                    }
                    PairUpdate::Partial => {
                        debug!(src = %src, request_id, "First side of pair observed");
                    }
                    PairUpdate::Matched(pair) => {
                        info!(name = %pair.name, "Punch pair matched");

                        let to_client = ServerMessage::PeerAvailable {
                            name: pair.name.clone(),
                            address: pair.server.addr.ip().to_string(),
                            port: pair.server.addr.port(),
                        };
                        let to_server = ServerMessage::PeerAvailable {
                            name: pair.name.clone(),
                            address: pair.client.addr.ip().to_string(),
                            port: pair.client.addr.port(),
                        };
                        if pair.client.tx.send(to_client).await.is_err() {
                            debug!(session_id = %pair.client.session_id, "Client gone before peer notify");
                        }
                        if pair.server.tx.send(to_server).await.is_err() {
                            debug!(session_id = %pair.server.session_id, "Server gone before peer notify");
                        }
                    }
                }
            }
        }
    }
}
