//! TLS-TCP and UDP listeners for the tracker.
//!
//! The server:
//! - Accepts TLS connections on the TCP socket and spawns a
//!   `ConnectionTask` per session
//! - Receives address-response datagrams on the UDP socket and feeds
//!   them into punch-pair matching; the same socket is the send path
//!   for address-request datagrams
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │  TrackerServer  │      │    UdpSocket    │
//! │   TcpListener   │      │ (punch dgrams)  │
//! └───────┬─────────┘      └────────┬────────┘
//!         │ accept + TLS            │ recv_from / send_to
//!         ▼                         ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ ConnectionTask  │─────▶│  RegistryHandle │◀─ punch matching
//! │  (per session)  │      │                 │
//! └─────────────────┘      └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Per-session errors are logged and close only that session

mod connection;
mod udp;

pub use connection::ConnectionTask;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warren_core::{SessionId, SharedStore};

use crate::config::Config;
use crate::handlers::HandlerCtx;
use crate::locks::NameLocks;
use crate::mailer::Mailer;
use crate::registry::{RegistryError, RegistryHandle};
use crate::tls::{self, TlsError};

/// Outbound channel depth per session.
const SESSION_BUFFER: usize = 64;

/// The tracker's listening front end.
pub struct TrackerServer {
    config: Config,
    registry: RegistryHandle,
    store: SharedStore,
    mailer: Arc<dyn Mailer>,
    name_locks: Arc<NameLocks>,
    cancel_token: CancellationToken,
    session_counter: AtomicU64,
}

impl TrackerServer {
    pub fn new(
        config: Config,
        registry: RegistryHandle,
        store: SharedStore,
        mailer: Arc<dyn Mailer>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            mailer,
            name_locks: Arc::new(NameLocks::new()),
            cancel_token,
            session_counter: AtomicU64::new(1),
        }
    }

    /// Runs both listeners until the cancellation token fires.
    ///
    /// Binding either socket or loading the TLS material is fatal; every
    /// later failure is per-session.
    pub async fn run(&self) -> Result<(), ServerError> {
        let acceptor = tls::build_acceptor(&self.config.cert_path, &self.config.key_path)?;

        let listener = TcpListener::bind(self.config.tcp_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.config.tcp_addr,
                source: e,
            })?;
        let udp = Arc::new(UdpSocket::bind(self.config.udp_addr).await.map_err(|e| {
            ServerError::Bind {
                addr: self.config.udp_addr,
                source: e,
            }
        })?);

        info!(
            tcp = %self.config.tcp_addr,
            udp = %self.config.udp_addr,
            "Tracker listening"
        );

        tokio::spawn(udp::run(
            Arc::clone(&udp),
            self.registry.clone(),
            self.cancel_token.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            self.handle_connection(
                                stream,
                                remote_addr,
                                acceptor.clone(),
                                Arc::clone(&udp),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawns the per-session task: TLS handshake, registry admission,
    /// then the framed message loop.
    fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        remote_addr: SocketAddr,
        acceptor: TlsAcceptor,
        udp: Arc<UdpSocket>,
    ) {
        let session_id = SessionId::new(self.session_counter.fetch_add(1, Ordering::Relaxed));
        let registry = self.registry.clone();
        let store = Arc::clone(&self.store);
        let mailer = Arc::clone(&self.mailer);
        let name_locks = Arc::clone(&self.name_locks);
        let config = self.config.clone();
        let cancel = self.cancel_token.child_token();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let (tx, rx) = mpsc::channel(SESSION_BUFFER);
            match registry
                .add_client(session_id, tx, cancel.clone(), remote_addr)
                .await
            {
                Ok(()) => {}
                Err(RegistryError::RegistryFull { max }) => {
                    warn!(remote = %remote_addr, max, "Session rejected: registry full");
                    return;
                }
                Err(e) => {
                    warn!(remote = %remote_addr, error = %e, "Session admission failed");
                    return;
                }
            }

            debug!(session_id = %session_id, remote = %remote_addr, "Session opened");

            let ctx = HandlerCtx {
                session_id,
                registry: registry.clone(),
                store,
                mailer,
                punch_socket: udp,
                name_locks,
                pair_ttl: config.pair_ttl,
                mail_from: config.mail_from.clone(),
            };
            ConnectionTask::new(
                tls_stream,
                rx,
                ctx,
                cancel,
                config.ping_interval,
                config.pong_interval,
            )
            .run()
            .await;

            // Full cascade: waiting entries, pairs, daemon runtime.
            registry.remove_client(session_id).await;
            info!(session_id = %session_id, remote = %remote_addr, "Session closed");
        });
    }
}

/// Errors that are fatal to server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:4433".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
        };
        assert!(err.to_string().contains("127.0.0.1:4433"));
        assert!(err.to_string().contains("address in use"));
    }
}
