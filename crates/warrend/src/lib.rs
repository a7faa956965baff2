//! Warren Daemon - rendezvous/tracker server for tunnel daemons
//!
//! The daemon accepts persistent TLS sessions from peer daemons, tracks
//! their live state in an in-memory registry, brokers attachments on a
//! persisted path/connection graph, and coordinates NAT hole punching
//! over a companion UDP socket.
//!
//! Modules:
//! - `config` - environment-driven runtime configuration
//! - `tls` - server certificate loading and acceptor construction
//! - `registry` - the authoritative in-memory state machine (actor)
//! - `server` - TLS-TCP session server and UDP address-discovery socket
//! - `handlers` - one transaction per request kind
//! - `locks` - per-connection-name serialization of persisted writes
//! - `connlist` - per-daemon attachment snapshot builder
//! - `sweeper` - punch-pair expiry loop
//! - `mailer` - outbound email collaborator for account bootstrap
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod connlist;
pub mod handlers;
pub mod locks;
pub mod mailer;
pub mod registry;
pub mod server;
pub mod sweeper;
pub mod tls;
