//! Live tracker state using the actor pattern.
//!
//! The registry is the authoritative in-memory state machine: live
//! sessions, daemon runtime records, identity claims, per-connection
//! waiting entries, and short-lived punch pairs. It receives commands
//! via a tokio mpsc channel and processes them sequentially, so every
//! mutation - including the total session-removal cascade - is atomic
//! with respect to other commands.
//!
//! Registry state is a derived cache, fully reconstructible from the
//! persisted graph plus open sessions.

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{
    ConnState, DaemonBinding, Evicted, MatchedPair, PairCreated, PairEnd, PairUpdate, PeerInfo,
    Presence, RegistryCommand, RegistryError, SessionLink, SessionSender, SessionSnapshot,
    WaitingSnapshot,
};
pub use handle::RegistryHandle;

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 256;

/// Spawns the registry actor and returns a handle for interaction.
pub fn spawn_registry(max_sessions: usize) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = RegistryActor::new(cmd_rx, max_sessions);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx)
}
