//! Background expiry loop for punch pairs.
//!
//! Keepalive/idle deadlines are enforced per session inside each
//! connection task; the only global sweep is punch-pair expiry, which
//! runs here on a ~1 second tick.

use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::RegistryHandle;

/// Pair expiry check interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the punch-pair expiry task.
///
/// The task runs until the cancellation token fires or the registry
/// shuts down.
pub fn spawn_pair_sweeper(registry: RegistryHandle, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Pair sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if !registry.is_connected() {
                        debug!("Pair sweeper stopping: registry channel closed");
                        break;
                    }
                    registry.sweep_pairs(Instant::now()).await;
                }
            }
        }
    })
}
