//! Per-session message loop.
//!
//! Each accepted TLS stream gets one `ConnectionTask` that:
//! - Decodes length-prefixed frames and dispatches them to the handlers
//! - Delivers pushes queued on the session's outbound channel
//! - Enforces the keepalive contract: a synthetic `Alive` goes out when
//!   nothing has been sent for `ping_interval`, and the session closes
//!   when nothing has been received for `pong_interval`
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Decode and dispatch failures are logged; only transport failures
//!   and deadline misses end the loop

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tokio_rustls::server::TlsStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_protocol::{ClientMessage, ServerMessage, TrackerCodec};

use crate::handlers::{self, HandlerCtx};

/// Deadline check cadence.
const TICK: Duration = Duration::from_millis(250);

/// One session's framed transport loop.
pub struct ConnectionTask {
    framed: Framed<TlsStream<TcpStream>, TrackerCodec>,
    outbound: mpsc::Receiver<ServerMessage>,
    ctx: HandlerCtx,
    cancel: CancellationToken,
    ping_interval: Duration,
    pong_interval: Duration,
}

impl ConnectionTask {
    pub fn new(
        stream: TlsStream<TcpStream>,
        outbound: mpsc::Receiver<ServerMessage>,
        ctx: HandlerCtx,
        cancel: CancellationToken,
        ping_interval: Duration,
        pong_interval: Duration,
    ) -> Self {
        Self {
            framed: Framed::new(stream, TrackerCodec::default()),
            outbound,
            ctx,
            cancel,
            ping_interval,
            pong_interval,
        }
    }

    /// Runs the loop until the peer disconnects, a deadline passes, or
    /// the cancel token fires.
    pub async fn run(mut self) {
        let mut send_by = Instant::now() + self.ping_interval;
        let mut receive_by = Instant::now() + self.pong_interval;
        let mut ticker = interval(TICK);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Final pushes (e.g. the empty snapshot of a deleted
                    // daemon) may still be queued; deliver them first.
                    while let Ok(msg) = self.outbound.try_recv() {
                        if self.framed.send(msg).await.is_err() {
                            break;
                        }
                    }
                    debug!(session_id = %self.ctx.session_id, "Session cancelled");
                    break;
                }

                queued = self.outbound.recv() => {
                    let Some(msg) = queued else { break };
                    if let Err(e) = self.framed.send(msg).await {
                        debug!(session_id = %self.ctx.session_id, error = %e, "Push failed");
                        break;
                    }
                    send_by = Instant::now() + self.ping_interval;
                }

                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            receive_by = Instant::now() + self.pong_interval;
                            if let Some(deadline) = self.dispatch(msg).await {
                                send_by = deadline;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(session_id = %self.ctx.session_id, error = %e, "Frame decode failed");
                            break;
                        }
                        None => {
                            debug!(session_id = %self.ctx.session_id, "Peer closed the stream");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    if now >= receive_by {
                        debug!(session_id = %self.ctx.session_id, "Keepalive deadline missed");
                        break;
                    }
                    if now >= send_by {
                        if self.framed.send(ServerMessage::Alive).await.is_err() {
                            break;
                        }
                        send_by = now + self.ping_interval;
                    }
                }
            }
        }
    }

    /// Dispatches one inbound message; returns the refreshed send
    /// deadline when a response frame went out.
    async fn dispatch(&mut self, msg: ClientMessage) -> Option<Instant> {
        match handlers::dispatch(&self.ctx, msg).await {
            Ok(Some(response)) => {
                debug!(
                    session_id = %self.ctx.session_id,
                    kind = response.kind(),
                    "Sending response"
                );
                if self.framed.send(response).await.is_err() {
                    return None;
                }
                Some(Instant::now() + self.ping_interval)
            }
            Ok(None) => None,
            Err(e) => {
                // Infrastructure failure: no answer; the client retries on
                // its own timeout.
                warn!(session_id = %self.ctx.session_id, error = %e, "Request dropped");
                None
            }
        }
    }
}
