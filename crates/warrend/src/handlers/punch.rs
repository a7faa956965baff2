//! Punch: start NAT hole-punch coordination on a connection.
//!
//! The handler only asks the registry to create the pair; eligibility
//! (caller is an unmatched client, a server is waiting) is re-checked
//! inside the actor so an interleaved attach or disconnect cannot race
//! the decision.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};

use warren_core::grammar;
use warren_protocol::{encode_datagram, ResultCode, ServerMessage};

use crate::registry::RegistryError;

use super::{HandlerCtx, HandlerError};

pub async fn handle(
    ctx: &HandlerCtx,
    message_id: u64,
    name: String,
) -> Result<ServerMessage, HandlerError> {
    let done = |result| ServerMessage::PunchStarted { message_id, result };

    if grammar::validate_connection_name(&name).is_none() {
        return Ok(done(ResultCode::InvalidPath));
    }

    let pair = match ctx
        .registry
        .create_pair(name.clone(), ctx.session_id, Instant::now() + ctx.pair_ttl)
        .await
    {
        Ok(p) => p,
        Err(RegistryError::PunchNotEligible)
        | Err(RegistryError::NoWaitingServer)
        | Err(RegistryError::SessionNotFound(_)) => {
            debug!(session_id = %ctx.session_id, name = %name, "Punch not eligible");
            return Ok(done(ResultCode::Rejected));
        }
        Err(e) => return Err(e.into()),
    };

    // Address requests travel as unframed UDP datagrams to each side's
    // TCP-observed remote address; the sources of the answering datagrams
    // become the externally observed addresses.
    let client_ok =
        send_request(ctx, pair.client_request, pair.client.remote_addr, &name).await;
    let server_ok =
        send_request(ctx, pair.server_request, pair.server.remote_addr, &name).await;
    if !client_ok || !server_ok {
        // A side was unreachable mid-setup; the pair expires on its own.
        return Ok(done(ResultCode::Rejected));
    }

    info!(session_id = %ctx.session_id, name = %name, "Punch started");
    Ok(done(ResultCode::Accepted))
}

async fn send_request(ctx: &HandlerCtx, request_id: u64, addr: SocketAddr, name: &str) -> bool {
    let payload = match encode_datagram(&ServerMessage::AddressRequest { request_id }) {
        Ok(p) => p,
        Err(e) => {
            warn!(name, error = %e, "Failed to encode address request");
            return false;
        }
    };
    match ctx.punch_socket.send_to(&payload, addr).await {
        Ok(_) => true,
        Err(e) => {
            warn!(name, addr = %addr, error = %e, "Failed to send address request");
            false
        }
    }
}
