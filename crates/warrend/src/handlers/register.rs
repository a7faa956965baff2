//! Register: bind a session to an account and a daemon identity.

use tracing::info;

use warren_core::{grammar, DaemonRecord};
use warren_protocol::{ResultCode, ServerMessage};

use crate::connlist;
use crate::registry::{DaemonBinding, RegistryError};

use super::{HandlerCtx, HandlerError};

#[allow(clippy::too_many_arguments)]
pub async fn handle(
    ctx: &HandlerCtx,
    message_id: u64,
    token: String,
    name: String,
    identity: String,
    key: String,
    hostname: String,
    version: String,
    internal_addresses: Vec<String>,
) -> Result<ServerMessage, HandlerError> {
    let reject = |result| ServerMessage::Registered {
        message_id,
        result,
        email: None,
        name: None,
    };

    if !grammar::validate_name(&name) || identity.is_empty() {
        return Ok(reject(ResultCode::Rejected));
    }

    let user = match ctx.store.user_by_token(&token).await? {
        Some(u) if u.confirmed => u,
        _ => return Ok(reject(ResultCode::Rejected)),
    };

    // Found-or-created: re-registering an existing daemon name rebinds it.
    let daemon = match ctx.store.daemon_by_user_and_name(user.id, &name).await? {
        Some(d) => d,
        None => {
            let id = ctx
                .store
                .save_daemon(DaemonRecord::new(user.id, name.clone()))
                .await?;
            ctx.store
                .daemon_by_id(id)
                .await?
                .ok_or(warren_core::StoreError::NotFound { kind: "daemon", id })?
        }
    };

    let binding = DaemonBinding {
        daemon_id: daemon.id,
        user_id: user.id,
        email: user.email.clone(),
        name: daemon.name.clone(),
        identity,
        key,
        hostname,
        version,
        internal_addresses,
    };
    match ctx.registry.register_daemon(ctx.session_id, binding).await {
        Ok(()) => {}
        Err(RegistryError::IdentityMismatch) => return Ok(reject(ResultCode::Rejected)),
        Err(RegistryError::SessionNotFound(_)) => return Ok(reject(ResultCode::Rejected)),
        Err(e) => return Err(e.into()),
    }

    info!(
        session_id = %ctx.session_id,
        email = %user.email,
        daemon = %daemon.name,
        "Daemon registered"
    );

    // First snapshot goes to the session right away; it has no response
    // field to ride in because the Registered frame predates the binding.
    connlist::push_to_daemon(&ctx.store, &ctx.registry, daemon.id, None).await;

    Ok(ServerMessage::Registered {
        message_id,
        result: ResultCode::Accepted,
        email: Some(user.email),
        name: Some(daemon.name),
    })
}
