//! Init and Confirm: account bootstrap over email.

use tracing::{info, warn};

use warren_core::{generate_confirm_code, generate_token, grammar, User};
use warren_protocol::{ResultCode, ServerMessage};

use crate::mailer::Mail;

use super::{HandlerCtx, HandlerError};

pub async fn handle_init(
    ctx: &HandlerCtx,
    message_id: u64,
    email: String,
) -> Result<ServerMessage, HandlerError> {
    let done = |result| ServerMessage::InitDone { message_id, result };

    if !grammar::validate_email(&email) {
        return Ok(done(ResultCode::Rejected));
    }

    let code = generate_confirm_code();
    match ctx.store.user_by_email(&email).await? {
        Some(user) if user.confirmed => return Ok(done(ResultCode::NameExists)),
        Some(mut user) => {
            // Unconfirmed retry: mint a fresh token and code.
            user.token = generate_token();
            user.confirm_code = Some(code.clone());
            ctx.store.save_user(user).await?;
        }
        None => {
            ctx.store
                .save_user(User::unconfirmed(email.clone(), generate_token(), code.clone()))
                .await?;
        }
    }

    let mail = Mail {
        to: email.clone(),
        from: ctx.mail_from.clone(),
        subject: "Confirm your account".into(),
        text: format!("Your confirmation code is {code}"),
    };
    if let Err(e) = ctx.mailer.send(mail).await {
        // Delivery failure is not a protocol failure; the user can re-Init.
        warn!(email = %email, error = %e, "Confirmation mail not delivered");
    }

    info!(email = %email, "Account bootstrap started");
    Ok(done(ResultCode::Accepted))
}

pub async fn handle_confirm(
    ctx: &HandlerCtx,
    message_id: u64,
    email: String,
    code: String,
) -> Result<ServerMessage, HandlerError> {
    let mut user = match ctx.store.user_by_email(&email).await? {
        Some(u) if !u.confirmed && u.confirm_code.as_deref() == Some(code.as_str()) => u,
        _ => {
            return Ok(ServerMessage::Confirmed {
                message_id,
                result: ResultCode::Rejected,
                token: None,
            })
        }
    };

    user.confirmed = true;
    user.confirm_code = None;
    let token = user.token.clone();
    ctx.store.save_user(user).await?;

    info!(email = %email, "Account confirmed");
    Ok(ServerMessage::Confirmed {
        message_id,
        result: ResultCode::Accepted,
        token: Some(token),
    })
}
