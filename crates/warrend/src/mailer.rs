//! Outbound mail collaborator for account bootstrap.
//!
//! Delivery is behind a trait so deployments can plug in a real
//! transport. Send failures are logged by the caller and are never
//! fatal to the request that triggered them.

use async_trait::async_trait;
use tracing::info;

/// One outbound message.
#[derive(Debug, Clone)]
pub struct Mail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

/// Delivery seam for account-bootstrap mail.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> Result<(), MailerError>;
}

/// Mailer that writes the message to the log instead of delivering it.
///
/// Used by tests and standalone deployments without a mail relay.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Mail) -> Result<(), MailerError> {
        info!(
            to = %mail.to,
            subject = %mail.subject,
            body = %mail.text,
            "Mail logged instead of delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_mailer_always_succeeds() {
        let mailer = LogMailer;
        let result = mailer
            .send(Mail {
                to: "alice@example.com".into(),
                from: "tracker@warren.invalid".into(),
                subject: "Confirm your account".into(),
                text: "code: abcd1234".into(),
            })
            .await;
        assert!(result.is_ok());
    }
}
