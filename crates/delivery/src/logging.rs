use async_trait::async_trait;
use mutuus_notify_core::{DeliveryError, EmailContent, EmailSender, PushContent, PushSender};
use tracing::info;

/// Sender that records deliveries in the log instead of contacting a provider.
///
/// Used for channels without configured credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSender;

#[async_trait]
impl EmailSender for LoggingSender {
    async fn send_email(&self, address: &str, content: &EmailContent) -> Result<(), DeliveryError> {
        info!(
            stage = "delivery",
            channel = "email",
            provider = "log",
            %address,
            subject = %content.subject,
            "email not sent, no provider configured"
        );
        Ok(())
    }
}

#[async_trait]
impl PushSender for LoggingSender {
    async fn send_push(&self, token: &str, content: &PushContent) -> Result<(), DeliveryError> {
        info!(
            stage = "delivery",
            channel = "push",
            provider = "log",
            %token,
            title = %content.title,
            "push not sent, no provider configured"
        );
        Ok(())
    }
}
