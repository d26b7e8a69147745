use async_trait::async_trait;
use thiserror::Error;

use crate::types::{EmailContent, PushContent, RecipientProfile};

/// Errors returned by a recipient profile backend.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("recipient {0} not found")]
    NotFound(String),
    #[error("profile backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors returned by a channel transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport not configured: {0}")]
    NotConfigured(&'static str),
    #[error("provider rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Looks up contact details and preferences for a recipient.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn fetch_profile(&self, recipient_id: &str) -> Result<RecipientProfile, ProfileError>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, address: &str, content: &EmailContent) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send_push(&self, token: &str, content: &PushContent) -> Result<(), DeliveryError>;
}
