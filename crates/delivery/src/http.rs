use mutuus_notify_core::DeliveryError;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors produced by the provider HTTP clients.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl From<ProviderError> for DeliveryError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Status { status, body } => DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            },
            other => DeliveryError::Transport(Box::new(other)),
        }
    }
}

pub(crate) async fn parse_json<T>(response: Response) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ProviderError::Status { status, body });
    }

    Ok(response.json().await?)
}
