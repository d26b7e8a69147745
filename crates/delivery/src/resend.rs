use async_trait::async_trait;
use mutuus_notify_core::{DeliveryError, EmailContent, EmailSender};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::http::{parse_json, ProviderError};

pub const DEFAULT_RESEND_BASE_URL: &str = "https://api.resend.com/";

/// E-mail transport backed by the Resend API.
#[derive(Clone)]
pub struct ResendClient {
    http: Client,
    base_url: Url,
    api_key: String,
    from: String,
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: String,
}

impl ResendClient {
    pub fn new(
        api_key: impl Into<String>,
        from: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            api_key: api_key.into(),
            from: from.into(),
        }
    }

    /// Sends one message and returns the provider's message id.
    pub async fn send(&self, address: &str, content: &EmailContent) -> Result<String, ProviderError> {
        let url = self.base_url.join("emails")?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&SendEmailRequest {
                from: &self.from,
                to: [address],
                subject: &content.subject,
                html: &content.html,
            })
            .send()
            .await?;

        let body: SendEmailResponse = parse_json(response).await?;
        Ok(body.id)
    }
}

#[async_trait]
impl EmailSender for ResendClient {
    async fn send_email(&self, address: &str, content: &EmailContent) -> Result<(), DeliveryError> {
        let id = self.send(address, content).await?;
        debug!(stage = "delivery", channel = "email", provider = "resend", message_id = %id, "email accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> ResendClient {
        ResendClient::new(
            "re_test",
            "Mutuus <info@mutuus-app.de>",
            Url::parse(&server.url("/")).expect("url"),
            Client::builder().build().expect("client"),
        )
    }

    fn content() -> EmailContent {
        EmailContent {
            subject: "Auftrag angenommen: Umzug".to_string(),
            html: "<p>Max hat deinen Auftrag angenommen.</p>".to_string(),
        }
    }

    #[tokio::test]
    async fn posts_message_with_bearer_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/emails")
                    .header("Authorization", "Bearer re_test")
                    .json_body(json!({
                        "from": "Mutuus <info@mutuus-app.de>",
                        "to": ["helper@example.com"],
                        "subject": "Auftrag angenommen: Umzug",
                        "html": "<p>Max hat deinen Auftrag angenommen.</p>"
                    }));
                then.status(200).json_body(json!({ "id": "email-1" }));
            })
            .await;

        let id = client(&server)
            .send("helper@example.com", &content())
            .await
            .expect("send email");
        mock.assert_async().await;
        assert_eq!(id, "email-1");
    }

    #[tokio::test]
    async fn rejection_maps_to_delivery_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/emails");
                then.status(422).body("invalid `to` field");
            })
            .await;

        let err = client(&server)
            .send_email("not-an-address", &content())
            .await
            .expect_err("should be rejected");
        match err {
            DeliveryError::Rejected { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "invalid `to` field");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
