use async_trait::async_trait;
use mutuus_notify_core::{DeliveryError, PushContent, PushSender};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::http::{parse_json, ProviderError};

pub const DEFAULT_ONESIGNAL_BASE_URL: &str = "https://onesignal.com/api/v1/";

/// Push transport backed by the OneSignal REST API.
#[derive(Clone)]
pub struct OneSignalClient {
    http: Client,
    base_url: Url,
    app_id: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct Localized<'a> {
    en: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateNotificationRequest<'a> {
    app_id: &'a str,
    include_player_ids: [&'a str; 1],
    headings: Localized<'a>,
    contents: Localized<'a>,
}

#[derive(Debug, Deserialize)]
struct CreateNotificationResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    errors: Option<Value>,
}

impl OneSignalClient {
    pub fn new(
        app_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Url,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            app_id: app_id.into(),
            api_key: api_key.into(),
        }
    }

    /// Sends a push to a single player id and returns the notification id.
    ///
    /// OneSignal answers `200` with an `errors` field and no id when no recipient was
    /// reachable; that case is reported as a rejection.
    pub async fn send(&self, token: &str, content: &PushContent) -> Result<String, ProviderError> {
        let url = self.base_url.join("notifications")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("Basic {}", self.api_key))
            .json(&CreateNotificationRequest {
                app_id: &self.app_id,
                include_player_ids: [token],
                headings: Localized { en: &content.title },
                contents: Localized { en: &content.body },
            })
            .send()
            .await?;

        let body: CreateNotificationResponse = parse_json(response).await?;
        match body.id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(id),
            None => Err(ProviderError::Status {
                status: StatusCode::OK,
                body: body
                    .errors
                    .map(|errors| errors.to_string())
                    .unwrap_or_else(|| String::from("missing notification id")),
            }),
        }
    }
}

#[async_trait]
impl PushSender for OneSignalClient {
    async fn send_push(&self, token: &str, content: &PushContent) -> Result<(), DeliveryError> {
        let id = self.send(token, content).await?;
        debug!(stage = "delivery", channel = "push", provider = "onesignal", notification_id = %id, "push accepted");
        Ok(())
    }
}
