use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    Json,
};
use metrics::{counter, histogram};
use mutuus_notify_core::{
    DeliveryStatus, DispatchError, DispatchReport, NotificationIntent, PayloadData, Priority,
    ProfileError,
};
use mutuus_notify_storage::NewNotificationEvent;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const STORE_RETRY_AFTER_SECS: u64 = 5;

/// Body accepted by `POST /api/notifications/send`.
#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(rename = "type")]
    event_type: String,
    user_id: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    dedupe_key: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

impl SendRequest {
    fn into_intent(self) -> Result<NotificationIntent, ProblemResponse> {
        let payload_data = PayloadData::from_json(self.data).map_err(|err| {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_payload_data", err.to_string())
        })?;

        Ok(NotificationIntent {
            event_type: self.event_type,
            recipient_id: self.user_id,
            payload_data,
            priority: self.priority,
            dedupe_key: self.dedupe_key,
            language: self.language,
        })
    }
}

pub async fn handle(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<DispatchReport>), ProblemResponse> {
    let request: SendRequest = serde_json::from_slice(&body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse request: {err}"),
        )
    })?;
    let intent = request.into_intent()?;

    let start = Instant::now();
    let result = state.engine().dispatch(&intent).await;
    histogram!("dispatch_latency_seconds").record(start.elapsed().as_secs_f64());

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            counter!("dispatch_outcomes_total", "outcome" => "error").increment(1);
            return Err(problem_for(&intent, err));
        }
    };

    counter!("dispatch_outcomes_total", "outcome" => report.outcome.as_str()).increment(1);
    info!(
        stage = "dispatch",
        event_type = %intent.event_type,
        recipient_id = %intent.recipient_id,
        outcome = report.outcome.as_str(),
        "intent processed"
    );
    record_report(&state, &intent, &report).await;

    Ok((StatusCode::OK, Json(report)))
}

fn problem_for(intent: &NotificationIntent, err: DispatchError) -> ProblemResponse {
    match err {
        DispatchError::InvalidIntent(detail) => {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_intent", detail)
        }
        DispatchError::ProfileLookup {
            source: ProfileError::NotFound(recipient_id),
            ..
        } => ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "recipient_not_found",
            format!("no profile for recipient {recipient_id}"),
        ),
        err @ DispatchError::ProfileLookup { .. } => {
            error!(stage = "dispatch", event_type = %intent.event_type, error = %err, "profile lookup failed");
            ProblemResponse::new(
                StatusCode::BAD_GATEWAY,
                "profile_lookup_failed",
                "recipient profile could not be loaded",
            )
        }
        DispatchError::Store(err) => {
            error!(stage = "dispatch", event_type = %intent.event_type, error = %err, "lease store failure");
            ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "lease_store_unavailable",
                "dispatch state could not be updated",
            )
            .retry_after(STORE_RETRY_AFTER_SECS)
        }
    }
}

/// Writes one log row per channel for sent reports, otherwise one row for the outcome.
async fn record_report(state: &AppState, intent: &NotificationIntent, report: &DispatchReport) {
    let created_at = state.now();

    if report.deliveries.is_empty() {
        let detail = report.next_eligible_at.map(|at| at.to_rfc3339());
        state
            .record_event(NewNotificationEvent {
                recipient_id: Some(intent.recipient_id.as_str()),
                event_type: &intent.event_type,
                channel: None,
                status: report.outcome.as_str(),
                detail: detail.as_deref(),
                created_at,
            })
            .await;
        return;
    }

    for delivery in &report.deliveries {
        counter!(
            "delivery_attempts_total",
            "channel" => delivery.channel.as_str(),
            "result" => delivery.status.as_str()
        )
        .increment(1);

        let detail = match &delivery.status {
            DeliveryStatus::Sent => None,
            DeliveryStatus::Skipped { reason } => Some(reason.as_str()),
            DeliveryStatus::Failed { error } => Some(error.as_str()),
        };
        state
            .record_event(NewNotificationEvent {
                recipient_id: Some(intent.recipient_id.as_str()),
                event_type: &intent.event_type,
                channel: Some(delivery.channel.as_str()),
                status: delivery.status.as_str(),
                detail,
                created_at,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request},
        Router,
    };
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::json;
    use tower::ServiceExt;
    use url::Url;

    use crate::router::app_router;
    use crate::test_support::{self, at, FIXED_NOW};
    use crate::wiring::ProviderUrls;

    async fn post_json(app: Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/notifications/send")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    fn accepted() -> Value {
        json!({
            "type": "JOB_ACCEPTED",
            "user_id": "u1",
            "data": { "helper_name": "Max", "job_title": "Umzug" }
        })
    }

    #[tokio::test]
    async fn sends_then_dedupes() {
        let state = test_support::state().await;
        let app = app_router(state.clone());

        let (status, body) = post_json(app.clone(), accepted()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "sent");
        assert_eq!(body["dedupe_key"], "JOB_ACCEPTED:u1");
        assert_eq!(body["deliveries"][0], json!({ "channel": "email", "status": "sent" }));
        assert_eq!(body["deliveries"][1], json!({ "channel": "push", "status": "sent" }));

        let (status, body) = post_json(app, accepted()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "deduped");
        assert!(body.get("deliveries").is_none());

        let rows = state
            .storage()
            .notification_log()
            .list_recent(10)
            .await
            .expect("log");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().any(|row| row.status == "deduped"));
    }

    #[tokio::test]
    async fn quiet_hours_defer_low_priority() {
        let state = test_support::state_with(
            test_support::config(),
            ProviderUrls::production().expect("urls"),
            at("2024-01-01T22:30:00Z"),
        )
        .await;
        let mut request = accepted();
        request["priority"] = json!("low");

        let (status, body) = post_json(app_router(state), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "deferred");
        assert_eq!(body["next_eligible_at"], "2024-01-02T06:30:00Z");
    }

    #[tokio::test]
    async fn unknown_event_reports_unsupported() {
        let app = app_router(test_support::state().await);
        let (status, body) = post_json(
            app,
            json!({ "type": "PAYOUT_FAILED", "user_id": "u1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "unsupported_event");
    }

    #[tokio::test]
    async fn nested_payload_is_rejected() {
        let app = app_router(test_support::state().await);
        let (status, body) = post_json(
            app,
            json!({ "type": "JOB_ACCEPTED", "user_id": "u1", "data": { "job": { "title": "x" } } }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_payload_data");
    }

    #[tokio::test]
    async fn missing_fields_and_blank_ids_are_rejected() {
        let state = test_support::state().await;

        let (status, body) = post_json(app_router(state.clone()), json!({ "user_id": "u1" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_json");

        let (status, body) = post_json(
            app_router(state),
            json!({ "type": "JOB_ACCEPTED", "user_id": " " }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_intent");
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let app = app_router(test_support::state().await);
        let (status, body) = post_json(
            app,
            json!({ "type": "JOB_ACCEPTED", "user_id": "ghost" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "recipient_not_found");
    }

    #[tokio::test]
    async fn provider_failure_is_reported_per_channel() {
        let server = MockServer::start_async().await;
        let email_mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/resend/emails")
                    .header("Authorization", "Bearer re_test");
                then.status(200).json_body(json!({ "id": "email-1" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/onesignal/notifications");
                then.status(500).body("boom");
            })
            .await;

        let mut config = test_support::config();
        config.resend_api_key = Some("re_test".to_string());
        config.onesignal = Some(mutuus_notify_util::OneSignalCredentials {
            app_id: "app-1".to_string(),
            api_key: "rest-key".to_string(),
        });
        let urls = ProviderUrls {
            resend: Url::parse(&server.url("/resend/")).expect("url"),
            onesignal: Url::parse(&server.url("/onesignal/")).expect("url"),
        };
        let state = test_support::state_with(config, urls, at(FIXED_NOW)).await;

        let (status, body) = post_json(app_router(state.clone()), accepted()).await;
        email_mock.assert_async().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "sent");
        assert_eq!(body["deliveries"][0]["status"], "sent");
        assert_eq!(body["deliveries"][1]["status"], "failed");
        assert!(body["deliveries"][1]["error"]
            .as_str()
            .expect("error text")
            .contains("500"));

        let rows = state
            .storage()
            .notification_log()
            .list_recent(10)
            .await
            .expect("log");
        assert!(rows
            .iter()
            .any(|row| row.channel.as_deref() == Some("push") && row.status == "failed"));
    }
}
