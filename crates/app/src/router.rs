use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use mutuus_notify_core::{Clock, DispatchEngine};
use mutuus_notify_storage::{Database, NewNotificationEvent};
use tracing::warn;

use crate::{send, telemetry, tracking};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    engine: DispatchEngine,
    tracking_secret: Option<Arc<[u8]>>,
    site_url: Arc<str>,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        engine: DispatchEngine,
        tracking_secret: Option<Arc<[u8]>>,
        site_url: &str,
    ) -> Self {
        Self {
            metrics,
            storage,
            engine,
            tracking_secret,
            site_url: Arc::from(site_url.trim_end_matches('/')),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replaces the clock used by handlers and the dispatch engine.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.engine = self.engine.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn tracking_secret(&self) -> Option<Arc<[u8]>> {
        self.tracking_secret.clone()
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Appends to the notification event log. Failures are logged, never surfaced to callers.
    pub async fn record_event(&self, event: NewNotificationEvent<'_>) {
        if let Err(err) = self.storage.notification_log().append(&event).await {
            warn!(
                stage = "storage",
                event_type = event.event_type,
                status = event.status,
                error = %err,
                "failed to append notification event"
            );
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/notifications/send", post(send::handle))
        .route("/api/notifications/webhook", post(tracking::webhook))
        .route("/api/notifications/redirect", get(tracking::redirect))
        .route("/api/notifications/pixel/:img", get(tracking::pixel))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::test_support;

    async fn send_get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .expect("handler should respond")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = app_router(test_support::state().await);
        let response = send_get(app, "/healthz").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let app = app_router(test_support::state().await);
        let response = send_get(app, "/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn record_event_appends_to_log() {
        let state = test_support::state().await;
        state
            .record_event(NewNotificationEvent {
                recipient_id: Some("u1"),
                event_type: "JOB_ACCEPTED",
                channel: None,
                status: "deduped",
                detail: None,
                created_at: state.now(),
            })
            .await;

        let rows = state
            .storage()
            .notification_log()
            .list_recent(5)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "deduped");
    }
}
