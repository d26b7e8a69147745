use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use mutuus_notify_storage::NewNotificationEvent;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_WEBHOOK_ID: &str = "X-Webhook-Id";
const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
const MAX_SKEW_SECONDS: i64 = 600;

/// Transparent 1x1 PNG.
const PIXEL_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVQImWNgYGBgAAAABQABDQottAAAAABJRU5ErkJggg==";

/// Delivery event posted by an e-mail or push provider.
#[derive(Debug, Deserialize)]
struct ProviderEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

impl ProviderEvent {
    fn channel(&self) -> Option<&'static str> {
        match self.event_type.split('.').next() {
            Some("email") => Some("email"),
            Some("push") | Some("notification") => Some("push"),
            _ => None,
        }
    }

    fn recipient_id(&self) -> Option<&str> {
        self.data
            .get("recipient_id")
            .or_else(|| self.data.get("user_id"))
            .and_then(Value::as_str)
    }
}

/// `POST /api/notifications/webhook`: records a signed provider delivery event.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ProblemResponse> {
    let Some(secret) = state.tracking_secret() else {
        return Err(ProblemResponse::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "tracking_disabled",
            "delivery webhooks are not configured",
        ));
    };

    let webhook_id = get_required_header(&headers, HEADER_WEBHOOK_ID)?;
    let timestamp_raw = get_required_header(&headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(&headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw)
        .map_err(|err| ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_timestamp", err))?;

    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_SKEW_SECONDS {
        warn!(
            stage = "tracking",
            %webhook_id,
            %timestamp_raw,
            now = %now.to_rfc3339(),
            skew_seconds = skew,
            "timestamp outside ±10 minute window"
        );
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(&secret, webhook_id, timestamp_raw, &body, signature).map_err(|err| {
        counter!("tracking_invalid_signature_total").increment(1);
        ProblemResponse::new(StatusCode::FORBIDDEN, "invalid_signature", err)
    })?;

    let event: ProviderEvent = serde_json::from_slice(&body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    counter!("tracking_events_total", "kind" => "webhook").increment(1);
    info!(stage = "tracking", %webhook_id, event_type = %event.event_type, "delivery event received");

    let detail = String::from_utf8_lossy(&body);
    state
        .record_event(NewNotificationEvent {
            recipient_id: event.recipient_id(),
            event_type: &event.event_type,
            channel: event.channel(),
            status: "tracked",
            detail: Some(detail.as_ref()),
            created_at: now,
        })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    #[serde(default)]
    url: Option<String>,
}

/// `GET /api/notifications/redirect?url=…`: click tracking.
///
/// Only relative paths and targets under the configured site URL are followed;
/// anything else lands on `/`.
pub async fn redirect(
    State(state): State<AppState>,
    Query(query): Query<RedirectQuery>,
) -> Response {
    let requested = query.url.unwrap_or_default();
    let target = if is_allowed_target(&requested, state.site_url()) {
        requested
    } else {
        if !requested.is_empty() {
            warn!(stage = "tracking", target = %requested, "rejected off-site redirect target");
        }
        String::from("/")
    };

    counter!("tracking_events_total", "kind" => "click").increment(1);
    state
        .record_event(NewNotificationEvent {
            recipient_id: None,
            event_type: "click",
            channel: Some("email"),
            status: "tracked",
            detail: Some(target.as_str()),
            created_at: state.now(),
        })
        .await;

    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

/// `GET /api/notifications/pixel/:img`: open tracking.
pub async fn pixel(
    State(state): State<AppState>,
    Path(img): Path<String>,
) -> Result<Response, ProblemResponse> {
    let png = STANDARD.decode(PIXEL_PNG_BASE64).map_err(|err| {
        ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "pixel_unavailable",
            err.to_string(),
        )
    })?;

    counter!("tracking_events_total", "kind" => "open").increment(1);
    state
        .record_event(NewNotificationEvent {
            recipient_id: None,
            event_type: "open",
            channel: Some("email"),
            status: "tracked",
            detail: Some(img.as_str()),
            created_at: state.now(),
        })
        .await;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        png,
    )
        .into_response())
}

fn is_allowed_target(target: &str, site_url: &str) -> bool {
    if target.starts_with('/') {
        // `//host` and `/\host` are protocol-relative in browsers
        return !target.starts_with("//") && !target.starts_with("/\\");
    }
    match target.strip_prefix(site_url) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_header",
                format!("missing header {name}"),
            )
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn verify_signature(
    secret: &Arc<[u8]>,
    webhook_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(webhook_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}
