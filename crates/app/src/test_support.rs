use std::sync::Arc;

use chrono::{DateTime, Utc};
use mutuus_notify_storage::{Database, ProfileRecord};
use mutuus_notify_util::{AppConfig, Environment, LeaseStoreKind, RateLimitMode};

use crate::router::AppState;
use crate::telemetry;
use crate::wiring::{build_engine, ProviderUrls};

/// 11:00 in Berlin, outside the seeded quiet hours.
pub const FIXED_NOW: &str = "2024-01-01T10:00:00Z";
pub const TRACKING_SECRET: &str = "test-secret";

pub fn at(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub fn config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().expect("addr"),
        environment: Environment::Test,
        database_url: "sqlite::memory:".to_string(),
        quiet_hours_tz: "Europe/Berlin".parse().expect("tz"),
        rate_limit_minutes: 10,
        rate_limit_mode: RateLimitMode::Drop,
        dedupe_ttl_minutes: 30,
        default_language: "de".to_string(),
        site_url: "https://mutuus.example".to_string(),
        lease_store: LeaseStoreKind::Memory,
        email_from: "Mutuus <info@mutuus-app.de>".to_string(),
        resend_api_key: None,
        onesignal: None,
        tracking_webhook_secret: Some(TRACKING_SECRET.to_string()),
    }
}

pub async fn database() -> Database {
    let database = Database::connect("sqlite::memory:?cache=shared")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");
    database
        .profiles()
        .upsert(
            &ProfileRecord {
                id: "u1",
                email: Some("helper@example.com"),
                push_token: Some("player-1"),
                language: None,
                quiet_hours_start: Some("22:00"),
                quiet_hours_end: Some("07:00"),
            },
            at(FIXED_NOW),
        )
        .await
        .expect("seed profile");
    database
}

pub async fn state_with(config: AppConfig, urls: ProviderUrls, now: DateTime<Utc>) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = database().await;
    let engine = build_engine(&config, &database, urls).expect("engine");
    let secret = config
        .tracking_webhook_secret
        .as_ref()
        .map(|secret| Arc::from(secret.clone().into_bytes().into_boxed_slice()));

    AppState::new(metrics, database, engine, secret, &config.site_url)
        .with_clock(Arc::new(move || now))
}

pub async fn state() -> AppState {
    state_with(
        config(),
        ProviderUrls::production().expect("urls"),
        at(FIXED_NOW),
    )
    .await
}
