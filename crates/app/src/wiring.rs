use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use mutuus_notify_core::{
    Collaborators, DispatchEngine, EmailSender, ExpiringStore, MemoryStore, PushSender,
    QuietHoursCalculator, RateLimitPolicy, TemplateError, TemplateResolver,
};
use mutuus_notify_delivery::{
    LoggingSender, OneSignalClient, ResendClient, DEFAULT_ONESIGNAL_BASE_URL,
    DEFAULT_RESEND_BASE_URL,
};
use mutuus_notify_storage::Database;
use mutuus_notify_util::{AppConfig, LeaseStoreKind, RateLimitMode};
use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider endpoints, overridable in tests.
#[derive(Debug, Clone)]
pub struct ProviderUrls {
    pub resend: Url,
    pub onesignal: Url,
}

impl ProviderUrls {
    pub fn production() -> Result<Self, WiringError> {
        Ok(Self {
            resend: Url::parse(DEFAULT_RESEND_BASE_URL)?,
            onesignal: Url::parse(DEFAULT_ONESIGNAL_BASE_URL)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum WiringError {
    #[error("failed to load templates: {0}")]
    Templates(#[from] TemplateError),
    #[error("invalid provider url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Builds the dispatch engine from configuration.
///
/// Channels without credentials fall back to [`LoggingSender`].
pub fn build_engine(
    config: &AppConfig,
    database: &Database,
    urls: ProviderUrls,
) -> Result<DispatchEngine, WiringError> {
    let http = Client::builder().timeout(PROVIDER_TIMEOUT).build()?;

    let email: Arc<dyn EmailSender> = match config.resend_api_key.as_deref() {
        Some(api_key) => Arc::new(ResendClient::new(
            api_key,
            config.email_from.as_str(),
            urls.resend,
            http.clone(),
        )),
        None => {
            warn!(stage = "app", channel = "email", "RESEND_API_KEY not set, e-mails are only logged");
            Arc::new(LoggingSender)
        }
    };

    let push: Arc<dyn PushSender> = match config.onesignal.as_ref() {
        Some(credentials) => Arc::new(OneSignalClient::new(
            credentials.app_id.as_str(),
            credentials.api_key.as_str(),
            urls.onesignal,
            http,
        )),
        None => {
            warn!(stage = "app", channel = "push", "OneSignal credentials not set, pushes are only logged");
            Arc::new(LoggingSender)
        }
    };

    let store: Arc<dyn ExpiringStore> = match config.lease_store {
        LeaseStoreKind::Memory => Arc::new(MemoryStore::new()),
        LeaseStoreKind::Sqlite => Arc::new(database.leases()),
    };

    let policy = match config.rate_limit_mode {
        RateLimitMode::Drop => RateLimitPolicy::Drop,
        RateLimitMode::Defer => RateLimitPolicy::Defer,
    };

    let templates = TemplateResolver::builtin(config.default_language.as_str(), config.site_url.as_str())?;

    info!(
        stage = "app",
        lease_store = ?config.lease_store,
        rate_limit_minutes = config.rate_limit_minutes,
        rate_limit_policy = policy.as_str(),
        dedupe_ttl_minutes = config.dedupe_ttl_minutes,
        quiet_hours_tz = %config.quiet_hours_tz,
        "dispatch engine configured"
    );

    Ok(DispatchEngine::new(
        store,
        templates,
        Collaborators {
            profiles: Arc::new(database.profiles()),
            email,
            push,
        },
    )
    .with_quiet_hours(QuietHoursCalculator::new(config.quiet_hours_tz))
    .with_rate_limit(ChronoDuration::minutes(config.rate_limit_minutes), policy)
    .with_dedupe_ttl(ChronoDuration::minutes(config.dedupe_ttl_minutes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutuus_notify_core::{DispatchOutcome, NotificationIntent, Priority};
    use serde_json::json;

    use crate::test_support::{self, at, FIXED_NOW};

    fn intent() -> NotificationIntent {
        NotificationIntent {
            event_type: "JOB_ACCEPTED".to_string(),
            recipient_id: "u1".to_string(),
            payload_data: serde_json::from_value(json!({ "helper_name": "Max", "job_title": "Umzug" }))
                .expect("payload"),
            priority: Priority::Medium,
            dedupe_key: None,
            language: None,
        }
    }

    #[tokio::test]
    async fn sqlite_leases_dedupe_across_engines() {
        let database = test_support::database().await;
        let mut config = test_support::config();
        config.lease_store = LeaseStoreKind::Sqlite;
        let now = at(FIXED_NOW);

        let first = build_engine(&config, &database, ProviderUrls::production().expect("urls"))
            .expect("engine");
        let second = build_engine(&config, &database, ProviderUrls::production().expect("urls"))
            .expect("engine");

        let report = first.dispatch_at(&intent(), now).await.expect("first dispatch");
        assert_eq!(report.outcome, DispatchOutcome::Sent);

        let report = second.dispatch_at(&intent(), now).await.expect("second dispatch");
        assert_eq!(report.outcome, DispatchOutcome::Deduped);
    }

    #[tokio::test]
    async fn memory_leases_are_private_to_each_engine() {
        let database = test_support::database().await;
        let config = test_support::config();
        let now = at(FIXED_NOW);

        let first = build_engine(&config, &database, ProviderUrls::production().expect("urls"))
            .expect("engine");
        let second = build_engine(&config, &database, ProviderUrls::production().expect("urls"))
            .expect("engine");

        assert_eq!(
            first.dispatch_at(&intent(), now).await.expect("dispatch").outcome,
            DispatchOutcome::Sent
        );
        assert_eq!(
            second.dispatch_at(&intent(), now).await.expect("dispatch").outcome,
            DispatchOutcome::Sent
        );
    }

    #[test]
    fn production_urls_point_at_providers() {
        let urls = ProviderUrls::production().expect("urls");
        assert_eq!(urls.resend.host_str(), Some("api.resend.com"));
        assert_eq!(urls.onesignal.host_str(), Some("onesignal.com"));
    }
}
