use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::{DeliveryError, EmailSender, ProfileError, ProfileLookup, PushSender};
use crate::dedupe::{DedupeGuard, DEFAULT_TTL_MINUTES};
use crate::quiet_hours::QuietHoursCalculator;
use crate::rate_limit::{RateLimiter, DEFAULT_COOLDOWN_MINUTES};
use crate::store::{ExpiringStore, StoreError};
use crate::template::TemplateResolver;
use crate::types::{
    Channel, ChannelDelivery, DeliveryStatus, DispatchOutcome, DispatchReport, NotificationIntent,
    RecipientProfile, TemplateContent,
};

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// What happens to an intent denied by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitPolicy {
    /// Drop the notification; no retry time is reported.
    #[default]
    Drop,
    /// Report when the same intent may be re-submitted: the later of the cooldown end and
    /// the release of its dedupe reservation.
    Defer,
}

impl RateLimitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Defer => "defer",
        }
    }
}

impl FromStr for RateLimitPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "drop" => Ok(Self::Drop),
            "defer" => Ok(Self::Defer),
            other => Err(format!("unknown rate limit policy: {other}")),
        }
    }
}

impl fmt::Display for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures scoped to a single intent.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid intent: {0}")]
    InvalidIntent(&'static str),
    #[error("lease store failure: {0}")]
    Store(#[from] StoreError),
    #[error("profile lookup failed for {recipient_id}: {source}")]
    ProfileLookup {
        recipient_id: String,
        #[source]
        source: ProfileError,
    },
}

/// External systems the engine hands work to.
#[derive(Clone)]
pub struct Collaborators {
    pub profiles: Arc<dyn ProfileLookup>,
    pub email: Arc<dyn EmailSender>,
    pub push: Arc<dyn PushSender>,
}

/// Composes dedupe, rate limiting and quiet hours before handing content to the channels.
///
/// Checks run in that order. Dedupe and rate-limit state is committed before any delivery is
/// attempted and is never rolled back, so a failure after acquisition suppresses the intent
/// until the lease lapses.
#[derive(Clone)]
pub struct DispatchEngine {
    store: Arc<dyn ExpiringStore>,
    dedupe: DedupeGuard,
    rate_limiter: RateLimiter,
    rate_limit_policy: RateLimitPolicy,
    quiet_hours: QuietHoursCalculator,
    templates: Arc<TemplateResolver>,
    collaborators: Collaborators,
    clock: Clock,
}

impl DispatchEngine {
    /// Creates an engine with default cooldown, dedupe TTL, quiet-hours zone and the system clock.
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        templates: TemplateResolver,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            dedupe: DedupeGuard::new(store.clone(), Duration::minutes(DEFAULT_TTL_MINUTES)),
            rate_limiter: RateLimiter::new(
                store.clone(),
                Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
            ),
            store,
            rate_limit_policy: RateLimitPolicy::default(),
            quiet_hours: QuietHoursCalculator::default(),
            templates: Arc::new(templates),
            collaborators,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHoursCalculator) -> Self {
        self.quiet_hours = quiet_hours;
        self
    }

    pub fn with_rate_limit(mut self, cooldown: Duration, policy: RateLimitPolicy) -> Self {
        self.rate_limiter = RateLimiter::new(self.store.clone(), cooldown);
        self.rate_limit_policy = policy;
        self
    }

    pub fn with_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe = DedupeGuard::new(self.store.clone(), ttl);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn templates(&self) -> &TemplateResolver {
        &self.templates
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn dedupe(&self) -> &DedupeGuard {
        &self.dedupe
    }

    pub fn quiet_hours(&self) -> &QuietHoursCalculator {
        &self.quiet_hours
    }

    /// Dispatches `intent` at the current clock time.
    pub async fn dispatch(&self, intent: &NotificationIntent) -> Result<DispatchReport, DispatchError> {
        self.dispatch_at(intent, self.now()).await
    }

    /// Dispatches `intent` as if the current time were `now`.
    pub async fn dispatch_at(
        &self,
        intent: &NotificationIntent,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        validate(intent)?;
        let dedupe_key = intent.effective_dedupe_key();
        let event_type = intent.event_type.as_str();
        let recipient_id = intent.recipient_id.as_str();

        if !self.dedupe.check(&dedupe_key, now).await? {
            debug!(stage = "dispatch", %event_type, %recipient_id, %dedupe_key, "duplicate intent suppressed");
            return Ok(DispatchReport::terminal(DispatchOutcome::Deduped, dedupe_key));
        }

        if !self
            .rate_limiter
            .check(recipient_id, intent.priority, now)
            .await?
        {
            debug!(
                stage = "dispatch",
                %event_type,
                %recipient_id,
                policy = self.rate_limit_policy.as_str(),
                "recipient is rate limited"
            );
            return match self.rate_limit_policy {
                RateLimitPolicy::Drop => Ok(DispatchReport::terminal(
                    DispatchOutcome::RateLimited,
                    dedupe_key,
                )),
                RateLimitPolicy::Defer => {
                    let cooldown_end = self
                        .rate_limiter
                        .next_permitted(recipient_id)
                        .await?
                        .unwrap_or(now + self.rate_limiter.cooldown());
                    let next = self.not_before_dedupe_release(&dedupe_key, cooldown_end).await?;
                    Ok(DispatchReport::eligible_at(
                        DispatchOutcome::RateLimited,
                        dedupe_key,
                        next,
                    ))
                }
            };
        }

        let profile = self
            .collaborators
            .profiles
            .fetch_profile(recipient_id)
            .await
            .map_err(|source| DispatchError::ProfileLookup {
                recipient_id: recipient_id.to_string(),
                source,
            })?;

        if !intent.priority.is_critical() {
            if let Some(settings) = profile.quiet_hours.as_ref() {
                if self.quiet_hours.in_quiet_hours(now, settings) {
                    let next = self
                        .not_before_dedupe_release(
                            &dedupe_key,
                            self.quiet_hours.next_send_time(now, settings),
                        )
                        .await?;
                    debug!(stage = "dispatch", %event_type, %recipient_id, next_eligible_at = %next.to_rfc3339(), "deferred by quiet hours");
                    return Ok(DispatchReport::eligible_at(
                        DispatchOutcome::Deferred,
                        dedupe_key,
                        next,
                    ));
                }
            }
        }

        let language = intent.language.as_deref().or(profile.language.as_deref());
        let Some(content) =
            self.templates
                .build_notification_content(event_type, &intent.payload_data, language)
        else {
            warn!(stage = "dispatch", %event_type, %recipient_id, "no template for event type, dropping");
            return Ok(DispatchReport::terminal(
                DispatchOutcome::UnsupportedEvent,
                dedupe_key,
            ));
        };

        let deliveries = self.deliver(&profile, &content).await;
        info!(
            stage = "dispatch",
            %event_type,
            %recipient_id,
            priority = intent.priority.as_str(),
            email = deliveries[0].status.as_str(),
            push = deliveries[1].status.as_str(),
            "notification handed to channels"
        );
        Ok(DispatchReport::sent(dedupe_key, deliveries))
    }

    /// Pushes a retry time past the dedupe lease this intent just took, so resubmitting the
    /// same intent at the reported instant is not suppressed as a duplicate.
    async fn not_before_dedupe_release(
        &self,
        dedupe_key: &str,
        candidate: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        Ok(match self.dedupe.held_until(dedupe_key).await? {
            Some(released_at) => candidate.max(released_at),
            None => candidate,
        })
    }

    /// Drops expired leases from the backing store.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired(self.now()).await
    }

    async fn deliver(
        &self,
        profile: &RecipientProfile,
        content: &TemplateContent,
    ) -> Vec<ChannelDelivery> {
        let email = async {
            match non_empty(profile.email.as_deref()) {
                Some(address) => delivery_status(
                    Channel::Email,
                    self.collaborators
                        .email
                        .send_email(address, &content.email)
                        .await,
                ),
                None => DeliveryStatus::Skipped {
                    reason: "no_email_address".to_string(),
                },
            }
        };
        let push = async {
            match non_empty(profile.push_token.as_deref()) {
                Some(token) => delivery_status(
                    Channel::Push,
                    self.collaborators.push.send_push(token, &content.push).await,
                ),
                None => DeliveryStatus::Skipped {
                    reason: "no_push_token".to_string(),
                },
            }
        };

        let (email, push) = tokio::join!(email, push);
        vec![
            ChannelDelivery {
                channel: Channel::Email,
                status: email,
            },
            ChannelDelivery {
                channel: Channel::Push,
                status: push,
            },
        ]
    }
}

fn validate(intent: &NotificationIntent) -> Result<(), DispatchError> {
    if intent.event_type.trim().is_empty() {
        return Err(DispatchError::InvalidIntent("event_type is required"));
    }
    if intent.recipient_id.trim().is_empty() {
        return Err(DispatchError::InvalidIntent("recipient_id is required"));
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn delivery_status(channel: Channel, result: Result<(), DeliveryError>) -> DeliveryStatus {
    match result {
        Ok(()) => DeliveryStatus::Sent,
        Err(err) => {
            warn!(stage = "delivery", %channel, error = %err, "channel delivery failed");
            DeliveryStatus::Failed {
                error: err.to_string(),
            }
        }
    }
}
