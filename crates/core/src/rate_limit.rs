use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::store::{ExpiringStore, StoreError};
use crate::types::Priority;

const NAMESPACE: &str = "rate:";

/// Default cooldown between two non-critical notifications for the same recipient.
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 10;

/// Per-recipient cooldown limiter.
///
/// Each permitted send records its time; the next non-critical send is allowed once
/// `now - last >= cooldown`. Denied attempts leave the window untouched. The stored lease
/// lives for the longer of the configured and the per-call cooldown, so purging expired
/// leases never releases a recipient early.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn ExpiringStore>,
    cooldown: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn ExpiringStore>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns `true` when a notification of `priority` may be sent to `user_id` at `now`.
    pub async fn check(
        &self,
        user_id: &str,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_with_cooldown(user_id, priority, now, self.cooldown)
            .await
    }

    /// Like [`check`](Self::check) with a cooldown chosen by the caller.
    pub async fn check_with_cooldown(
        &self,
        user_id: &str,
        priority: Priority,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool, StoreError> {
        if priority.is_critical() {
            return Ok(true);
        }

        let retain_for = cooldown.max(self.cooldown);
        self.store
            .set_if_absent_or_older_than(&key(user_id), now, cooldown, retain_for)
            .await
    }

    /// Timestamp of the last permitted non-critical send.
    pub async fn last_permitted(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .get(&key(user_id))
            .await?
            .map(|lease| lease.acquired_at))
    }

    /// Earliest instant the next non-critical send becomes permitted.
    pub async fn next_permitted(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .last_permitted(user_id)
            .await?
            .map(|last| last + self.cooldown))
    }

    /// Clears all limiter state. Intended for test isolation.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.clear_prefix(NAMESPACE).await.map(|_| ())
    }
}

fn key(user_id: &str) -> String {
    format!("{NAMESPACE}{user_id}")
}
