use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::store::{ExpiringStore, StoreError};

const NAMESPACE: &str = "dedupe:";

/// Default lifetime of a dedupe reservation.
pub const DEFAULT_TTL_MINUTES: i64 = 30;

/// Single-acquisition lock with timed release, keyed by dedupe key.
///
/// There is no explicit release: a key becomes acquirable again only after its TTL lapses.
#[derive(Clone)]
pub struct DedupeGuard {
    store: Arc<dyn ExpiringStore>,
    ttl: Duration,
}

impl DedupeGuard {
    pub fn new(store: Arc<dyn ExpiringStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns `true` when `key` was acquired, `false` when it is held by an unexpired lease.
    pub async fn check(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.store
            .set_if_absent_or_expired(&namespaced(key), now, self.ttl)
            .await
    }

    /// Instant the current reservation on `key` lapses, if one was ever taken.
    pub async fn held_until(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .get(&namespaced(key))
            .await?
            .map(|lease| lease.expires_at))
    }

    /// Clears all dedupe state. Intended for test isolation.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.clear_prefix(NAMESPACE).await.map(|_| ())
    }
}

fn namespaced(key: &str) -> String {
    format!("{NAMESPACE}{key}")
}
