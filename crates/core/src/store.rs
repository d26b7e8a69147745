use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timed reservation on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(acquired_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    /// Returns `true` once the lease no longer blocks a new acquisition.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Errors surfaced by lease store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lease store lock poisoned")]
    Poisoned,
    #[error("lease store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Key/value store holding expiring leases.
///
/// `set_if_absent_or_expired` must be atomic with respect to concurrent callers on the same key:
/// exactly one of two racing acquisitions may observe `true`.
#[async_trait]
pub trait ExpiringStore: Send + Sync {
    /// Returns the stored lease, expired or not.
    async fn get(&self, key: &str) -> Result<Option<Lease>, StoreError>;

    /// Stores `Lease::new(now, ttl)` when the key is absent or its lease has expired.
    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Stores `Lease::new(now, ttl)` when the key is absent or was last acquired at least
    /// `min_age` before `now`. Expiry is ignored; only `acquired_at` decides.
    ///
    /// Same atomicity contract as `set_if_absent_or_expired`.
    async fn set_if_absent_or_older_than(
        &self,
        key: &str,
        now: DateTime<Utc>,
        min_age: Duration,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Removes every lease whose key starts with `prefix`, returning the number removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Removes leases that expired at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-process lease store for single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leases.lock().map(|leases| leases.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExpiringStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        let leases = self.leases.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(leases.get(key).copied())
    }

    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::Poisoned)?;
        let available = leases
            .get(key)
            .map(|lease| lease.is_expired(now))
            .unwrap_or(true);
        if available {
            leases.insert(key.to_string(), Lease::new(now, ttl));
        }
        Ok(available)
    }

    async fn set_if_absent_or_older_than(
        &self,
        key: &str,
        now: DateTime<Utc>,
        min_age: Duration,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::Poisoned)?;
        let available = leases
            .get(key)
            .map(|lease| now - lease.acquired_at >= min_age)
            .unwrap_or(true);
        if available {
            leases.insert(key.to_string(), Lease::new(now, ttl));
        }
        Ok(available)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::Poisoned)?;
        let before = leases.len();
        leases.retain(|key, _| !key.starts_with(prefix));
        Ok((before - leases.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::Poisoned)?;
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired(now));
        Ok((before - leases.len()) as u64)
    }
}
