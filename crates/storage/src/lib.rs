use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use mutuus_notify_core::{
    types::parse_wall_clock, ExpiringStore, Lease, ProfileError, ProfileLookup, QuietHoursSettings,
    RecipientProfile, StoreError,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for recipient profiles.
    pub fn profiles(&self) -> ProfileRepository {
        ProfileRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns the lease store shared by every instance pointed at this database.
    pub fn leases(&self) -> SqliteLeaseStore {
        SqliteLeaseStore {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the notification event log.
    pub fn notification_log(&self) -> NotificationLogRepository {
        NotificationLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `profiles` table.
#[derive(Clone)]
pub struct ProfileRepository {
    pool: SqlitePool,
}

/// Row written to the `profiles` table.
#[derive(Debug, Clone, Default)]
pub struct ProfileRecord<'a> {
    pub id: &'a str,
    pub email: Option<&'a str>,
    pub push_token: Option<&'a str>,
    pub language: Option<&'a str>,
    pub quiet_hours_start: Option<&'a str>,
    pub quiet_hours_end: Option<&'a str>,
}

impl ProfileRepository {
    /// Inserts or replaces a profile.
    pub async fn upsert(
        &self,
        record: &ProfileRecord<'_>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO profiles \
             (id, email, push_token, language, quiet_hours_start, quiet_hours_end, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 email = excluded.email, \
                 push_token = excluded.push_token, \
                 language = excluded.language, \
                 quiet_hours_start = excluded.quiet_hours_start, \
                 quiet_hours_end = excluded.quiet_hours_end, \
                 updated_at = excluded.updated_at",
        )
        .bind(record.id)
        .bind(record.email)
        .bind(record.push_token)
        .bind(record.language)
        .bind(record.quiet_hours_start)
        .bind(record.quiet_hours_end)
        .bind(to_rfc3339(updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads the profile for `recipient_id`, or `None` when the row is missing.
    pub async fn find(&self, recipient_id: &str) -> Result<Option<RecipientProfile>, StorageError> {
        let row = sqlx::query(
            "SELECT email, push_token, language, quiet_hours_start, quiet_hours_end \
             FROM profiles WHERE id = ?",
        )
        .bind(recipient_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let start: Option<String> = row.get("quiet_hours_start");
        let end: Option<String> = row.get("quiet_hours_end");
        Ok(Some(RecipientProfile {
            email: row.get("email"),
            push_token: row.get("push_token"),
            language: row.get("language"),
            quiet_hours: quiet_hours(recipient_id, start.as_deref(), end.as_deref()),
        }))
    }
}

/// Quiet hours apply only when both bounds are present and parse.
fn quiet_hours(
    recipient_id: &str,
    start: Option<&str>,
    end: Option<&str>,
) -> Option<QuietHoursSettings> {
    let (start, end) = (start?, end?);
    match (parse_wall_clock(start), parse_wall_clock(end)) {
        (Ok(start), Ok(end)) => Some(QuietHoursSettings::new(start, end)),
        (Err(err), _) | (_, Err(err)) => {
            warn!(stage = "storage", %recipient_id, error = %err, "ignoring malformed quiet hours");
            None
        }
    }
}

#[async_trait]
impl ProfileLookup for ProfileRepository {
    async fn fetch_profile(&self, recipient_id: &str) -> Result<RecipientProfile, ProfileError> {
        self.find(recipient_id)
            .await
            .map_err(|err| ProfileError::Backend(Box::new(err)))?
            .ok_or_else(|| ProfileError::NotFound(recipient_id.to_string()))
    }
}

/// Lease store backed by the `dispatch_leases` table.
///
/// Acquisition is a single upsert whose update only fires when the stored lease has expired,
/// so SQLite serialises competing writers on the same key.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

#[async_trait]
impl ExpiringStore for SqliteLeaseStore {
    async fn get(&self, key: &str) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query("SELECT acquired_at, expires_at FROM dispatch_leases WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Lease {
            acquired_at: from_millis(row.get("acquired_at"))?,
            expires_at: from_millis(row.get("expires_at"))?,
        }))
    }

    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let lease = Lease::new(now, ttl);
        let result = sqlx::query(
            "INSERT INTO dispatch_leases (key, acquired_at, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at \
             WHERE dispatch_leases.expires_at <= excluded.acquired_at",
        )
        .bind(key)
        .bind(lease.acquired_at.timestamp_millis())
        .bind(lease.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_if_absent_or_older_than(
        &self,
        key: &str,
        now: DateTime<Utc>,
        min_age: Duration,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let lease = Lease::new(now, ttl);
        let result = sqlx::query(
            "INSERT INTO dispatch_leases (key, acquired_at, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                 acquired_at = excluded.acquired_at, \
                 expires_at = excluded.expires_at \
             WHERE dispatch_leases.acquired_at <= ?",
        )
        .bind(key)
        .bind(lease.acquired_at.timestamp_millis())
        .bind(lease.expires_at.timestamp_millis())
        .bind((now - min_age).timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dispatch_leases WHERE substr(key, 1, length(?)) = ?")
            .bind(prefix)
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dispatch_leases WHERE expires_at <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(Box::new(err))
}

fn from_millis(value: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| StoreError::Backend(format!("lease timestamp out of range: {value}").into()))
}

/// Repository for the append-only `notification_events` table.
#[derive(Clone)]
pub struct NotificationLogRepository {
    pool: SqlitePool,
}

/// Data required to append an event log entry.
#[derive(Debug, Clone)]
pub struct NewNotificationEvent<'a> {
    pub recipient_id: Option<&'a str>,
    pub event_type: &'a str,
    pub channel: Option<&'a str>,
    pub status: &'a str,
    pub detail: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Stored event log entry.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NotificationEventRow {
    pub id: String,
    pub recipient_id: Option<String>,
    pub event_type: String,
    pub channel: Option<String>,
    pub status: String,
    pub detail: Option<String>,
    pub created_at: String,
}

impl NotificationLogRepository {
    /// Appends an entry and returns its generated id.
    pub async fn append(&self, event: &NewNotificationEvent<'_>) -> Result<String, StorageError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO notification_events \
             (id, recipient_id, event_type, channel, status, detail, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(event.recipient_id)
        .bind(event.event_type)
        .bind(event.channel)
        .bind(event.status)
        .bind(event.detail)
        .bind(to_rfc3339(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Lists the newest entries first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<NotificationEventRow>, StorageError> {
        let rows = sqlx::query_as::<_, NotificationEventRow>(
            "SELECT id, recipient_id, event_type, channel, status, detail, created_at \
             FROM notification_events ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deletes entries created before `cutoff`, returning how many were removed.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM notification_events WHERE created_at < ?")
            .bind(to_rfc3339(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
