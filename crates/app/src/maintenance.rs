use std::time::Duration;

use chrono::Duration as ChronoDuration;
use metrics::counter;
use mutuus_notify_core::{DispatchEngine, StoreError};
use mutuus_notify_storage::{Database, StorageError};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const EVENT_LOG_RETENTION_DAYS: i64 = 30;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker that purges expired leases and trims the event log.
#[derive(Clone)]
pub struct MaintenanceWorker {
    engine: DispatchEngine,
    database: Database,
    interval: Duration,
}

/// Rows removed by one maintenance cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub leases_purged: u64,
    pub events_trimmed: u64,
    pub busy: bool,
}

impl MaintenanceWorker {
    /// Creates a worker with the default cadence. Time comes from the engine's clock.
    pub fn new(engine: DispatchEngine, database: Database) -> Self {
        Self {
            engine,
            database,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let mut report = MaintenanceReport::default();

        match self.engine.purge_expired().await {
            Ok(purged) => {
                report.leases_purged = purged;
                counter!("lease_purged_total").increment(purged);
            }
            Err(StoreError::Backend(source)) if is_busy(source.as_ref()) => {
                report.busy = true;
                counter!("db_busy_total", "op" => "lease_purge").increment(1);
                warn!(stage = "storage", error = %source, "lease purge hit busy timeout");
            }
            Err(source) => return Err(MaintenanceError::Leases { source }),
        }

        let cutoff = self.engine.now() - ChronoDuration::days(EVENT_LOG_RETENTION_DAYS);
        match self.database.notification_log().delete_older_than(cutoff).await {
            Ok(trimmed) => {
                report.events_trimmed = trimmed;
                counter!("event_log_trimmed_total").increment(trimmed);
            }
            Err(StorageError::Database(source)) if is_sqlite_busy(&source) => {
                report.busy = true;
                counter!("db_busy_total", "op" => "event_log_trim").increment(1);
                warn!(stage = "storage", error = %source, "event log trim hit busy timeout");
            }
            Err(source) => return Err(MaintenanceError::EventLog { source }),
        }

        info!(
            stage = "storage",
            leases_purged = report.leases_purged,
            events_trimmed = report.events_trimmed,
            busy = report.busy,
            cutoff = %cutoff.to_rfc3339(),
            "maintenance cycle completed"
        );
        Ok(report)
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to purge expired leases")]
    Leases {
        #[source]
        source: StoreError,
    },
    #[error("failed to trim notification event log")]
    EventLog {
        #[source]
        source: StorageError,
    },
}

fn is_busy(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    err.downcast_ref::<SqlxError>().is_some_and(is_sqlite_busy)
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
