use std::{env, fmt, net::SocketAddr};

use chrono_tz::Tz;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://mutuus-notify.db?mode=rwc";
pub const DEFAULT_QUIET_HOURS_TZ: &str = "Europe/Berlin";
pub const DEFAULT_RATE_LIMIT_MINUTES: i64 = 10;
pub const DEFAULT_DEDUPE_TTL_MINUTES: i64 = 30;
pub const DEFAULT_LANGUAGE: &str = "de";
pub const DEFAULT_SITE_URL: &str = "http://localhost:3000";
pub const DEFAULT_EMAIL_FROM: &str = "Mutuus <info@mutuus-app.de>";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// How rate-limited notifications are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    Drop,
    Defer,
}

/// Backing store for dedupe and rate-limit leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStoreKind {
    /// Process-local map. Only correct for a single instance.
    Memory,
    /// Shared SQLite table, usable by several instances on the same database.
    Sqlite,
}

/// Credentials for the OneSignal push API.
#[derive(Clone)]
pub struct OneSignalCredentials {
    pub app_id: String,
    pub api_key: String,
}

impl fmt::Debug for OneSignalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneSignalCredentials")
            .field("app_id", &self.app_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub quiet_hours_tz: Tz,
    pub rate_limit_minutes: i64,
    pub rate_limit_mode: RateLimitMode,
    pub dedupe_ttl_minutes: i64,
    pub default_language: String,
    pub site_url: String,
    pub lease_store: LeaseStoreKind,
    pub email_from: String,
    pub resend_api_key: Option<String>,
    pub onesignal: Option<OneSignalCredentials>,
    pub tracking_webhook_secret: Option<String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("environment", &self.environment)
            .field("database_url", &self.database_url)
            .field("quiet_hours_tz", &self.quiet_hours_tz)
            .field("rate_limit_minutes", &self.rate_limit_minutes)
            .field("rate_limit_mode", &self.rate_limit_mode)
            .field("dedupe_ttl_minutes", &self.dedupe_ttl_minutes)
            .field("default_language", &self.default_language)
            .field("site_url", &self.site_url)
            .field("lease_store", &self.lease_store)
            .field("email_from", &self.email_from)
            .field("resend_configured", &self.resend_api_key.is_some())
            .field("onesignal", &self.onesignal)
            .field(
                "tracking_webhook_configured",
                &self.tracking_webhook_secret.is_some(),
            )
            .finish()
    }
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let tz_name = var_or("QUIET_HOURS_TZ", DEFAULT_QUIET_HOURS_TZ);
        let quiet_hours_tz = tz_name
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(tz_name.clone()))?;

        let rate_limit_mode = match var_or("RATE_LIMIT_POLICY", "drop").as_str() {
            "drop" => RateLimitMode::Drop,
            "defer" => RateLimitMode::Defer,
            other => return Err(ConfigError::InvalidRateLimitPolicy(other.to_string())),
        };

        let lease_store = match var_or("LEASE_STORE", "memory").as_str() {
            "memory" => LeaseStoreKind::Memory,
            "sqlite" => LeaseStoreKind::Sqlite,
            other => return Err(ConfigError::InvalidLeaseStore(other.to_string())),
        };

        let onesignal = match (optional_var("ONESIGNAL_APP_ID"), optional_var("ONESIGNAL_API_KEY")) {
            (Some(app_id), Some(api_key)) => Some(OneSignalCredentials { app_id, api_key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteOneSignal),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: var_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            quiet_hours_tz,
            rate_limit_minutes: positive_minutes("RATE_LIMIT_MINUTES", DEFAULT_RATE_LIMIT_MINUTES)?,
            rate_limit_mode,
            dedupe_ttl_minutes: positive_minutes("DEDUPE_TTL_MINUTES", DEFAULT_DEDUPE_TTL_MINUTES)?,
            default_language: var_or("DEFAULT_LANGUAGE", DEFAULT_LANGUAGE),
            site_url: var_or("SITE_URL", DEFAULT_SITE_URL),
            lease_store,
            email_from: var_or("EMAIL_FROM", DEFAULT_EMAIL_FROM),
            resend_api_key: optional_var("RESEND_API_KEY"),
            onesignal,
            tracking_webhook_secret: optional_var("TRACKING_WEBHOOK_SECRET"),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

/// Reads a variable, treating empty values as unset.
fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn positive_minutes(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let Some(raw) = optional_var(name) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidMinutes { name, value: raw }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidTimezone(String),
    InvalidRateLimitPolicy(String),
    InvalidLeaseStore(String),
    InvalidMinutes { name: &'static str, value: String },
    IncompleteOneSignal,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidTimezone(value) => {
                write!(f, "QUIET_HOURS_TZ is not a known IANA zone (got {value})")
            }
            Self::InvalidRateLimitPolicy(value) => write!(
                f,
                "RATE_LIMIT_POLICY must be 'drop' or 'defer' (got {value})"
            ),
            Self::InvalidLeaseStore(value) => {
                write!(f, "LEASE_STORE must be 'memory' or 'sqlite' (got {value})")
            }
            Self::InvalidMinutes { name, value } => {
                write!(f, "{name} must be a positive number of minutes (got {value})")
            }
            Self::IncompleteOneSignal => write!(
                f,
                "ONESIGNAL_APP_ID and ONESIGNAL_API_KEY must be set together"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
