use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Ordinal tag on a notification intent. Only `Critical` bypasses rate limiting and quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn is_critical(self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// Scalar value accepted in a notification payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl PayloadValue {
    /// Converts a JSON value, returning the JSON kind name when it is not a supported scalar.
    pub fn from_json(value: Value) -> Result<Self, &'static str> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Bool(flag) => Ok(Self::Bool(flag)),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => Ok(Self::Integer(integer)),
                None => number.as_f64().map(Self::Float).ok_or("number"),
            },
            Value::Null => Err("null"),
            Value::Array(_) => Err("array"),
            Value::Object(_) => Err("object"),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Errors raised when a payload contains values outside the supported scalar set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload must be a JSON object (got {0})")]
    NotAnObject(&'static str),
    #[error("payload field '{key}' has unsupported type {kind}; expected string, number or boolean")]
    Unsupported { key: String, kind: &'static str },
}

/// Key/value bag used for template substitution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PayloadData(BTreeMap<String, PayloadValue>);

impl PayloadData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds payload data from an arbitrary JSON value, rejecting non-scalar fields.
    pub fn from_json(value: Value) -> Result<Self, PayloadError> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::default()),
            other => return Err(PayloadError::NotAnObject(json_kind(&other))),
        };

        let mut data = BTreeMap::new();
        for (key, value) in map {
            let value = PayloadValue::from_json(value)
                .map_err(|kind| PayloadError::Unsupported { key: key.clone(), kind })?;
            data.insert(key, value);
        }
        Ok(Self(data))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PayloadValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }
}

impl<'de> Deserialize<'de> for PayloadData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        PayloadData::from_json(value).map_err(D::Error::custom)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A request to notify a recipient about an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub event_type: String,
    pub recipient_id: String,
    #[serde(default)]
    pub payload_data: PayloadData,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl NotificationIntent {
    pub fn new(event_type: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            recipient_id: recipient_id.into(),
            payload_data: PayloadData::default(),
            priority: Priority::default(),
            dedupe_key: None,
            language: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload_data.insert(key, value);
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Returns the explicit dedupe key, or `"{event_type}:{recipient_id}"` when absent.
    pub fn effective_dedupe_key(&self) -> String {
        match self.dedupe_key.as_deref() {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => format!("{}:{}", self.event_type, self.recipient_id),
        }
    }
}

/// Error produced when a wall-clock value cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid wall-clock time '{0}', expected HH:MM")]
pub struct WallClockError(pub String);

/// Parses `HH:MM` (or `HH:MM:SS`, as stored by SQL `time` columns).
pub fn parse_wall_clock(value: &str) -> Result<NaiveTime, WallClockError> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| WallClockError(value.to_string()))
}

/// Minutes elapsed since local midnight.
pub fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

/// Per-recipient do-not-disturb window, expressed in the process-wide quiet-hours zone.
///
/// `start > end` wraps past midnight. `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHoursSettings {
    #[serde(rename = "quiet_hours_start", with = "wall_clock")]
    pub start: NaiveTime,
    #[serde(rename = "quiet_hours_end", with = "wall_clock")]
    pub end: NaiveTime,
}

impl QuietHoursSettings {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, WallClockError> {
        Ok(Self {
            start: parse_wall_clock(start)?,
            end: parse_wall_clock(end)?,
        })
    }

    pub fn start_minutes(&self) -> u32 {
        minute_of_day(self.start)
    }

    pub fn end_minutes(&self) -> u32 {
        minute_of_day(self.end)
    }
}

mod wall_clock {
    use super::*;
    use serde::de::Error as _;

    pub fn serialize<S>(value: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_wall_clock(&raw).map_err(D::Error::custom)
    }
}

/// Contact details and preferences resolved for a recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub email: Option<String>,
    pub push_token: Option<String>,
    pub language: Option<String>,
    pub quiet_hours: Option<QuietHoursSettings>,
}

/// Rendered e-mail content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub subject: String,
    pub html: String,
}

/// Rendered push content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushContent {
    pub title: String,
    pub body: String,
}

/// Per-channel content produced for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateContent {
    pub email: EmailContent,
    pub push: PushContent,
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of handing content to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Skipped { reason: String },
    Failed { error: String },
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDelivery {
    pub channel: Channel,
    #[serde(flatten)]
    pub status: DeliveryStatus,
}

/// Terminal decision reached for one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    Deduped,
    RateLimited,
    Deferred,
    UnsupportedEvent,
}

impl DispatchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Deduped => "deduped",
            Self::RateLimited => "rate_limited",
            Self::Deferred => "deferred",
            Self::UnsupportedEvent => "unsupported_event",
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report returned by the dispatch engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub dedupe_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deliveries: Vec<ChannelDelivery>,
}

impl DispatchReport {
    pub(crate) fn terminal(outcome: DispatchOutcome, dedupe_key: String) -> Self {
        Self {
            outcome,
            dedupe_key,
            next_eligible_at: None,
            deliveries: Vec::new(),
        }
    }

    pub(crate) fn eligible_at(
        outcome: DispatchOutcome,
        dedupe_key: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            outcome,
            dedupe_key,
            next_eligible_at: Some(at),
            deliveries: Vec::new(),
        }
    }

    pub(crate) fn sent(dedupe_key: String, deliveries: Vec<ChannelDelivery>) -> Self {
        Self {
            outcome: DispatchOutcome::Sent,
            dedupe_key,
            next_eligible_at: None,
            deliveries,
        }
    }
}
