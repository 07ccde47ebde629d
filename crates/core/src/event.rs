//! The canonical event contract. Every producer in the platform funnels
//! through [`SystemEvent::build`], which validates and normalizes input
//! once; events are append-only and never mutated after construction.
//! Storage writes are keyed by `id`, so re-delivery is idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Error string substituted when a failed event arrives without one.
pub const FAILURE_SENTINEL: &str = "unspecified failure";

/// Severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// True for warn/error/fatal. Drives mirror-tier and alert-tier
    /// engagement in the store and alert forwarding throughout.
    pub fn is_high_severity(self) -> bool {
        matches!(self, Level::Warn | Level::Error | Level::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ContractViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(ContractViolation::InvalidLevel(other.to_string())),
        }
    }
}

/// A field-specific contract violation. Construction never coerces
/// silently; every rejected input names the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("field `{0}` must be a non-empty string")]
    EmptyField(&'static str),

    #[error("level `{0}` is not one of debug|info|warn|error|fatal")]
    InvalidLevel(String),

    #[error("duration_ms must be >= 0, got {0}")]
    NegativeDuration(i64),

    #[error("timestamp must be a positive epoch-millisecond value, got {0}")]
    InvalidTimestamp(i64),

    #[error("success=false requires a non-empty error")]
    MissingError,
}

/// Producer-facing input shape. Everything the contract can default is
/// optional; everything it cannot is validated in [`SystemEvent::build`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventInput {
    pub id: Option<String>,
    pub timestamp: Option<i64>,
    pub level: String,
    pub source: String,
    pub component: String,
    pub action: String,
    pub success: bool,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

/// The canonical, immutable operational event. This serde shape is the
/// stable audit-event wire format other tooling depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub level: Level,
    pub source: String,
    pub component: String,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SystemEvent {
    /// Validate and normalize producer input into a canonical event.
    ///
    /// Defaults: missing `id` -> fresh v4 uuid; missing or non-positive
    /// `timestamp` -> now; missing `metadata` -> empty map; a failed
    /// event without an error string gets [`FAILURE_SENTINEL`].
    pub fn build(input: EventInput) -> Result<Self, ContractViolation> {
        let level = Level::from_str(input.level.trim())?;

        let source = non_empty("source", input.source)?;
        let component = non_empty("component", input.component)?;
        let action = non_empty("action", input.action)?;

        let duration_ms = match input.duration_ms {
            Some(d) if d < 0 => return Err(ContractViolation::NegativeDuration(d)),
            Some(d) => Some(d as u64),
            None => None,
        };

        let timestamp = match input.timestamp {
            Some(ts) if ts > 0 => ts,
            _ => Utc::now().timestamp_millis(),
        };

        let error = input.error.and_then(|e| {
            let trimmed = e.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        });
        let error = if !input.success && error.is_none() {
            Some(FAILURE_SENTINEL.to_string())
        } else {
            error
        };

        Ok(Self {
            id: input
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            timestamp,
            level,
            source,
            component,
            action,
            success: input.success,
            duration_ms,
            error,
            metadata: input.metadata.unwrap_or_default(),
        })
    }

    /// Type guard for events read back from untrusted storage. Reports
    /// the first field-specific violation found.
    pub fn validate(&self) -> Result<(), ContractViolation> {
        if self.id.trim().is_empty() {
            return Err(ContractViolation::EmptyField("id"));
        }
        if self.source.trim().is_empty() {
            return Err(ContractViolation::EmptyField("source"));
        }
        if self.component.trim().is_empty() {
            return Err(ContractViolation::EmptyField("component"));
        }
        if self.action.trim().is_empty() {
            return Err(ContractViolation::EmptyField("action"));
        }
        if self.timestamp <= 0 {
            return Err(ContractViolation::InvalidTimestamp(self.timestamp));
        }
        if !self.success && self.error.as_deref().map_or(true, |e| e.trim().is_empty()) {
            return Err(ContractViolation::MissingError);
        }
        Ok(())
    }

    /// Parse and validate an event arriving over the wire (inbound
    /// queue entries, replayed payloads).
    pub fn from_json(raw: &str) -> crate::error::PulseResult<Self> {
        let event: SystemEvent = serde_json::from_str(raw)?;
        event.validate()?;
        Ok(event)
    }

    /// Per-key identity used by the debug backpressure guard.
    pub fn budget_key(&self) -> String {
        format!("{}:{}:{}", self.source, self.component, self.action)
    }

    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

fn non_empty(field: &'static str, value: String) -> Result<String, ContractViolation> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        Err(ContractViolation::EmptyField(field))
    } else {
        Ok(trimmed)
    }
}

/// Recurring-failure signature: sha256 over (component, action, error),
/// truncated to 16 hex chars. Identical signatures share dedup windows
/// and escalation counts.
pub fn dedup_key(component: &str, action: &str, error: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(component.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(action.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(error.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Primary-tier index document derived from a [`SystemEvent`]: the raw
/// fields plus an ISO date, a concatenated search blob, the serialized
/// metadata, and the metadata key list for faceting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDocument {
    pub id: String,
    pub timestamp: i64,
    pub date: String,
    pub level: Level,
    pub source: String,
    pub component: String,
    pub action: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub search_text: String,
    pub metadata_json: String,
    pub metadata_keys: Vec<String>,
}

impl EventDocument {
    pub fn from_event(event: &SystemEvent) -> Self {
        let date = event
            .occurred_at()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();

        let mut search_text = format!(
            "{} {} {} {}",
            event.source, event.component, event.action, event.level
        );
        if let Some(error) = &event.error {
            search_text.push(' ');
            search_text.push_str(error);
        }

        let metadata_json =
            serde_json::to_string(&event.metadata).unwrap_or_else(|_| "{}".to_string());

        Self {
            id: event.id.clone(),
            timestamp: event.timestamp,
            date,
            level: event.level,
            source: event.source.clone(),
            component: event.component.clone(),
            action: event.action.clone(),
            success: event.success,
            duration_ms: event.duration_ms,
            error: event.error.clone(),
            search_text,
            metadata_json,
            metadata_keys: event.metadata.keys().cloned().collect(),
        }
    }

    /// Reconstitute the canonical event from an indexed document.
    /// Callers treat the result as untrusted and re-validate.
    pub fn to_event(&self) -> Result<SystemEvent, serde_json::Error> {
        let metadata = if self.metadata_json.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&self.metadata_json)?
        };

        Ok(SystemEvent {
            id: self.id.clone(),
            timestamp: self.timestamp,
            level: self.level,
            source: self.source.clone(),
            component: self.component.clone(),
            action: self.action.clone(),
            success: self.success,
            duration_ms: self.duration_ms,
            error: self.error.clone(),
            metadata,
        })
    }
}
