use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Logical write operations a floor client can queue while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionEndpoint {
    ClockIn,
    ClockOut,
    StartBreak,
    EndBreak,
    PinToggle,
    DeleteTimeLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Delete,
}

/// Where an [`ActionEndpoint`] is delivered, relative to the API base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTarget {
    pub method: HttpMethod,
    pub path: &'static str,
}

impl ActionEndpoint {
    pub const ALL: [ActionEndpoint; 6] = [
        Self::ClockIn,
        Self::ClockOut,
        Self::StartBreak,
        Self::EndBreak,
        Self::PinToggle,
        Self::DeleteTimeLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClockIn => "clock-in",
            Self::ClockOut => "clock-out",
            Self::StartBreak => "start-break",
            Self::EndBreak => "end-break",
            Self::PinToggle => "pin-toggle",
            Self::DeleteTimeLog => "delete-time-log",
        }
    }

    pub fn target(&self) -> ActionTarget {
        let (method, path) = match self {
            Self::ClockIn => (HttpMethod::Post, "/api/time-logs/clock-in"),
            Self::ClockOut => (HttpMethod::Post, "/api/time-logs/clock-out"),
            Self::StartBreak => (HttpMethod::Post, "/api/breaks/start"),
            Self::EndBreak => (HttpMethod::Post, "/api/breaks/end"),
            Self::PinToggle => (HttpMethod::Post, "/api/tasks/pin"),
            Self::DeleteTimeLog => (HttpMethod::Delete, "/api/time-logs"),
        };
        ActionTarget { method, path }
    }
}

impl std::fmt::Display for ActionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionEndpoint {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown action endpoint: {}", s))
    }
}

/// A write waiting for delivery. Persisted after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    pub endpoint: ActionEndpoint,
    pub body: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
    pub max_retries: u32,
    /// Earliest time the next delivery attempt may run; unset means due now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn new(endpoint: ActionEndpoint, body: Map<String, Value>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint,
            body,
            created_at: Utc::now(),
            retries: 0,
            max_retries,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }
}

/// Everything the offline queue persists, under a single storage key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(default)]
    pub pending: Vec<PendingAction>,
    #[serde(default)]
    pub failed: Vec<PendingAction>,
}
