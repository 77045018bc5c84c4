use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kinds of state change pushed to dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    TaskAssignmentChanged,
    TimeLogChanged,
    BreakChanged,
    WorkerStatusChanged,
    Heartbeat,
}

impl EventName {
    pub const ALL: [EventName; 5] = [
        Self::TaskAssignmentChanged,
        Self::TimeLogChanged,
        Self::BreakChanged,
        Self::WorkerStatusChanged,
        Self::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssignmentChanged => "task_assignment_changed",
            Self::TimeLogChanged => "time_log_changed",
            Self::BreakChanged => "break_changed",
            Self::WorkerStatusChanged => "worker_status_changed",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown event name: {}", s))
    }
}

/// Coarse routing tag. `All` is a wildcard on both the publish and the
/// subscribe side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Tasks,
    Monitor,
    All,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tasks => write!(f, "tasks"),
            Self::Monitor => write!(f, "monitor"),
            Self::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tasks" => Ok(Self::Tasks),
            "monitor" => Ok(Self::Monitor),
            "all" => Ok(Self::All),
            _ => Err(anyhow::anyhow!("unknown scope: {}", s)),
        }
    }
}

/// A published state change. Ids are assigned by the bus and strictly
/// increase for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    pub name: EventName,
    pub scope: Scope,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

impl Event {
    /// Payload field lookup, `None` when there is no payload or no such key.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }
}
