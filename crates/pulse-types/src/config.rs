use serde::{Deserialize, Serialize};

use crate::event::{EventName, Scope};
use crate::role::Role;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub gateway: GatewayConfig,
    pub client: ClientConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Heartbeat period while at least one stream is open.
    pub heartbeat_secs: u64,
    /// Reconnection delay advertised to clients in the stream prelude.
    pub retry_ms: u64,
    /// Roles allowed to open a stream.
    pub allowed_roles: Vec<Role>,
    /// Static bearer tokens accepted by the built-in authenticator.
    pub tokens: Vec<TokenGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Stream endpoint candidates, tried in order.
    pub endpoints: Vec<String>,
    pub scopes: Vec<Scope>,
    /// Events that trigger the consumer's refetch callback.
    pub invalidate_on: Vec<EventName>,
    pub token: Option<String>,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub failover_delay_ms: u64,
    pub fallback_poll_secs: u64,
    pub fallback_retry_base_ms: u64,
    pub fallback_retry_max_attempts: u32,
    pub fallback_retry_max_ms: u64,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19080,
            log_level: "info".to_string(),
            heartbeat_secs: 25,
            retry_ms: 2000,
            allowed_roles: vec![Role::Admin, Role::Manager],
            tokens: vec![],
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:19080/api/realtime/stream".to_string()],
            scopes: vec![Scope::All],
            invalidate_on: vec![
                EventName::TaskAssignmentChanged,
                EventName::TimeLogChanged,
                EventName::BreakChanged,
                EventName::WorkerStatusChanged,
            ],
            token: None,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            failover_delay_ms: 100,
            fallback_poll_secs: 60,
            fallback_retry_base_ms: 30_000,
            fallback_retry_max_attempts: 4,
            fallback_retry_max_ms: 300_000,
            debounce_ms: 500,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".to_string(),
            api_key: None,
            api_key_header: "x-api-key".to_string(),
            max_retries: 3,
            retry_base_ms: 1000,
            retry_max_ms: 30_000,
        }
    }
}
