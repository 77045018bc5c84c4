pub mod auth;
pub mod config;
pub mod events;
pub mod server;
pub mod stream;

pub use events::{EventBus, Subscription};
pub use stream::{StreamConnection, StreamEndpoint, StreamRejection};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::warn;

use pulse_types::config::GatewayConfig;
use pulse_types::event::{Event, EventName, Scope};

use auth::{Authenticator, StaticTokenAuthenticator};

/// The realtime gateway. Owns the event bus and the stream endpoint.
///
/// Construct one per process and hand `bus()` to every publisher; there is
/// no global instance.
pub struct Gateway {
    config: GatewayConfig,
    bus: EventBus,
    endpoint: Arc<StreamEndpoint>,
}

impl Gateway {
    /// Gateway using the static token grants from config.
    pub fn new(config: GatewayConfig) -> Self {
        let auth = StaticTokenAuthenticator::new(&config.tokens);
        if auth.is_empty() {
            warn!("No gateway tokens configured; every stream request will be rejected");
        }
        Self::with_authenticator(config, Arc::new(auth))
    }

    pub fn with_authenticator(config: GatewayConfig, auth: Arc<dyn Authenticator>) -> Self {
        let bus = EventBus::with_heartbeat(Duration::from_secs(config.heartbeat_secs.max(1)));
        let endpoint = Arc::new(StreamEndpoint::new(
            bus.clone(),
            auth,
            config.allowed_roles.clone(),
            config.retry_ms,
        ));
        Self {
            config,
            bus,
            endpoint,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn endpoint(&self) -> Arc<StreamEndpoint> {
        Arc::clone(&self.endpoint)
    }

    pub fn publish(&self, name: EventName, scope: Scope, payload: Option<Map<String, Value>>) -> Event {
        self.bus.publish(name, scope, payload)
    }

    pub async fn serve(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        server::serve(self.endpoint(), &addr).await
    }
}
