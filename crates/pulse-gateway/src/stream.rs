//! Stream endpoint: turns a bus subscription into a long-lived outbound
//! text stream for one authenticated, scope-filtered connection.
//!
//! A connection goes `opening → streaming → closed`. Opening authenticates
//! the caller; streaming retains a bus connection, writes the prelude and
//! then one frame per matching event; closing unsubscribes and releases the
//! bus connection exactly once, whichever side ended it.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use pulse_types::event::{Event, Scope};
use pulse_types::role::{Identity, Role};
use pulse_types::wire;

use crate::auth::{role_permitted, Authenticator, ConnectRequest};
use crate::events::{EventBus, Subscription};

pub type ScopeSet = BTreeSet<Scope>;

/// Terminal outcome of a failed open. The server never retries these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamRejection {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
}

impl StreamRejection {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({ "success": false, "error": self.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or the server closed the stream.
    Cancelled,
    /// A frame could not be handed to the transport.
    WriteFailed,
}

/// Parse the `scopes` query value. Unknown tokens are dropped; nothing valid
/// means everything.
pub fn parse_scopes(raw: Option<&str>) -> ScopeSet {
    let scopes: ScopeSet = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter_map(|token| token.parse().ok())
        .collect();
    if scopes.is_empty() {
        ScopeSet::from([Scope::All])
    } else {
        scopes
    }
}

/// `all` on either side always matches.
pub fn in_scope(event: &Event, requested: &ScopeSet) -> bool {
    event.scope == Scope::All || requested.contains(&Scope::All) || requested.contains(&event.scope)
}

/// Factory for stream connections; one is shared by every inbound request.
pub struct StreamEndpoint {
    bus: EventBus,
    auth: Arc<dyn Authenticator>,
    allowed_roles: Vec<Role>,
    retry_ms: u64,
    next_connection_id: AtomicU64,
}

impl StreamEndpoint {
    pub fn new(
        bus: EventBus,
        auth: Arc<dyn Authenticator>,
        allowed_roles: Vec<Role>,
        retry_ms: u64,
    ) -> Self {
        Self {
            bus,
            auth,
            allowed_roles,
            retry_ms,
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn open(&self, request: &ConnectRequest) -> Result<StreamConnection, StreamRejection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let identity = match self.auth.authenticate(request).await {
            Some(identity) => identity,
            None => {
                info!(connection = id, "Stream rejected: unauthenticated");
                return Err(StreamRejection::Unauthorized);
            }
        };
        if !role_permitted(identity.role, &self.allowed_roles) {
            info!(connection = id, user = %identity.user_id, role = %identity.role, "Stream rejected: role not permitted");
            return Err(StreamRejection::Forbidden);
        }

        let scopes = parse_scopes(request.scopes.as_deref());
        self.bus.retain_connection();

        let (tx, frames) = mpsc::unbounded_channel();
        let _ = tx.send(wire::retry_frame(self.retry_ms));
        let _ = tx.send(wire::latest_id_frame(self.bus.latest_event_id()));

        let guard = Arc::new(ConnectionGuard {
            id,
            bus: self.bus.clone(),
            closed: AtomicBool::new(false),
            subscription: Mutex::new(None),
        });

        let weak_guard = Arc::downgrade(&guard);
        let filter = scopes.clone();
        let subscription = self.bus.subscribe(move |event| {
            if !in_scope(event, &filter) {
                return;
            }
            let frame = match wire::event_frame(event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection = id, event = event.id, "Failed to encode event frame: {e}");
                    return;
                }
            };
            if tx.send(frame).is_err() {
                if let Some(guard) = weak_guard.upgrade() {
                    guard.close(CloseReason::WriteFailed);
                }
            }
        });
        *guard.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        info!(
            connection = id,
            user = %identity.user_id,
            scopes = ?scopes,
            "Stream connection opened"
        );

        Ok(StreamConnection {
            id,
            identity,
            scopes,
            frames,
            guard,
        })
    }
}

/// Owns the release side of a connection. `close` does its work once.
struct ConnectionGuard {
    id: u64,
    bus: EventBus,
    closed: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl ConnectionGuard {
    fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.bus.release_connection();
        info!(connection = self.id, reason = ?reason, "Stream connection closed");
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One open stream. Dropping it counts as a client cancel.
pub struct StreamConnection {
    id: u64,
    identity: Identity,
    scopes: ScopeSet,
    frames: mpsc::UnboundedReceiver<String>,
    guard: Arc<ConnectionGuard>,
}

impl StreamConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    pub fn state(&self) -> ConnectionState {
        if self.guard.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Streaming
        }
    }

    /// Next formatted frame; `None` once closed and drained.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.frames.recv().await
    }

    pub fn try_next_frame(&mut self) -> Option<String> {
        self.frames.try_recv().ok()
    }

    /// Returns `true` only for the call that actually released the connection.
    pub fn close(&self) -> bool {
        self.guard.close(CloseReason::Cancelled)
    }

    /// Response body stream; dropping it (client hang-up) closes the connection.
    pub fn into_stream(self) -> impl Stream<Item = Result<String, Infallible>> + Send {
        futures_util::stream::unfold(self, |mut conn| async move {
            conn.next_frame().await.map(|frame| (Ok(frame), conn))
        })
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.guard.close(CloseReason::Cancelled);
    }
}
