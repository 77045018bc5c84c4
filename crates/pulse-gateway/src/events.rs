//! Event bus: in-process publish/subscribe hub for realtime events.
//!
//! Domain mutations call `publish`; every open stream connection holds one
//! listener. Fan-out is synchronous: `publish` returns after every listener
//! registered at that moment has been invoked. Nothing is buffered, so a
//! listener only ever sees events published after it subscribed.
//!
//! Open connections are refcounted with `retain_connection` /
//! `release_connection`; the heartbeat task runs only while the count is
//! above zero.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_types::event::{Event, EventName, Scope};

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

struct Registry {
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

struct Connections {
    count: usize,
    heartbeat: Option<JoinHandle<()>>,
}

struct BusInner {
    last_event_id: AtomicU64,
    registry: Mutex<Registry>,
    /// Held across id assignment and fan-out so every listener observes ids
    /// in increasing order. Listeners must not publish.
    publish_lock: Mutex<()>,
    connections: Mutex<Connections>,
    heartbeat_interval: Duration,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_heartbeat(DEFAULT_HEARTBEAT)
    }

    pub fn with_heartbeat(heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                last_event_id: AtomicU64::new(0),
                registry: Mutex::new(Registry {
                    listeners: Vec::new(),
                    next_listener_id: 1,
                }),
                publish_lock: Mutex::new(()),
                connections: Mutex::new(Connections {
                    count: 0,
                    heartbeat: None,
                }),
                heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
            }),
        }
    }

    /// Assign the next id and deliver the event to every current listener.
    pub fn publish(
        &self,
        name: EventName,
        scope: Scope,
        payload: Option<Map<String, Value>>,
    ) -> Event {
        let _order = lock(&self.inner.publish_lock);
        let id = self.inner.last_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            id,
            name,
            scope,
            timestamp: Utc::now(),
            payload,
        };

        // Snapshot so listeners may unsubscribe (themselves or others) mid-publish.
        let listeners: Vec<Listener> = lock(&self.inner.registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &listeners {
            listener(&event);
        }

        debug!(id, name = %event.name, scope = %event.scope, listeners = listeners.len(), "Published event");
        event
    }

    /// Register a listener. It stays registered until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_listener_id;
        registry.next_listener_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Current counter value. Diagnostic only, not a replay cursor.
    pub fn latest_event_id(&self) -> u64 {
        self.inner.last_event_id.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.registry).listeners.len()
    }

    /// Count one more open connection; 0 → 1 starts the heartbeat.
    pub fn retain_connection(&self) {
        let mut conns = lock(&self.inner.connections);
        conns.count += 1;
        if conns.count == 1 && conns.heartbeat.is_none() {
            conns.heartbeat = self.start_heartbeat();
        }
    }

    /// Count one fewer open connection; 1 → 0 stops the heartbeat. Never
    /// drops below zero.
    pub fn release_connection(&self) {
        let mut conns = lock(&self.inner.connections);
        if conns.count == 0 {
            warn!("release_connection called with no open connections; ignoring");
            return;
        }
        conns.count -= 1;
        if conns.count == 0 {
            if let Some(task) = conns.heartbeat.take() {
                task.abort();
                info!("Heartbeat stopped");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).count
    }

    pub fn heartbeat_running(&self) -> bool {
        lock(&self.inner.connections).heartbeat.is_some()
    }

    fn start_heartbeat(&self) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available; heartbeat disabled");
                return None;
            }
        };
        let period = self.inner.heartbeat_interval;
        let bus = Arc::downgrade(&self.inner);
        info!("Heartbeat started (every {period:?})");

        Some(runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(inner) = bus.upgrade() else { break };
                EventBus { inner }.publish(EventName::Heartbeat, Scope::All, None);
            }
        }))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one registered listener.
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner.registry).listeners.retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// A panicking listener must not wedge the bus for everyone else.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
