//! Client transport: consumes the realtime stream, reconnects with backoff,
//! fails over between endpoint candidates and degrades to interval polling.
//!
//! ```text
//!              open                       error, candidate left
//! reconnecting ─────► connected ──────────────────────────────┐
//!   ▲    │  ▲            │ error, none left                    │ failover delay
//!   │    │  └────────────┴──── backoff(attempt) ◄──────────────┘
//!   │    │ attempts == max
//!   │    ▼
//!   └─ offline-fallback   (poll timer invokes the refetch callback;
//!      recovery timer        a separate timer probes the candidates in order)
//! ```
//!
//! The candidate cursor restarts at the primary on open, when a live stream
//! drops, and on every recovery probe. A probe walks the whole list before
//! the transport returns to polling.
//!
//! All timers are tokio tasks owned by the instance and aborted on
//! [`ClientTransport::shutdown`]. The underlying stream is abstracted behind
//! [`StreamConnector`], which reports back through a [`TransportLink`]; a link
//! goes stale as soon as the transport moves on to another stream, so late
//! callbacks from an abandoned stream are ignored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_types::config::ClientConfig;
use pulse_types::event::{Event, EventName, Scope};
use pulse_types::wire::RawFrame;

use crate::backoff;

const MIN_FALLBACK_POLL: Duration = Duration::from_secs(30);
const MAX_FALLBACK_POLL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportState {
    Reconnecting,
    Connected,
    OfflineFallback,
    Terminated,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Connected => write!(f, "connected"),
            Self::OfflineFallback => write!(f, "offline-fallback"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Plain view of the transport for status indicators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub state: TransportState,
    pub last_event_id: Option<u64>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub using_fallback: bool,
    pub reconnect_attempts: u32,
    pub endpoint: Option<String>,
    /// Bus counter the server reported when the current stream opened.
    pub server_latest_event_id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub endpoints: Vec<String>,
    pub scopes: Vec<Scope>,
    pub invalidate_on: HashSet<EventName>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub failover_delay: Duration,
    pub fallback_poll_interval: Duration,
    pub fallback_retry_base: Duration,
    pub fallback_retry_max_attempts: u32,
    pub fallback_retry_max: Duration,
    pub debounce: Duration,
}

impl From<&ClientConfig> for TransportOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            scopes: config.scopes.clone(),
            invalidate_on: config.invalidate_on.iter().copied().collect(),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            failover_delay: Duration::from_millis(config.failover_delay_ms),
            fallback_poll_interval: Duration::from_secs(config.fallback_poll_secs),
            fallback_retry_base: Duration::from_millis(config.fallback_retry_base_ms),
            fallback_retry_max_attempts: config.fallback_retry_max_attempts,
            fallback_retry_max: Duration::from_millis(config.fallback_retry_max_ms),
            debounce: Duration::from_millis(config.debounce_ms),
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl TransportOptions {
    /// Fallback poll period, clamped to [30s, 300s].
    pub fn poll_interval(&self) -> Duration {
        self.fallback_poll_interval
            .clamp(MIN_FALLBACK_POLL, MAX_FALLBACK_POLL)
    }

    pub fn stream_url(&self, endpoint: &str) -> String {
        if self.scopes.is_empty() {
            return endpoint.to_string();
        }
        let scopes = self
            .scopes
            .iter()
            .map(Scope::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let sep = if endpoint.contains('?') { '&' } else { '?' };
        format!("{endpoint}{sep}scopes={scopes}")
    }
}

/// Opens the underlying stream. Implementations report open, error and
/// frames through the [`TransportLink`] they are handed.
pub trait StreamConnector: Send + Sync + 'static {
    fn open(&self, url: &str, link: TransportLink) -> Box<dyn StreamHandle>;
}

/// A stream opened by a [`StreamConnector`]. `close` must not call back
/// into the transport.
pub trait StreamHandle: Send {
    fn close(&mut self);
}

/// Callback handed to one specific stream.
#[derive(Clone)]
pub struct TransportLink {
    shared: Weak<Shared>,
    generation: u64,
}

impl TransportLink {
    pub fn opened(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_open(Some(self.generation));
        }
    }

    pub fn failed(&self, reason: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_error(Some(self.generation), reason);
        }
    }

    pub fn frame(&self, frame: RawFrame) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_frame(Some(self.generation), frame);
        }
    }

    /// `false` once the transport has moved on to another stream or shut down.
    pub fn is_current(&self) -> bool {
        self.shared.upgrade().map_or(false, |shared| {
            let inner = shared.lock();
            !inner.terminated && inner.generation == self.generation
        })
    }
}

type InvalidateCallback = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    options: TransportOptions,
    connector: Arc<dyn StreamConnector>,
    on_invalidate: InvalidateCallback,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Option<TransportState>,
    attempts: u32,
    candidate: usize,
    fallback_attempts: u32,
    using_fallback: bool,
    /// Bumped whenever the current stream is abandoned.
    generation: u64,
    stream: Option<Box<dyn StreamHandle>>,
    endpoint: Option<String>,
    last_event_id: Option<u64>,
    last_event_at: Option<DateTime<Utc>>,
    server_latest_event_id: Option<u64>,
    started: bool,
    terminated: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    fallback_poll: Option<JoinHandle<()>>,
    fallback_retry: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
}

impl Inner {
    fn state(&self) -> TransportState {
        self.state.unwrap_or(TransportState::Reconnecting)
    }

    fn is_stale(&self, generation: Option<u64>) -> bool {
        self.terminated || generation.map_or(false, |g| g != self.generation)
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

fn cancel(timer: &mut Option<JoinHandle<()>>) {
    if let Some(task) = timer.take() {
        task.abort();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(self: &Arc<Self>) {
        let (url, generation) = {
            let mut inner = self.lock();
            if inner.terminated {
                return;
            }
            inner.close_stream();
            inner.generation += 1;
            inner.state = Some(TransportState::Reconnecting);
            let index = inner.candidate.min(self.options.endpoints.len() - 1);
            let endpoint = self.options.endpoints[index].clone();
            let url = self.options.stream_url(&endpoint);
            inner.endpoint = Some(endpoint);
            (url, inner.generation)
        };

        debug!("Opening realtime stream {url}");
        let link = TransportLink {
            shared: Arc::downgrade(self),
            generation,
        };
        // The connector may report synchronously, so no lock is held here.
        let mut handle = self.connector.open(&url, link);

        let mut inner = self.lock();
        if inner.is_stale(Some(generation)) {
            drop(inner);
            handle.close();
        } else {
            inner.stream = Some(handle);
        }
    }

    fn on_open(self: &Arc<Self>, generation: Option<u64>) {
        let mut inner = self.lock();
        if inner.is_stale(generation) {
            return;
        }
        inner.state = Some(TransportState::Connected);
        inner.attempts = 0;
        inner.candidate = 0;
        inner.fallback_attempts = 0;
        inner.using_fallback = false;
        cancel(&mut inner.reconnect_timer);
        cancel(&mut inner.fallback_poll);
        cancel(&mut inner.fallback_retry);
        info!(endpoint = ?inner.endpoint, "Realtime stream connected");
    }

    fn on_error(self: &Arc<Self>, generation: Option<u64>, reason: &str) {
        let mut inner = self.lock();
        if inner.is_stale(generation) {
            return;
        }
        inner.generation += 1;
        inner.close_stream();
        let has_next_candidate = inner.candidate + 1 < self.options.endpoints.len();

        if inner.using_fallback {
            if has_next_candidate {
                inner.candidate += 1;
                inner.state = Some(TransportState::Reconnecting);
                debug!(
                    candidate = inner.candidate,
                    "Recovery probe failed ({reason}); trying next endpoint"
                );
                self.schedule_connect(&mut inner, self.options.failover_delay);
                return;
            }
            inner.state = Some(TransportState::OfflineFallback);
            debug!("Recovery probe failed on every endpoint: {reason}");
            self.schedule_fallback_retry(&mut inner);
            return;
        }

        // A live stream dropped: start a fresh round from the primary.
        if inner.state() == TransportState::Connected {
            inner.state = Some(TransportState::Reconnecting);
            inner.candidate = 0;
            inner.attempts = 0;
            info!("Realtime stream dropped ({reason}); reconnecting from primary endpoint");
            self.schedule_connect(&mut inner, self.options.failover_delay);
            return;
        }

        inner.state = Some(TransportState::Reconnecting);
        if has_next_candidate {
            inner.candidate += 1;
            inner.attempts = 0;
            info!(
                candidate = inner.candidate,
                "Realtime stream failed ({reason}); failing over to next endpoint"
            );
            self.schedule_connect(&mut inner, self.options.failover_delay);
            return;
        }

        if inner.attempts >= self.options.max_reconnect_attempts {
            self.enter_fallback(&mut inner);
            return;
        }

        let delay = backoff::exponential(self.options.base_delay, self.options.max_delay, inner.attempts);
        inner.attempts += 1;
        warn!(
            attempt = inner.attempts,
            delay_ms = delay.as_millis() as u64,
            "Realtime stream failed ({reason}); reconnecting"
        );
        self.schedule_connect(&mut inner, delay);
    }

    fn on_frame(self: &Arc<Self>, generation: Option<u64>, frame: RawFrame) {
        let mut inner = self.lock();
        if inner.is_stale(generation) {
            return;
        }
        if let Some(latest) = frame.latest_event_id() {
            inner.server_latest_event_id = Some(latest);
        }
        let Some(data) = frame.data.as_deref() else {
            return;
        };
        let event: Event = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping malformed frame: {e}");
                return;
            }
        };

        inner.last_event_id = Some(event.id);
        inner.last_event_at = Some(Utc::now());
        if self.options.invalidate_on.contains(&event.name) {
            self.schedule_invalidate(&mut inner);
        }
    }

    fn schedule_connect(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        cancel(&mut inner.reconnect_timer);
        let shared = Arc::downgrade(self);
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.connect();
            }
        }));
    }

    fn enter_fallback(self: &Arc<Self>, inner: &mut Inner) {
        inner.state = Some(TransportState::OfflineFallback);
        inner.using_fallback = true;
        inner.fallback_attempts = 0;
        inner.candidate = 0;
        inner.endpoint = None;
        cancel(&mut inner.reconnect_timer);

        let period = self.options.poll_interval();
        warn!(
            attempts = inner.attempts,
            poll_secs = period.as_secs(),
            "Realtime stream unavailable; falling back to polling"
        );

        cancel(&mut inner.fallback_poll);
        let shared = Arc::downgrade(self);
        inner.fallback_poll = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else { break };
                (shared.on_invalidate)();
            }
        }));

        self.schedule_fallback_retry(inner);
    }

    fn schedule_fallback_retry(self: &Arc<Self>, inner: &mut Inner) {
        cancel(&mut inner.fallback_retry);
        let cap = self.options.fallback_retry_max_attempts;
        let delay = backoff::exponential(
            self.options.fallback_retry_base,
            self.options.fallback_retry_max,
            inner.fallback_attempts.min(cap),
        );
        inner.fallback_attempts = (inner.fallback_attempts + 1).min(cap);

        let shared = Arc::downgrade(self);
        inner.fallback_retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.recover();
            }
        }));
    }

    fn recover(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            if inner.terminated || !inner.using_fallback {
                return;
            }
            inner.candidate = 0;
        }
        info!("Probing realtime stream from fallback");
        self.connect();
    }

    /// Coalesce a burst: the first matching event arms the timer, later ones
    /// within the window ride along.
    fn schedule_invalidate(self: &Arc<Self>, inner: &mut Inner) {
        if inner.debounce.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        let delay = self.options.debounce;
        let shared = Arc::downgrade(self);
        inner.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                (shared.on_invalidate)();
            }
        }));
    }

    fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.terminated {
            return;
        }
        inner.terminated = true;
        inner.generation += 1;
        inner.state = Some(TransportState::Terminated);
        inner.close_stream();
        cancel(&mut inner.reconnect_timer);
        cancel(&mut inner.fallback_poll);
        cancel(&mut inner.fallback_retry);
        cancel(&mut inner.debounce);
        info!("Realtime transport shut down");
    }
}

/// One logical subscription to the realtime stream.
///
/// Must be started inside a tokio runtime; timers are spawned on it.
pub struct ClientTransport {
    shared: Arc<Shared>,
}

impl ClientTransport {
    pub fn new<F>(
        options: TransportOptions,
        connector: Arc<dyn StreamConnector>,
        on_invalidate: F,
    ) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if options.endpoints.is_empty() {
            anyhow::bail!("At least one stream endpoint is required");
        }
        Ok(Self {
            shared: Arc::new(Shared {
                options,
                connector,
                on_invalidate: Arc::new(on_invalidate),
                inner: Mutex::new(Inner::default()),
            }),
        })
    }

    /// Open the first stream. Later calls are no-ops.
    pub fn start(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.started || inner.terminated {
                return;
            }
            inner.started = true;
        }
        self.shared.connect();
    }

    /// The current stream reported open.
    pub fn handle_open(&self) {
        self.shared.on_open(None);
    }

    /// The current stream failed or closed.
    pub fn handle_error(&self, reason: &str) {
        self.shared.on_error(None, reason);
    }

    /// A frame arrived on the current stream.
    pub fn handle_frame(&self, frame: RawFrame) {
        self.shared.on_frame(None, frame);
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        let inner = self.shared.lock();
        TransportSnapshot {
            state: inner.state(),
            last_event_id: inner.last_event_id,
            last_event_at: inner.last_event_at,
            using_fallback: inner.using_fallback,
            reconnect_attempts: inner.attempts,
            endpoint: inner.endpoint.clone(),
            server_latest_event_id: inner.server_latest_event_id,
        }
    }

    /// Close the stream and cancel every timer. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHandle {
        closed: Arc<AtomicUsize>,
    }

    impl StreamHandle for FakeHandle {
        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        opened: Mutex<Vec<(String, TransportLink)>>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn opens(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn last(&self) -> TransportLink {
            self.opened.lock().unwrap().last().unwrap().1.clone()
        }

        fn last_url(&self) -> String {
            self.opened.lock().unwrap().last().unwrap().0.clone()
        }
    }

    impl StreamConnector for FakeConnector {
        fn open(&self, url: &str, link: TransportLink) -> Box<dyn StreamHandle> {
            self.opened.lock().unwrap().push((url.to_string(), link));
            Box::new(FakeHandle {
                closed: Arc::clone(&self.closed),
            })
        }
    }

    fn options() -> TransportOptions {
        TransportOptions {
            endpoints: vec!["http://a/stream".into(), "http://b/stream".into()],
            scopes: vec![Scope::Tasks],
            fallback_poll_interval: Duration::from_secs(30),
            fallback_retry_base: Duration::from_secs(600),
            ..Default::default()
        }
    }

    fn setup(options: TransportOptions) -> (ClientTransport, Arc<FakeConnector>, Arc<AtomicUsize>) {
        let connector = Arc::new(FakeConnector::default());
        let invalidations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invalidations);
        let transport = ClientTransport::new(options, connector.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (transport, connector, invalidations)
    }

    /// Advance virtual time in small steps until `n` streams have been opened.
    async fn wait_for_opens(connector: &FakeConnector, n: usize) {
        for _ in 0..10_000 {
            if connector.opens() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {n} opens, saw {}", connector.opens());
    }

    fn event_frame(id: u64, name: EventName) -> RawFrame {
        let event = Event {
            id,
            name,
            scope: Scope::Tasks,
            timestamp: Utc::now(),
            payload: None,
        };
        RawFrame::data(serde_json::to_string(&event).unwrap())
    }

    #[test]
    fn stream_url_appends_scopes() {
        let mut opts = options();
        opts.scopes = vec![Scope::Tasks, Scope::Monitor];
        assert_eq!(opts.stream_url("http://a/stream"), "http://a/stream?scopes=tasks,monitor");
        assert_eq!(opts.stream_url("http://a/stream?x=1"), "http://a/stream?x=1&scopes=tasks,monitor");
        opts.scopes.clear();
        assert_eq!(opts.stream_url("http://a/stream"), "http://a/stream");
    }

    #[test]
    fn poll_interval_is_clamped() {
        let mut opts = options();
        opts.fallback_poll_interval = Duration::from_secs(5);
        assert_eq!(opts.poll_interval(), Duration::from_secs(30));
        opts.fallback_poll_interval = Duration::from_secs(3600);
        assert_eq!(opts.poll_interval(), Duration::from_secs(300));
        opts.fallback_poll_interval = Duration::from_secs(90);
        assert_eq!(opts.poll_interval(), Duration::from_secs(90));
    }

    #[test]
    fn requires_an_endpoint() {
        let opts = TransportOptions {
            endpoints: vec![],
            ..Default::default()
        };
        assert!(ClientTransport::new(opts, Arc::new(FakeConnector::default()), || {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn open_resets_attempts() {
        let (transport, connector, _) = setup(options());
        transport.start();
        transport.start();
        assert_eq!(connector.opens(), 1);
        assert_eq!(transport.snapshot().state, TransportState::Reconnecting);
        assert!(connector.last_url().starts_with("http://a/stream?scopes=tasks"));

        // Primary fails: fast failover to the secondary.
        connector.last().failed("refused");
        wait_for_opens(&connector, 2).await;
        assert!(connector.last_url().starts_with("http://b/stream"));

        // Secondary fails: backoff retry.
        connector.last().failed("refused");
        assert_eq!(transport.snapshot().reconnect_attempts, 1);
        wait_for_opens(&connector, 3).await;

        connector.last().opened();
        let snap = transport.snapshot();
        assert_eq!(snap.state, TransportState::Connected);
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(!snap.using_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_candidates_enters_fallback_polling() {
        let (transport, connector, invalidations) = setup(options());
        transport.start();

        // Failover, then five backoff retries, then fallback.
        for n in 1..=7 {
            wait_for_opens(&connector, n).await;
            connector.last().failed("refused");
        }

        let snap = transport.snapshot();
        assert_eq!(snap.state, TransportState::OfflineFallback);
        assert!(snap.using_fallback);
        assert_eq!(connector.opens(), 7);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(invalidations.load(Ordering::SeqCst), 3);
        assert_eq!(connector.opens(), 7, "recovery probe is not due yet");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_recovers_on_primary() {
        let opts = TransportOptions {
            fallback_retry_base: Duration::from_secs(45),
            max_reconnect_attempts: 0,
            ..options()
        };
        let (transport, connector, invalidations) = setup(opts);
        transport.start();
        connector.last().failed("refused");
        wait_for_opens(&connector, 2).await;
        connector.last().failed("refused");
        assert_eq!(transport.snapshot().state, TransportState::OfflineFallback);

        // First probe after 45s walks both endpoints; the next one waits 90s.
        wait_for_opens(&connector, 3).await;
        assert!(connector.last_url().starts_with("http://a/stream"));
        assert_eq!(transport.snapshot().state, TransportState::Reconnecting);
        connector.last().failed("still down");
        assert_eq!(transport.snapshot().state, TransportState::Reconnecting);
        wait_for_opens(&connector, 4).await;
        assert!(connector.last_url().starts_with("http://b/stream"));
        connector.last().failed("still down");
        assert_eq!(transport.snapshot().state, TransportState::OfflineFallback);

        tokio::time::sleep(Duration::from_secs(80)).await;
        assert_eq!(connector.opens(), 4);
        wait_for_opens(&connector, 5).await;
        assert!(connector.last_url().starts_with("http://a/stream"));
        connector.last().opened();

        let snap = transport.snapshot();
        assert_eq!(snap.state, TransportState::Connected);
        assert!(!snap.using_fallback);

        let polled = invalidations.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(invalidations.load(Ordering::SeqCst), polled, "polling stops once connected");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_recovers_on_secondary() {
        let opts = TransportOptions {
            fallback_retry_base: Duration::from_secs(45),
            max_reconnect_attempts: 0,
            ..options()
        };
        let (transport, connector, _) = setup(opts);
        transport.start();
        connector.last().failed("refused");
        wait_for_opens(&connector, 2).await;
        connector.last().failed("refused");
        assert_eq!(transport.snapshot().state, TransportState::OfflineFallback);

        // The primary stays blocked; the probe moves on to the secondary.
        wait_for_opens(&connector, 3).await;
        assert!(connector.last_url().starts_with("http://a/stream"));
        connector.last().failed("blocked");
        wait_for_opens(&connector, 4).await;
        assert!(connector.last_url().starts_with("http://b/stream"));
        connector.last().opened();

        let snap = transport.snapshot();
        assert_eq!(snap.state, TransportState::Connected);
        assert!(!snap.using_fallback);
        assert_eq!(snap.endpoint.as_deref(), Some("http://b/stream"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_reconnects_from_primary() {
        let (transport, connector, _) = setup(options());
        transport.start();
        connector.last().failed("refused");
        wait_for_opens(&connector, 2).await;
        assert!(connector.last_url().starts_with("http://b/stream"));
        connector.last().opened();

        connector.last().failed("stream ended");
        let snap = transport.snapshot();
        assert_eq!(snap.state, TransportState::Reconnecting);
        assert_eq!(snap.reconnect_attempts, 0);
        wait_for_opens(&connector, 3).await;
        assert!(connector.last_url().starts_with("http://a/stream"));

        // Primary still down: fail over to the secondary again.
        connector.last().failed("refused");
        wait_for_opens(&connector, 4).await;
        assert!(connector.last_url().starts_with("http://b/stream"));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_update_state_and_debounce_invalidate() {
        let mut opts = options();
        opts.invalidate_on = HashSet::from([EventName::TaskAssignmentChanged]);
        let (transport, connector, invalidations) = setup(opts);
        transport.start();
        let link = connector.last();
        link.opened();

        link.frame(RawFrame::data("{not json"));
        assert_eq!(transport.snapshot().last_event_id, None);
        assert_eq!(transport.snapshot().state, TransportState::Connected);

        link.frame(event_frame(4, EventName::TaskAssignmentChanged));
        link.frame(event_frame(5, EventName::TaskAssignmentChanged));
        tokio::time::sleep(Duration::from_millis(100)).await;
        link.frame(event_frame(6, EventName::TaskAssignmentChanged));
        link.frame(event_frame(7, EventName::Heartbeat));

        let snap = transport.snapshot();
        assert_eq!(snap.last_event_id, Some(7));
        assert!(snap.last_event_at.is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);

        link.frame(event_frame(8, EventName::Heartbeat));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prelude_comment_records_server_latest_id() {
        let (transport, connector, _) = setup(options());
        transport.start();
        connector.last().frame(RawFrame {
            comments: vec!["latest_event_id=12".into()],
            ..Default::default()
        });
        let snap = transport.snapshot();
        assert_eq!(snap.server_latest_event_id, Some(12));
        assert_eq!(snap.last_event_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_links_are_ignored() {
        let (transport, connector, _) = setup(options());
        transport.start();
        let first = connector.last();
        first.failed("refused");
        assert!(!first.is_current());

        first.opened();
        first.failed("again");
        assert_eq!(transport.snapshot().state, TransportState::Reconnecting);

        wait_for_opens(&connector, 2).await;
        let second = connector.last();
        assert!(second.is_current());
        second.opened();
        assert_eq!(transport.snapshot().state, TransportState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything() {
        let opts = TransportOptions {
            max_reconnect_attempts: 0,
            fallback_retry_base: Duration::from_secs(40),
            ..options()
        };
        let (transport, connector, invalidations) = setup(opts);
        transport.start();
        connector.last().failed("refused");
        wait_for_opens(&connector, 2).await;
        connector.last().failed("refused");
        assert_eq!(transport.snapshot().state, TransportState::OfflineFallback);

        transport.shutdown();
        transport.shutdown();
        assert_eq!(transport.snapshot().state, TransportState::Terminated);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(invalidations.load(Ordering::SeqCst), 0);
        assert_eq!(connector.opens(), 2);

        transport.handle_open();
        assert_eq!(transport.snapshot().state, TransportState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_open_stream() {
        let (transport, connector, _) = setup(options());
        transport.start();
        connector.last().opened();
        drop(transport);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }
}
