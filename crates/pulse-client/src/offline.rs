//! Durable write queue for intermittently connected clients.
//!
//! Actions are persisted under a single storage key after every mutation.
//! `sync` drains due actions in enqueue order; a failed action is pushed to
//! the tail with a backoff deadline and a timer re-triggers `sync` once it is
//! due, so one stuck action never blocks the rest. Ordering across retries is
//! therefore not FIFO.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_types::action::{ActionEndpoint, PendingAction, QueueSnapshot};
use pulse_types::config::QueueConfig;

use crate::backoff;
use crate::sender::{ActionSender, SendError};
use crate::storage::Storage;

pub const STORAGE_KEY: &str = "pulse.offline-queue";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
    pub syncing: bool,
    pub online: bool,
}

/// Wall-clock time advanced by the tokio clock, so retry deadlines and the
/// timers that wake for them agree.
struct QueueClock {
    wall: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl QueueClock {
    fn new() -> Self {
        Self {
            wall: Utc::now(),
            start: tokio::time::Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

struct QueueInner {
    storage: Arc<dyn Storage>,
    sender: Arc<dyn ActionSender>,
    options: QueueOptions,
    state: Mutex<QueueSnapshot>,
    online: AtomicBool,
    syncing: AtomicBool,
    /// Set when `sync` is requested while a pass is running.
    rerun: AtomicBool,
    clock: QueueClock,
    retry_timers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueInner {
    fn persist(&self, state: &QueueSnapshot) -> Result<()> {
        let raw = serde_json::to_string(state).context("Failed to serialize offline queue")?;
        self.storage
            .set(STORAGE_KEY, &raw)
            .context("Failed to persist offline queue")
    }

    async fn run_sync(self: &Arc<Self>) -> Result<()> {
        loop {
            if !self.online.load(Ordering::SeqCst) {
                debug!("Offline; sync deferred");
                return Ok(());
            }
            if self.syncing.swap(true, Ordering::SeqCst) {
                self.rerun.store(true, Ordering::SeqCst);
                if self.syncing.load(Ordering::SeqCst) {
                    return Ok(());
                }
                continue;
            }

            self.rerun.store(false, Ordering::SeqCst);
            let result = self.drain().await;
            self.syncing.store(false, Ordering::SeqCst);
            result?;

            if !self.rerun.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    async fn drain(self: &Arc<Self>) -> Result<()> {
        loop {
            if !self.online.load(Ordering::SeqCst) {
                return Ok(());
            }
            let now = self.clock.now();
            let next = lock(&self.state)
                .pending
                .iter()
                .find(|a| a.is_due(now))
                .cloned();
            let Some(action) = next else {
                return Ok(());
            };

            match self.sender.send(&action).await {
                Ok(()) => {
                    let mut state = lock(&self.state);
                    state.pending.retain(|a| a.id != action.id);
                    self.persist(&state)?;
                    debug!(id = %action.id, endpoint = %action.endpoint, "Delivered queued action");
                }
                Err(e) => self.record_failure(&action, &e)?,
            }
        }
    }

    fn record_failure(self: &Arc<Self>, action: &PendingAction, err: &SendError) -> Result<()> {
        let mut state = lock(&self.state);
        let Some(pos) = state.pending.iter().position(|a| a.id == action.id) else {
            return Ok(());
        };
        let mut entry = state.pending.remove(pos);
        entry.last_error = Some(err.to_string());

        if entry.retries_exhausted() {
            entry.next_attempt_at = None;
            warn!(
                id = %entry.id,
                endpoint = %entry.endpoint,
                retries = entry.retries,
                "Queued action failed permanently: {err}"
            );
            state.failed.push(entry);
            return self.persist(&state);
        }

        let delay = backoff::exponential(self.options.retry_base, self.options.retry_max, entry.retries);
        entry.retries += 1;
        let wait = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        entry.next_attempt_at = Some(self.clock.now() + wait);
        info!(
            id = %entry.id,
            endpoint = %entry.endpoint,
            retry = entry.retries,
            delay_ms = delay.as_millis() as u64,
            "Queued action failed ({err}); will retry"
        );
        state.pending.push(entry);
        let persisted = self.persist(&state);
        drop(state);

        // The deadline is already set in memory, so it needs its timer even
        // when the write failed.
        self.schedule_retry(delay);
        persisted
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let queue = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_detached(queue).await;
        });
        let mut timers = lock(&self.retry_timers);
        timers.retain(|t| !t.is_finished());
        timers.push(task);
    }

    fn spawn_sync(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime; sync must be triggered manually");
            return;
        };
        let queue = Arc::downgrade(self);
        handle.spawn(run_detached(queue));
    }
}

async fn run_detached(queue: Weak<QueueInner>) {
    let Some(queue) = queue.upgrade() else { return };
    if let Err(e) = queue.run_sync().await {
        warn!("Offline queue sync failed: {e:#}");
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        for task in lock(&self.retry_timers).drain(..) {
            task.abort();
        }
    }
}

fn load(storage: &dyn Storage) -> Result<QueueSnapshot> {
    let Some(raw) = storage.get(STORAGE_KEY)? else {
        return Ok(QueueSnapshot::default());
    };
    match serde_json::from_str::<QueueSnapshot>(&raw) {
        Ok(mut snapshot) => {
            // Deadlines from a previous process have no timer behind them.
            for action in &mut snapshot.pending {
                action.next_attempt_at = None;
            }
            Ok(snapshot)
        }
        Err(e) => {
            let backup = format!("{STORAGE_KEY}.corrupt");
            warn!("Offline queue state is corrupt ({e}); saved to {backup} and starting empty");
            storage.set(&backup, &raw)?;
            storage.clear(STORAGE_KEY)?;
            Ok(QueueSnapshot::default())
        }
    }
}

#[derive(Clone)]
pub struct OfflineActionQueue {
    inner: Arc<QueueInner>,
}

impl OfflineActionQueue {
    /// Load persisted state and start online.
    pub fn open(
        storage: Arc<dyn Storage>,
        sender: Arc<dyn ActionSender>,
        options: QueueOptions,
    ) -> Result<Self> {
        let state = load(storage.as_ref())?;
        if !state.pending.is_empty() || !state.failed.is_empty() {
            info!(
                pending = state.pending.len(),
                failed = state.failed.len(),
                "Restored offline queue"
            );
        }
        Ok(Self {
            inner: Arc::new(QueueInner {
                storage,
                sender,
                options,
                state: Mutex::new(state),
                online: AtomicBool::new(true),
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                clock: QueueClock::new(),
                retry_timers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Persist a new action. Starts a sync when the queue was empty and the
    /// network is up.
    pub fn enqueue(&self, endpoint: ActionEndpoint, body: Map<String, Value>) -> Result<PendingAction> {
        let action = PendingAction::new(endpoint, body, self.inner.options.max_retries);
        let was_empty = {
            let mut state = lock(&self.inner.state);
            let was_empty = state.pending.is_empty();
            state.pending.push(action.clone());
            self.inner.persist(&state)?;
            was_empty
        };
        info!(id = %action.id, endpoint = %endpoint, "Queued action");

        if was_empty && self.is_online() {
            self.inner.spawn_sync();
        }
        Ok(action)
    }

    /// Deliver every due action. Returns immediately when offline, when the
    /// queue is empty, or when another pass is already running.
    pub async fn sync(&self) -> Result<()> {
        self.inner.run_sync().await
    }

    /// Connectivity signal. Coming back online starts a sync.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("Network reachable; syncing offline queue");
            self.inner.spawn_sync();
        } else if !online && was_online {
            info!("Network unreachable; queueing writes");
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> QueueStatus {
        let state = lock(&self.inner.state);
        QueueStatus {
            pending: state.pending.len(),
            failed: state.failed.len(),
            syncing: self.inner.syncing.load(Ordering::SeqCst),
            online: self.is_online(),
        }
    }

    pub fn pending(&self) -> Vec<PendingAction> {
        lock(&self.inner.state).pending.clone()
    }

    pub fn failed(&self) -> Vec<PendingAction> {
        lock(&self.inner.state).failed.clone()
    }

    /// Move failed actions (all, or the one with `id`) back to the queue with
    /// a fresh retry budget.
    pub fn retry_failed(&self, id: Option<&str>) -> Result<usize> {
        let moved = {
            let mut state = lock(&self.inner.state);
            let (mut revived, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.failed)
                .into_iter()
                .partition(|a| id.map_or(true, |id| a.id == id));
            state.failed = kept;
            for action in &mut revived {
                action.retries = 0;
                action.next_attempt_at = None;
                action.last_error = None;
            }
            let moved = revived.len();
            state.pending.extend(revived);
            if moved > 0 {
                self.inner.persist(&state)?;
            }
            moved
        };

        if moved > 0 && self.is_online() {
            self.inner.spawn_sync();
        }
        Ok(moved)
    }

    /// Drop one failed action. Returns whether it existed.
    pub fn discard_failed(&self, id: &str) -> Result<bool> {
        let mut state = lock(&self.inner.state);
        let before = state.failed.len();
        state.failed.retain(|a| a.id != id);
        if state.failed.len() == before {
            return Ok(false);
        }
        self.inner.persist(&state)?;
        Ok(true)
    }

    pub fn clear_failed(&self) -> Result<usize> {
        let mut state = lock(&self.inner.state);
        let cleared = state.failed.len();
        if cleared > 0 {
            state.failed.clear();
            self.inner.persist(&state)?;
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(ActionEndpoint, Map<String, Value>)>>,
        failing: HashSet<ActionEndpoint>,
    }

    impl RecordingSender {
        fn failing(endpoints: &[ActionEndpoint]) -> Self {
            Self {
                failing: endpoints.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<ActionEndpoint> {
            self.sent.lock().unwrap().iter().map(|(e, _)| *e).collect()
        }
    }

    #[async_trait]
    impl ActionSender for RecordingSender {
        async fn send(&self, action: &PendingAction) -> Result<(), SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((action.endpoint, action.body.clone()));
            if self.failing.contains(&action.endpoint) {
                return Err(SendError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }
    }

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn options(max_retries: u32) -> QueueOptions {
        QueueOptions {
            max_retries,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
        }
    }

    fn persisted(storage: &MemoryStorage) -> QueueSnapshot {
        serde_json::from_str(&storage.get(STORAGE_KEY).unwrap().unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn offline_enqueue_then_sync_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        let sender = Arc::new(RecordingSender::default());
        let queue = OfflineActionQueue::open(storage.clone(), sender.clone(), options(3)).unwrap();
        queue.set_online(false);

        queue.enqueue(ActionEndpoint::ClockIn, body(json!({"taskId": "t1"}))).unwrap();
        queue.enqueue(ActionEndpoint::StartBreak, Map::new()).unwrap();
        queue.enqueue(ActionEndpoint::ClockOut, Map::new()).unwrap();
        queue.sync().await.unwrap();

        assert!(sender.sent().is_empty());
        assert_eq!(persisted(&storage).pending.len(), 3);

        queue.set_online(true);
        queue.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            sender.sent(),
            vec![ActionEndpoint::ClockIn, ActionEndpoint::StartBreak, ActionEndpoint::ClockOut]
        );
        assert_eq!(sender.sent.lock().unwrap()[0].1, body(json!({"taskId": "t1"})));
        assert!(queue.pending().is_empty());
        assert!(persisted(&storage).pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_while_online_syncs_automatically() {
        let sender = Arc::new(RecordingSender::default());
        let queue =
            OfflineActionQueue::open(Arc::new(MemoryStorage::new()), sender.clone(), options(3)).unwrap();

        queue.enqueue(ActionEndpoint::PinToggle, Map::new()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sender.sent(), vec![ActionEndpoint::PinToggle]);
        assert_eq!(queue.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_action_moves_to_failed() {
        let storage = Arc::new(MemoryStorage::new());
        let sender = Arc::new(RecordingSender::failing(&[ActionEndpoint::ClockIn]));
        let queue = OfflineActionQueue::open(storage.clone(), sender.clone(), options(2)).unwrap();
        queue.set_online(false);
        queue.enqueue(ActionEndpoint::ClockIn, Map::new()).unwrap();
        queue.set_online(true);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(sender.sent().len(), 3);
        assert!(queue.pending().is_empty());
        let failed = queue.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retries, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("server responded 503: unavailable"));
        assert_eq!(persisted(&storage).failed.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sender.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_action_does_not_block_others() {
        let sender = Arc::new(RecordingSender::failing(&[ActionEndpoint::ClockIn]));
        let queue =
            OfflineActionQueue::open(Arc::new(MemoryStorage::new()), sender.clone(), options(3)).unwrap();
        queue.set_online(false);
        queue.enqueue(ActionEndpoint::ClockIn, Map::new()).unwrap();
        queue.enqueue(ActionEndpoint::ClockOut, Map::new()).unwrap();
        queue.set_online(true);
        queue.sync().await.unwrap();

        assert_eq!(sender.sent(), vec![ActionEndpoint::ClockIn, ActionEndpoint::ClockOut]);
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].endpoint, ActionEndpoint::ClockIn);
        assert_eq!(pending[0].retries, 1);
        assert!(pending[0].next_attempt_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_and_discard_failed() {
        let sender = Arc::new(RecordingSender::failing(&[ActionEndpoint::DeleteTimeLog]));
        let queue =
            OfflineActionQueue::open(Arc::new(MemoryStorage::new()), sender.clone(), options(0)).unwrap();
        queue.set_online(false);
        let a = queue.enqueue(ActionEndpoint::DeleteTimeLog, Map::new()).unwrap();
        let b = queue.enqueue(ActionEndpoint::DeleteTimeLog, Map::new()).unwrap();
        queue.set_online(true);
        queue.sync().await.unwrap();
        assert_eq!(queue.failed().len(), 2);

        assert!(queue.discard_failed(&a.id).unwrap());
        assert!(!queue.discard_failed(&a.id).unwrap());

        queue.set_online(false);
        assert_eq!(queue.retry_failed(Some(&b.id)).unwrap(), 1);
        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);
        assert_eq!(pending[0].retries, 0);
        assert!(queue.failed().is_empty());
        assert_eq!(queue.clear_failed().unwrap(), 0);
    }

    /// Accepts the first `allowed` writes, then fails every later one.
    struct FlakyStorage {
        inner: MemoryStorage,
        allowed: Mutex<usize>,
    }

    impl Storage for FlakyStorage {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            let mut allowed = self.allowed.lock().unwrap();
            if *allowed == 0 {
                anyhow::bail!("disk full");
            }
            *allowed -= 1;
            self.inner.set(key, value)
        }

        fn clear(&self, key: &str) -> Result<()> {
            self.inner.clear(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_survives_persist_failure() {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            allowed: Mutex::new(1),
        });
        let sender = Arc::new(RecordingSender::failing(&[ActionEndpoint::ClockIn]));
        let queue = OfflineActionQueue::open(storage, sender.clone(), options(3)).unwrap();
        queue.set_online(false);
        queue.enqueue(ActionEndpoint::ClockIn, Map::new()).unwrap();
        queue.set_online(true);

        assert!(queue.sync().await.is_err());
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(queue.pending()[0].retries, 1);

        // The retry still fires once its deadline passes.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let storage = Arc::new(MemoryStorage::new());
        let sender = Arc::new(RecordingSender::default());
        {
            let queue = OfflineActionQueue::open(storage.clone(), sender.clone(), options(3)).unwrap();
            queue.set_online(false);
            queue.enqueue(ActionEndpoint::EndBreak, Map::new()).unwrap();
        }

        let queue = OfflineActionQueue::open(storage.clone(), sender.clone(), options(3)).unwrap();
        assert_eq!(queue.pending().len(), 1);
        assert_eq!(queue.pending()[0].endpoint, ActionEndpoint::EndBreak);
    }

    #[tokio::test]
    async fn corrupt_state_is_set_aside() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(STORAGE_KEY, "{not json").unwrap();

        let queue =
            OfflineActionQueue::open(storage.clone(), Arc::new(RecordingSender::default()), options(3)).unwrap();
        assert_eq!(queue.status().pending, 0);
        assert_eq!(
            storage.get("pulse.offline-queue.corrupt").unwrap().as_deref(),
            Some("{not json")
        );
        assert_eq!(storage.get(STORAGE_KEY).unwrap(), None);
    }
}
