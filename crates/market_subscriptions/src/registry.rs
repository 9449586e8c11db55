use crate::{DataCallback, DataProvider, SubscriberId, SubscriptionKey};
use emitter::{EventEmitter, EventSubscription};
use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::task::{ArcWake, waker_ref};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Context;
use std::time::SystemTime;
use thiserror::Error;

type ConnectTask = Shared<BoxFuture<'static, Result<(), Arc<anyhow::Error>>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Error(String),
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SubscriptionStatus::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("failed to connect {key}: {reason}")]
    ConnectFailed { key: SubscriptionKey, reason: String },
    #[error("unsubscribed from {key} before the connection opened")]
    Unsubscribed { key: SubscriptionKey },
}

impl SubscriptionError {
    pub fn key(&self) -> &SubscriptionKey {
        match self {
            SubscriptionError::ConnectFailed { key, .. } | SubscriptionError::Unsubscribed { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RegistryEvent {
    StatusChanged {
        key: SubscriptionKey,
        status: SubscriptionStatus,
    },
    Updated {
        key: SubscriptionKey,
        subscribers: Vec<SubscriberId>,
        payload: Value,
    },
    Closed {
        key: SubscriptionKey,
    },
}

/// A point-in-time copy of one subscription record.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionSnapshot {
    pub key: SubscriptionKey,
    pub generation: u64,
    pub subscribers: Vec<SubscriberId>,
    pub status: SubscriptionStatus,
    pub last_value: Option<Value>,
    pub last_update: Option<SystemTime>,
}

struct Attempt {
    id: u64,
    task: ConnectTask,
}

struct SubscriptionRecord {
    generation: u64,
    subscribers: BTreeSet<SubscriberId>,
    status: SubscriptionStatus,
    connected: bool,
    attempt: Option<Attempt>,
    last_value: Option<Value>,
    last_update: Option<SystemTime>,
}

impl SubscriptionRecord {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            subscribers: BTreeSet::new(),
            status: SubscriptionStatus::Pending,
            connected: false,
            attempt: None,
            last_value: None,
            last_update: None,
        }
    }

    fn attempt_id(&self) -> Option<u64> {
        self.attempt.as_ref().map(|attempt| attempt.id)
    }

    fn snapshot(&self, key: &SubscriptionKey) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            key: key.clone(),
            generation: self.generation,
            subscribers: self.subscribers.iter().cloned().collect(),
            status: self.status.clone(),
            last_value: self.last_value.clone(),
            last_update: self.last_update,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    records: BTreeMap<SubscriptionKey, SubscriptionRecord>,
    /// Records whose subscribers all left while a connect was in flight.
    orphans: BTreeMap<SubscriptionKey, SubscriptionRecord>,
    next_id: u64,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    provider: Arc<dyn DataProvider>,
    events: EventEmitter<RegistryEvent>,
}

/// A connect that has been reserved in a record but not yet handed to the
/// provider. Started once the state lock is released.
struct PendingConnect {
    key: SubscriptionKey,
    task: ConnectTask,
    sender: oneshot::Sender<BoxFuture<'static, anyhow::Result<()>>>,
}

/// Polls a connect attempt each time it is woken, so the attempt settles
/// even after every subscriber has dropped its future.
///
/// Polling happens on whichever thread wakes the attempt. A wake that lands
/// while a poll is running is picked up by that poll's loop.
struct AttemptDriver {
    task: Mutex<Option<ConnectTask>>,
    woken: AtomicBool,
}

impl AttemptDriver {
    fn spawn(task: ConnectTask) {
        let driver = Arc::new(Self {
            task: Mutex::new(Some(task)),
            woken: AtomicBool::new(false),
        });
        driver.drive();
    }

    fn drive(self: &Arc<Self>) {
        self.woken.store(true, Ordering::SeqCst);
        while self.woken.load(Ordering::SeqCst) {
            let Some(mut slot) = self.task.try_lock() else {
                return;
            };
            self.woken.store(false, Ordering::SeqCst);
            if let Some(task) = slot.as_mut() {
                let waker = waker_ref(self);
                let mut cx = Context::from_waker(&waker);
                if task.poll_unpin(&mut cx).is_ready() {
                    *slot = None;
                }
            }
        }
    }
}

impl ArcWake for AttemptDriver {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.drive();
    }
}

/// Shares one upstream connection per [`SubscriptionKey`] between any number
/// of subscribers.
///
/// Every operation is a single short critical section. The provider and
/// observers are only called after the lock is released, so either may call
/// back into the registry.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                provider,
                events: EventEmitter::new(),
            }),
        }
    }

    /// Count `subscriber` against `key`, opening the upstream connection if
    /// this is the first subscriber.
    ///
    /// The subscriber is registered before this returns. The future only
    /// reports how the connection attempt it joined turned out.
    pub fn subscribe(
        &self,
        subscriber: SubscriberId,
        key: SubscriptionKey,
    ) -> BoxFuture<'static, Result<(), SubscriptionError>> {
        let mut events = Vec::new();
        let (task, pending_connect) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let record = match state.records.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match state.orphans.remove(&key) {
                    Some(orphan) => {
                        log::info!("reviving in-flight subscription {key}");
                        events.push(RegistryEvent::StatusChanged {
                            key: key.clone(),
                            status: orphan.status.clone(),
                        });
                        entry.insert(orphan)
                    }
                    None => {
                        state.next_id += 1;
                        log::info!("opening subscription {key}");
                        entry.insert(SubscriptionRecord::new(state.next_id))
                    }
                },
            };

            if record.subscribers.insert(subscriber.clone()) {
                log::debug!(
                    "{subscriber} subscribed to {key} ({} subscribers)",
                    record.subscribers.len()
                );
            }

            self.join_or_connect(&key, record, &mut state.next_id, &mut events)
        };

        self.emit_all(events);
        if let Some(pending) = pending_connect {
            self.start_connect(pending);
        }

        match task {
            None => futures::future::ready(Ok(())).boxed(),
            Some(task) => {
                let this = self.clone();
                async move {
                    let result = task.await;
                    this.attempt_outcome(&subscriber, key, result)
                }
                .boxed()
            }
        }
    }

    /// Stop counting `subscriber` against `key`. Does nothing if it was not
    /// counted.
    pub fn unsubscribe(&self, subscriber: &SubscriberId, key: &SubscriptionKey) {
        let mut disconnect = false;
        {
            let mut state = self.inner.state.lock();
            let Some(record) = state.records.get_mut(key) else {
                return;
            };
            if !record.subscribers.remove(subscriber) {
                return;
            }
            log::debug!(
                "{subscriber} unsubscribed from {key} ({} subscribers)",
                record.subscribers.len()
            );
            if !record.subscribers.is_empty() {
                return;
            }

            if let Some(record) = state.records.remove(key) {
                if record.attempt.is_some() {
                    log::info!("closing {key} while its connection is in flight");
                    state.orphans.insert(key.clone(), record);
                } else {
                    log::info!("closing subscription {key}");
                    disconnect = record.connected;
                }
            }
        }

        if disconnect {
            self.inner.provider.disconnect(key);
        }
        self.emit_all(vec![RegistryEvent::Closed { key: key.clone() }]);
    }

    /// Move `subscriber` from `old` to `new`, releasing `old` first so the
    /// two keys never both hold a connection on its behalf.
    pub fn resubscribe(
        &self,
        subscriber: SubscriberId,
        old: &SubscriptionKey,
        new: SubscriptionKey,
    ) -> BoxFuture<'static, Result<(), SubscriptionError>> {
        if *old == new {
            return futures::future::ready(Ok(())).boxed();
        }
        self.unsubscribe(&subscriber, old);
        self.subscribe(subscriber, new)
    }

    /// Start a fresh connect for a record in the error state. Joins the
    /// in-flight attempt for a pending record. Returns `None` for unknown keys.
    pub fn retry(&self, key: &SubscriptionKey) -> Option<BoxFuture<'static, Result<(), SubscriptionError>>> {
        let mut events = Vec::new();
        let (task, pending_connect) = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let record = state.records.get_mut(key)?;
            if record.status.error().is_some() {
                log::info!("retrying subscription {key}");
            }
            self.join_or_connect(key, record, &mut state.next_id, &mut events)
        };

        self.emit_all(events);
        if let Some(pending) = pending_connect {
            self.start_connect(pending);
        }

        let key = key.clone();
        Some(match task {
            None => futures::future::ready(Ok(())).boxed(),
            Some(task) => async move {
                task.await.map_err(|error| SubscriptionError::ConnectFailed {
                    key,
                    reason: error.to_string(),
                })
            }
            .boxed(),
        })
    }

    /// Releases every key `subscriber` holds. Returns how many there were.
    pub fn unsubscribe_all(&self, subscriber: &SubscriberId) -> usize {
        let keys = self.keys_for(subscriber);
        for key in &keys {
            self.unsubscribe(subscriber, key);
        }
        keys.len()
    }

    /// Record a payload pushed by the provider and fan it out to observers.
    pub fn handle_update(&self, key: &SubscriptionKey, payload: Value) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(record) = state.records.get_mut(key) else {
                log::debug!("dropping update for unsubscribed key {key}");
                return;
            };
            record.last_value = Some(payload.clone());
            record.last_update = Some(SystemTime::now());
            if record.status == SubscriptionStatus::Pending {
                record.status = SubscriptionStatus::Active;
                events.push(RegistryEvent::StatusChanged {
                    key: key.clone(),
                    status: SubscriptionStatus::Active,
                });
            }
            events.push(RegistryEvent::Updated {
                key: key.clone(),
                subscribers: record.subscribers.iter().cloned().collect(),
                payload,
            });
        }
        self.emit_all(events);
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .state
            .lock()
            .records
            .get(key)
            .map_or(0, |record| record.subscribers.len())
    }

    pub fn status(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        let state = self.inner.state.lock();
        state.records.get(key).map(|record| record.status.clone())
    }

    pub fn cached_value(&self, key: &SubscriptionKey) -> Option<Value> {
        let state = self.inner.state.lock();
        state.records.get(key)?.last_value.clone()
    }

    pub fn record(&self, key: &SubscriptionKey) -> Option<SubscriptionSnapshot> {
        let state = self.inner.state.lock();
        state.records.get(key).map(|record| record.snapshot(key))
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.inner.state.lock().records.keys().cloned().collect()
    }

    pub fn keys_for(&self, subscriber: &SubscriberId) -> Vec<SubscriptionKey> {
        let state = self.inner.state.lock();
        state
            .records
            .iter()
            .filter(|(_, record)| record.subscribers.contains(subscriber))
            .map(|(key, _)| key.clone())
            .collect()
    }

    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn observe(
        &self,
        callback: impl Fn(&RegistryEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.inner.events.observe(callback)
    }

    /// Returns the attempt a caller should wait on, or `None` when the record
    /// is active with no attempt in flight. Reserves a new attempt when none
    /// is in flight.
    fn join_or_connect(
        &self,
        key: &SubscriptionKey,
        record: &mut SubscriptionRecord,
        next_id: &mut u64,
        events: &mut Vec<RegistryEvent>,
    ) -> (Option<ConnectTask>, Option<PendingConnect>) {
        match record.attempt.as_ref().map(|attempt| attempt.task.clone()) {
            Some(task) => (Some(task), None),
            None if record.status.is_active() => (None, None),
            None => {
                *next_id += 1;
                let (task, pending) = self.begin_attempt(key, record, *next_id);
                events.push(RegistryEvent::StatusChanged {
                    key: key.clone(),
                    status: SubscriptionStatus::Pending,
                });
                (Some(task), Some(pending))
            }
        }
    }

    fn begin_attempt(
        &self,
        key: &SubscriptionKey,
        record: &mut SubscriptionRecord,
        attempt_id: u64,
    ) -> (ConnectTask, PendingConnect) {
        let (sender, receiver) = oneshot::channel::<BoxFuture<'static, anyhow::Result<()>>>();
        let registry = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let task = async move {
            let result = match receiver.await {
                Ok(connect) => connect.await,
                Err(_) => Err(anyhow::anyhow!("connection attempt was abandoned")),
            }
            .map_err(Arc::new);
            if let Some(inner) = registry.upgrade() {
                SubscriptionRegistry { inner }.finish_attempt(&task_key, attempt_id, &result);
            }
            result
        }
        .boxed()
        .shared();

        record.status = SubscriptionStatus::Pending;
        record.attempt = Some(Attempt {
            id: attempt_id,
            task: task.clone(),
        });
        let pending = PendingConnect {
            key: key.clone(),
            task: task.clone(),
            sender,
        };
        (task, pending)
    }

    fn start_connect(&self, pending: PendingConnect) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let key = pending.key.clone();
        let callback: DataCallback = Arc::new(move |payload| {
            if let Some(inner) = registry.upgrade() {
                SubscriptionRegistry { inner }.handle_update(&key, payload);
            }
        });

        self.inner.provider.on_data(&pending.key, callback);
        let connect = self.inner.provider.connect(&pending.key);
        pending.sender.send(connect).ok();
        AttemptDriver::spawn(pending.task);
    }

    fn finish_attempt(
        &self,
        key: &SubscriptionKey,
        attempt_id: u64,
        result: &Result<(), Arc<anyhow::Error>>,
    ) {
        let mut events = Vec::new();
        let mut close_orphan = false;
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            if let Some(record) = state
                .records
                .get_mut(key)
                .filter(|record| record.attempt_id() == Some(attempt_id))
            {
                record.attempt = None;
                match result {
                    Ok(()) => {
                        log::info!("connected {key}");
                        record.connected = true;
                        if record.status != SubscriptionStatus::Active {
                            record.status = SubscriptionStatus::Active;
                            events.push(RegistryEvent::StatusChanged {
                                key: key.clone(),
                                status: SubscriptionStatus::Active,
                            });
                        }
                    }
                    Err(error) => {
                        log::warn!("failed to connect {key}: {error}");
                        record.connected = false;
                        record.status = SubscriptionStatus::Error(error.to_string());
                        events.push(RegistryEvent::StatusChanged {
                            key: key.clone(),
                            status: record.status.clone(),
                        });
                    }
                }
            } else if state
                .orphans
                .get(key)
                .is_some_and(|orphan| orphan.attempt_id() == Some(attempt_id))
            {
                state.orphans.remove(key);
                close_orphan = result.is_ok();
            } else {
                log::debug!("ignoring stale connection attempt {attempt_id} for {key}");
            }
        }

        if close_orphan {
            log::warn!("connection for {key} opened after its last subscriber left, closing it");
            self.inner.provider.disconnect(key);
        }
        self.emit_all(events);
    }

    fn attempt_outcome(
        &self,
        subscriber: &SubscriberId,
        key: SubscriptionKey,
        result: Result<(), Arc<anyhow::Error>>,
    ) -> Result<(), SubscriptionError> {
        match result {
            Err(error) => Err(SubscriptionError::ConnectFailed {
                key,
                reason: error.to_string(),
            }),
            Ok(()) => {
                let subscribed = self
                    .inner
                    .state
                    .lock()
                    .records
                    .get(&key)
                    .is_some_and(|record| record.subscribers.contains(subscriber));
                if subscribed {
                    Ok(())
                } else {
                    Err(SubscriptionError::Unsubscribed { key })
                }
            }
        }
    }

    fn emit_all(&self, events: Vec<RegistryEvent>) {
        for event in &events {
            self.inner.events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataType, FakeDataProvider, Timeframe};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn candles(timeframe: Timeframe) -> SubscriptionKey {
        SubscriptionKey::new("binance", "BTCUSDT", DataType::Candles)
            .unwrap()
            .with_timeframe(timeframe)
    }

    fn subscriber(widget_id: u64) -> SubscriberId {
        SubscriberId::new("main", widget_id)
    }

    fn registry() -> (SubscriptionRegistry, FakeDataProvider) {
        let provider = FakeDataProvider::new();
        (SubscriptionRegistry::new(Arc::new(provider.clone())), provider)
    }

    #[tokio::test]
    async fn test_identical_keys_share_one_connection() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);

        let first = registry.subscribe(subscriber(1), key.clone());
        let second = registry.subscribe(subscriber(2), key.clone());
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(provider.connect_count(&key), 1);
        assert_eq!(registry.ref_count(&key), 2);
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));

        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(registry.ref_count(&key), 1);
        assert!(provider.is_open(&key));
        assert_eq!(provider.disconnect_count(&key), 0);

        registry.unsubscribe(&subscriber(2), &key);
        assert_eq!(registry.ref_count(&key), 0);
        assert_eq!(registry.status(&key), None);
        assert_eq!(provider.disconnect_count(&key), 1);
        assert!(!provider.is_open(&key));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);

        registry.subscribe(subscriber(1), key.clone()).await.unwrap();
        registry.subscribe(subscriber(2), key.clone()).await.unwrap();
        registry.subscribe(subscriber(2), key.clone()).await.unwrap();
        assert_eq!(registry.ref_count(&key), 2);

        registry.unsubscribe(&subscriber(1), &key);
        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(registry.ref_count(&key), 1);
        assert_eq!(provider.disconnect_count(&key), 0);

        registry.unsubscribe(&subscriber(3), &candles(Timeframe::OneDay));
        assert_eq!(registry.active_keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_updates_fan_out_in_arrival_order() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::FiveMinutes);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let _observer = {
            let updates = updates.clone();
            registry.observe(move |event| {
                if let RegistryEvent::Updated {
                    subscribers,
                    payload,
                    ..
                } = event
                {
                    updates.lock().push((subscribers.len(), payload["close"].clone()));
                }
            })
        };

        registry.subscribe(subscriber(1), key.clone()).await.unwrap();
        registry.subscribe(subscriber(2), key.clone()).await.unwrap();
        assert!(provider.push(&key, json!({"close": 1.0})));
        assert!(provider.push(&key, json!({"close": 2.0})));

        assert_eq!(
            *updates.lock(),
            vec![(2, json!(1.0)), (2, json!(2.0))]
        );
        assert_eq!(registry.cached_value(&key), Some(json!({"close": 2.0})));
        assert!(registry.record(&key).unwrap().last_update.is_some());
    }

    #[tokio::test]
    async fn test_updates_for_unknown_keys_are_dropped() {
        let (registry, _provider) = registry();
        let key = candles(Timeframe::OneHour);
        let events = Arc::new(Mutex::new(0));
        let _observer = {
            let events = events.clone();
            registry.observe(move |_| *events.lock() += 1)
        };

        registry.handle_update(&key, json!({"close": 1.0}));
        assert_eq!(registry.cached_value(&key), None);
        assert_eq!(*events.lock(), 0);
    }

    #[tokio::test]
    async fn test_failed_connect_keeps_record_for_retry() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);

        provider.fail_next_connect("exchange offline");
        let error = registry.subscribe(subscriber(1), key.clone()).await.unwrap_err();
        assert_eq!(
            error,
            SubscriptionError::ConnectFailed {
                key: key.clone(),
                reason: "exchange offline".into(),
            }
        );
        assert_eq!(
            registry.status(&key),
            Some(SubscriptionStatus::Error("exchange offline".into()))
        );
        assert_eq!(registry.ref_count(&key), 1);
        assert!(!provider.has_callback(&key));

        registry.retry(&key).unwrap().await.unwrap();
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));
        assert_eq!(provider.connect_count(&key), 2);
        assert!(provider.has_callback(&key));
        assert!(registry.retry(&candles(Timeframe::OneDay)).is_none());
    }

    #[tokio::test]
    async fn test_subscribing_to_failed_key_retries() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);

        provider.fail_next_connect("rate limited");
        assert!(registry.subscribe(subscriber(1), key.clone()).await.is_err());

        registry.subscribe(subscriber(2), key.clone()).await.unwrap();
        assert_eq!(provider.connect_count(&key), 2);
        assert_eq!(registry.ref_count(&key), 2);
        assert!(registry.status(&key).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_pending_subscribers_share_attempt() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        provider.set_hold_connections(true);

        let first = registry.subscribe(subscriber(1), key.clone());
        let second = registry.subscribe(subscriber(2), key.clone());
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Pending));
        assert_eq!(provider.connect_count(&key), 1);

        assert_eq!(provider.release(&key), 1);
        let (first, second) = futures::join!(first, second);
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));
    }

    #[tokio::test]
    async fn test_shared_attempt_failure_reaches_every_subscriber() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        provider.set_hold_connections(true);

        let first = registry.subscribe(subscriber(1), key.clone());
        let second = registry.subscribe(subscriber(2), key.clone());
        provider.fail_held(&key, "timeout");

        let (first, second) = futures::join!(first, second);
        assert!(matches!(first, Err(SubscriptionError::ConnectFailed { .. })));
        assert!(matches!(second, Err(SubscriptionError::ConnectFailed { .. })));
        assert_eq!(registry.status(&key).unwrap().error(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_late_connection_after_last_unsubscribe_is_closed() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        provider.set_hold_connections(true);

        let pending = registry.subscribe(subscriber(1), key.clone());
        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(registry.ref_count(&key), 0);
        assert_eq!(registry.status(&key), None);

        provider.release(&key);
        assert_eq!(
            pending.await,
            Err(SubscriptionError::Unsubscribed { key: key.clone() })
        );
        assert_eq!(provider.disconnect_count(&key), 1);
        assert!(!provider.is_open(&key));
        assert!(registry.active_keys().is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_during_flight_revives_attempt() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        provider.set_hold_connections(true);

        let abandoned = registry.subscribe(subscriber(1), key.clone());
        registry.unsubscribe(&subscriber(1), &key);
        let revived = registry.subscribe(subscriber(2), key.clone());
        assert_eq!(provider.connect_count(&key), 1);
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Pending));

        provider.release(&key);
        assert_eq!(revived.await, Ok(()));
        assert!(matches!(
            abandoned.await,
            Err(SubscriptionError::Unsubscribed { .. })
        ));
        assert_eq!(provider.connect_count(&key), 1);
        assert_eq!(provider.disconnect_count(&key), 0);
        assert!(provider.is_open(&key));
        assert_eq!(registry.ref_count(&key), 1);
    }

    #[tokio::test]
    async fn test_first_data_activates_pending_record() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneMinute);
        provider.set_hold_connections(true);

        let pending = registry.subscribe(subscriber(1), key.clone());
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Pending));

        provider.push(&key, json!({"close": 10.5}));
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));
        assert_eq!(registry.cached_value(&key), Some(json!({"close": 10.5})));

        provider.release(&key);
        assert_eq!(pending.await, Ok(()));
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));
    }

    #[tokio::test]
    async fn test_joining_active_record_waits_for_connect() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneMinute);
        provider.set_hold_connections(true);

        let first = registry.subscribe(subscriber(1), key.clone());
        provider.push(&key, json!({"close": 10.5}));
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));

        let second = registry.subscribe(subscriber(2), key.clone());
        assert_eq!(provider.fail_held(&key, "handshake rejected"), 1);

        let (first, second) = futures::join!(first, second);
        assert!(matches!(first, Err(SubscriptionError::ConnectFailed { .. })));
        assert_eq!(
            second,
            Err(SubscriptionError::ConnectFailed {
                key: key.clone(),
                reason: "handshake rejected".into(),
            })
        );
        assert_eq!(registry.status(&key).unwrap().error(), Some("handshake rejected"));
        assert_eq!(provider.connect_count(&key), 1);
    }

    #[tokio::test]
    async fn test_dropped_subscribe_future_still_settles() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);

        drop(registry.subscribe(subscriber(1), key.clone()));
        assert_eq!(registry.status(&key), Some(SubscriptionStatus::Active));
        assert!(provider.is_open(&key));

        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(provider.disconnect_count(&key), 1);
        assert!(!provider.is_open(&key));
    }

    #[tokio::test]
    async fn test_dropped_subscribe_future_closes_late_connection() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        provider.set_hold_connections(true);

        drop(registry.subscribe(subscriber(1), key.clone()));
        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(provider.disconnect_count(&key), 0);

        assert_eq!(provider.release(&key), 1);
        assert_eq!(provider.disconnect_count(&key), 1);
        assert!(!provider.is_open(&key));
        assert!(registry.active_keys().is_empty());

        registry.subscribe(subscriber(2), key.clone()).await.unwrap();
        assert_eq!(provider.connect_count(&key), 2);
        assert!(provider.is_open(&key));
    }

    #[tokio::test]
    async fn test_mock_feed_closes_after_dropped_subscribe() {
        let provider = Arc::new(crate::MockDataProvider::new(7));
        let registry = SubscriptionRegistry::new(provider.clone());
        let key = candles(Timeframe::FiveMinutes);

        drop(registry.subscribe(subscriber(1), key.clone()));
        assert_eq!(provider.connected_keys(), vec![key.clone()]);

        registry.unsubscribe(&subscriber(1), &key);
        assert!(provider.connected_keys().is_empty());
        assert_eq!(provider.tick(), 0);
    }

    #[tokio::test]
    async fn test_timeframe_switch_moves_reference() {
        let (registry, provider) = registry();
        let hourly = candles(Timeframe::OneHour);
        let four_hourly = candles(Timeframe::FourHours);

        registry.subscribe(subscriber(1), hourly.clone()).await.unwrap();
        registry.subscribe(subscriber(2), hourly.clone()).await.unwrap();

        registry
            .resubscribe(subscriber(1), &hourly, four_hourly.clone())
            .await
            .unwrap();
        assert_eq!(registry.ref_count(&hourly), 1);
        assert_eq!(registry.ref_count(&four_hourly), 1);
        assert!(provider.is_open(&hourly));

        registry
            .resubscribe(subscriber(2), &hourly, four_hourly.clone())
            .await
            .unwrap();
        assert_eq!(registry.ref_count(&hourly), 0);
        assert_eq!(registry.ref_count(&four_hourly), 2);
        assert_eq!(provider.disconnect_count(&hourly), 1);
        assert!(!provider.is_open(&hourly));
        assert_eq!(provider.connect_count(&four_hourly), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_to_same_key_is_noop() {
        let (registry, provider) = registry();
        let key = candles(Timeframe::OneHour);
        registry.subscribe(subscriber(1), key.clone()).await.unwrap();

        registry
            .resubscribe(subscriber(1), &key, key.clone())
            .await
            .unwrap();
        assert_eq!(registry.ref_count(&key), 1);
        assert_eq!(provider.connect_count(&key), 1);
        assert_eq!(provider.disconnect_count(&key), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_releases_every_key() {
        let (registry, provider) = registry();
        let trades = SubscriptionKey::new("binance", "ETHUSDT", DataType::Trades).unwrap();
        let hourly = candles(Timeframe::OneHour);

        registry.subscribe(subscriber(1), trades.clone()).await.unwrap();
        registry.subscribe(subscriber(1), hourly.clone()).await.unwrap();
        registry.subscribe(subscriber(2), hourly.clone()).await.unwrap();
        assert_eq!(registry.keys_for(&subscriber(1)).len(), 2);

        assert_eq!(registry.unsubscribe_all(&subscriber(1)), 2);
        assert!(registry.keys_for(&subscriber(1)).is_empty());
        assert_eq!(registry.active_keys(), vec![hourly.clone()]);
        assert_eq!(provider.disconnect_count(&trades), 1);
        assert_eq!(provider.disconnect_count(&hourly), 0);
    }

    #[tokio::test]
    async fn test_observers_may_query_registry() {
        let (registry, _provider) = registry();
        let key = candles(Timeframe::OneHour);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _observer = {
            let registry = registry.clone();
            let seen = seen.clone();
            registry.clone().observe(move |event| {
                if let RegistryEvent::StatusChanged { key, .. } | RegistryEvent::Closed { key } = event {
                    seen.lock().push(registry.ref_count(key));
                }
            })
        };

        registry.subscribe(subscriber(1), key.clone()).await.unwrap();
        registry.unsubscribe(&subscriber(1), &key);
        assert_eq!(*seen.lock(), vec![1, 1, 0]);
    }
}
