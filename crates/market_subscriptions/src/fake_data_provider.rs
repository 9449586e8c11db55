use crate::{DataCallback, DataProvider, SubscriptionKey};
use anyhow::{Result, anyhow};
use futures::FutureExt as _;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    connects: Vec<SubscriptionKey>,
    disconnects: Vec<SubscriptionKey>,
    callbacks: BTreeMap<SubscriptionKey, DataCallback>,
    open: BTreeSet<SubscriptionKey>,
    fail_next_connect: Option<String>,
    hold_connections: bool,
    held: BTreeMap<SubscriptionKey, Vec<oneshot::Sender<Result<(), String>>>>,
}

/// A scriptable [`DataProvider`] that records every call it receives.
///
/// With [`FakeDataProvider::set_hold_connections`] enabled, connects stay in
/// flight until [`FakeDataProvider::release`] or
/// [`FakeDataProvider::fail_held`] resolves them.
#[derive(Clone, Default)]
pub struct FakeDataProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        self.state.lock().fail_next_connect = Some(reason.into());
    }

    pub fn set_hold_connections(&self, hold: bool) {
        self.state.lock().hold_connections = hold;
    }

    /// Resolve every held connect for `key` successfully.
    pub fn release(&self, key: &SubscriptionKey) -> usize {
        self.resolve_held(key, Ok(()))
    }

    pub fn fail_held(&self, key: &SubscriptionKey, reason: impl Into<String>) -> usize {
        self.resolve_held(key, Err(reason.into()))
    }

    fn resolve_held(&self, key: &SubscriptionKey, outcome: Result<(), String>) -> usize {
        let senders = self.state.lock().held.remove(key).unwrap_or_default();
        let count = senders.len();
        for sender in senders {
            sender.send(outcome.clone()).ok();
        }
        count
    }

    /// Deliver `payload` through the callback registered for `key`.
    pub fn push(&self, key: &SubscriptionKey, payload: Value) -> bool {
        let callback = self.state.lock().callbacks.get(key).cloned();
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }

    pub fn connect_count(&self, key: &SubscriptionKey) -> usize {
        let state = self.state.lock();
        state.connects.iter().filter(|connected| *connected == key).count()
    }

    pub fn disconnect_count(&self, key: &SubscriptionKey) -> usize {
        let state = self.state.lock();
        state.disconnects.iter().filter(|disconnected| *disconnected == key).count()
    }

    pub fn total_connects(&self) -> usize {
        self.state.lock().connects.len()
    }

    pub fn is_open(&self, key: &SubscriptionKey) -> bool {
        self.state.lock().open.contains(key)
    }

    pub fn has_callback(&self, key: &SubscriptionKey) -> bool {
        self.state.lock().callbacks.contains_key(key)
    }

    fn finish_connect(state: &Mutex<FakeState>, key: &SubscriptionKey, outcome: Result<(), String>) -> Result<()> {
        let mut state = state.lock();
        match outcome {
            Ok(()) => {
                state.open.insert(key.clone());
                Ok(())
            }
            Err(reason) => {
                state.callbacks.remove(key);
                Err(anyhow!(reason))
            }
        }
    }
}

impl DataProvider for FakeDataProvider {
    fn connect(&self, key: &SubscriptionKey) -> BoxFuture<'static, Result<()>> {
        let mut state = self.state.lock();
        state.connects.push(key.clone());

        if let Some(reason) = state.fail_next_connect.take() {
            drop(state);
            return futures::future::ready(Self::finish_connect(&self.state, key, Err(reason))).boxed();
        }

        if !state.hold_connections {
            drop(state);
            return futures::future::ready(Self::finish_connect(&self.state, key, Ok(()))).boxed();
        }

        let (sender, receiver) = oneshot::channel();
        state.held.entry(key.clone()).or_default().push(sender);
        drop(state);

        let fake = self.state.clone();
        let key = key.clone();
        async move {
            let outcome = receiver
                .await
                .unwrap_or_else(|_| Err("connection dropped".to_string()));
            Self::finish_connect(&fake, &key, outcome)
        }
        .boxed()
    }

    fn disconnect(&self, key: &SubscriptionKey) {
        let mut state = self.state.lock();
        state.disconnects.push(key.clone());
        state.open.remove(key);
        state.callbacks.remove(key);
    }

    fn on_data(&self, key: &SubscriptionKey, callback: DataCallback) {
        self.state.lock().callbacks.insert(key.clone(), callback);
    }
}
