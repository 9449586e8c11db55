use crate::{DataType, SubscriptionKey};
use anyhow::Result;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type DataCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Raw market feed connections, one per canonical key.
///
/// `on_data` replaces any callback previously registered for the key. A
/// connect that fails discards the callback, so the caller registers it again
/// before retrying. Payloads are opaque to the registry.
///
/// The registry keeps polling a connect future after its subscribers stop
/// waiting, from whichever thread wakes it. Providers should wake connect
/// futures without holding their own locks.
pub trait DataProvider: Send + Sync {
    fn connect(&self, key: &SubscriptionKey) -> BoxFuture<'static, Result<()>>;
    fn disconnect(&self, key: &SubscriptionKey);
    fn on_data(&self, key: &SubscriptionKey, callback: DataCallback);
}

struct MockFeed {
    callback: Option<DataCallback>,
    connected: bool,
    last_price: f64,
    sequence: u64,
}

struct MockState {
    rng: StdRng,
    feeds: BTreeMap<SubscriptionKey, MockFeed>,
}

/// Synthetic market data for demos. Connections always succeed, and every
/// [`MockDataProvider::tick`] pushes one payload per connected key.
pub struct MockDataProvider {
    state: Mutex<MockState>,
}

impl MockDataProvider {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                rng: StdRng::seed_from_u64(seed),
                feeds: BTreeMap::new(),
            }),
        }
    }

    pub fn connected_keys(&self) -> Vec<SubscriptionKey> {
        self.state
            .lock()
            .feeds
            .iter()
            .filter(|(_, feed)| feed.connected)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Push one update to every connected feed. Returns how many were sent.
    pub fn tick(&self) -> usize {
        let deliveries: Vec<(DataCallback, Value)> = {
            let mut state = self.state.lock();
            let MockState { rng, feeds } = &mut *state;
            feeds
                .iter_mut()
                .filter(|(_, feed)| feed.connected)
                .filter_map(|(key, feed)| {
                    let callback = feed.callback.clone()?;
                    Some((callback, next_payload(key, feed, rng)))
                })
                .collect()
        };

        let sent = deliveries.len();
        for (callback, payload) in deliveries {
            callback(payload);
        }
        log::debug!("mock provider pushed {sent} updates");
        sent
    }

    fn feed<'a>(state: &'a mut MockState, key: &SubscriptionKey) -> &'a mut MockFeed {
        let MockState { rng, feeds } = state;
        feeds.entry(key.clone()).or_insert_with(|| MockFeed {
            callback: None,
            connected: false,
            last_price: rng.random_range(10.0..50_000.0),
            sequence: 0,
        })
    }
}

impl DataProvider for MockDataProvider {
    fn connect(&self, key: &SubscriptionKey) -> BoxFuture<'static, Result<()>> {
        let mut state = self.state.lock();
        Self::feed(&mut state, key).connected = true;
        log::info!("mock provider connected {key}");
        futures::future::ready(Ok(())).boxed()
    }

    fn disconnect(&self, key: &SubscriptionKey) {
        if self.state.lock().feeds.remove(key).is_some() {
            log::info!("mock provider disconnected {key}");
        }
    }

    fn on_data(&self, key: &SubscriptionKey, callback: DataCallback) {
        let mut state = self.state.lock();
        Self::feed(&mut state, key).callback = Some(callback);
    }
}

fn next_payload(key: &SubscriptionKey, feed: &mut MockFeed, rng: &mut StdRng) -> Value {
    let open = feed.last_price;
    let close = (open * (1.0 + rng.random_range(-0.005..0.005))).max(0.01);
    feed.last_price = close;
    feed.sequence += 1;

    match key.data_type() {
        DataType::Candles => {
            let high = open.max(close) * (1.0 + rng.random_range(0.0..0.002));
            let low = open.min(close) * (1.0 - rng.random_range(0.0..0.002));
            json!({
                "type": "candle",
                "symbol": key.symbol(),
                "timeframe": key.timeframe().map(|timeframe| timeframe.to_string()),
                "sequence": feed.sequence,
                "open": open,
                "high": high,
                "low": low,
                "close": close,
                "volume": rng.random_range(1.0..500.0),
            })
        }
        DataType::Trades => json!({
            "type": "trade",
            "symbol": key.symbol(),
            "sequence": feed.sequence,
            "price": close,
            "quantity": rng.random_range(0.001..25.0),
            "side": if rng.random_bool(0.5) { "buy" } else { "sell" },
        }),
        DataType::OrderBook => {
            let tick = close * 0.0001;
            let mut level = |side: f64, depth: usize| {
                let price = close + side * tick * (depth as f64 + 1.0);
                json!([price, rng.random_range(0.01..100.0)])
            };
            let bids: Vec<Value> = (0..5).map(|depth| level(-1.0, depth)).collect();
            let asks: Vec<Value> = (0..5).map(|depth| level(1.0, depth)).collect();
            json!({
                "type": "orderbook",
                "symbol": key.symbol(),
                "sequence": feed.sequence,
                "bids": bids,
                "asks": asks,
            })
        }
    }
}
