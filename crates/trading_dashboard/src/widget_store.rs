use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use market_subscriptions::{DataType, Market, SubscriptionKey, Timeframe};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::SystemTime;
use widget_geometry::{Bounds, Point, Size, WidgetBounds, WidgetId, bounds};

/// What a widget shows, and therefore which market data it needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetKind {
    Chart {
        exchange: String,
        symbol: String,
        timeframe: Timeframe,
        #[serde(default)]
        market: Market,
    },
    OrderBook {
        exchange: String,
        symbol: String,
        #[serde(default)]
        market: Market,
    },
    TradeFeed {
        exchange: String,
        symbol: String,
        #[serde(default)]
        market: Market,
    },
    Portfolio,
}

impl WidgetKind {
    pub fn chart(exchange: &str, symbol: &str, timeframe: Timeframe, market: Market) -> Self {
        WidgetKind::Chart {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            timeframe,
            market,
        }
    }

    pub fn order_book(exchange: &str, symbol: &str, market: Market) -> Self {
        WidgetKind::OrderBook {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            market,
        }
    }

    pub fn trade_feed(exchange: &str, symbol: &str, market: Market) -> Self {
        WidgetKind::TradeFeed {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            market,
        }
    }

    pub fn subscription_keys(&self) -> Result<Vec<SubscriptionKey>> {
        let key = match self {
            WidgetKind::Chart {
                exchange,
                symbol,
                timeframe,
                market,
            } => SubscriptionKey::new(exchange, symbol, DataType::Candles)?
                .with_timeframe(*timeframe)
                .with_market(*market),
            WidgetKind::OrderBook {
                exchange,
                symbol,
                market,
            } => SubscriptionKey::new(exchange, symbol, DataType::OrderBook)?.with_market(*market),
            WidgetKind::TradeFeed {
                exchange,
                symbol,
                market,
            } => SubscriptionKey::new(exchange, symbol, DataType::Trades)?.with_market(*market),
            WidgetKind::Portfolio => return Ok(Vec::new()),
        };
        Ok(vec![key])
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WidgetGeometry {
    pub id: WidgetId,
    pub position: Point,
    pub size: Size,
    pub z_index: u32,
}

impl WidgetGeometry {
    pub fn bounds(&self) -> Bounds {
        bounds(self.position, self.size)
    }
}

/// Market data as seen by one widget for one subscription key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedState {
    pub is_loading: bool,
    pub error: Option<String>,
    pub last_value: Option<Value>,
    pub last_update: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WidgetRecord {
    pub geometry: WidgetGeometry,
    pub kind: WidgetKind,
    pub feeds: BTreeMap<SubscriptionKey, FeedState>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    WidgetAdded(WidgetId),
    WidgetRemoved(WidgetId),
    PositionChanged { id: WidgetId, position: Point },
    SizeChanged { id: WidgetId, size: Size },
    ZOrderChanged { id: WidgetId, z_index: u32 },
    KindChanged(WidgetId),
    FeedChanged { id: WidgetId, key: SubscriptionKey },
}

/// Owns every widget on one dashboard, in insertion order.
///
/// Mutations queue a [`StoreEvent`]. Whoever owns the store drains them with
/// [`WidgetStore::take_events`] once it is safe to notify observers.
#[derive(Debug)]
pub struct WidgetStore {
    container: Bounds,
    widgets: IndexMap<WidgetId, WidgetRecord>,
    next_widget_id: u64,
    next_z_index: u32,
    pending_events: Vec<StoreEvent>,
}

impl WidgetStore {
    pub fn new(container: Bounds) -> Self {
        Self {
            container,
            widgets: IndexMap::new(),
            next_widget_id: 1,
            next_z_index: 1,
            pending_events: Vec::new(),
        }
    }

    pub fn container_bounds(&self) -> Bounds {
        self.container
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    /// Insert a widget above every existing one.
    pub fn add_widget(&mut self, kind: WidgetKind, bounds: Bounds) -> WidgetId {
        let id = WidgetId(self.next_widget_id);
        self.next_widget_id += 1;
        let z_index = self.next_z_index;
        self.next_z_index += 1;

        self.widgets.insert(
            id,
            WidgetRecord {
                geometry: WidgetGeometry {
                    id,
                    position: bounds.origin,
                    size: bounds.size,
                    z_index,
                },
                kind,
                feeds: BTreeMap::new(),
            },
        );
        self.pending_events.push(StoreEvent::WidgetAdded(id));
        id
    }

    pub fn remove_widget(&mut self, id: WidgetId) -> Result<WidgetRecord> {
        let record = self
            .widgets
            .shift_remove(&id)
            .ok_or_else(|| anyhow!("Widget {id} not found"))?;
        self.pending_events.push(StoreEvent::WidgetRemoved(id));
        Ok(record)
    }

    pub fn widget(&self, id: WidgetId) -> Option<&WidgetRecord> {
        self.widgets.get(&id)
    }

    pub fn widgets(&self) -> impl Iterator<Item = &WidgetRecord> {
        self.widgets.values()
    }

    pub fn widget_ids(&self) -> Vec<WidgetId> {
        self.widgets.keys().copied().collect()
    }

    pub fn bounds(&self, id: WidgetId) -> Result<Bounds> {
        Ok(self.record(id)?.geometry.bounds())
    }

    pub fn set_position(&mut self, id: WidgetId, position: Point) -> Result<()> {
        self.record_mut(id)?.geometry.position = position;
        self.pending_events
            .push(StoreEvent::PositionChanged { id, position });
        Ok(())
    }

    pub fn set_size(&mut self, id: WidgetId, size: Size) -> Result<()> {
        if size.is_empty() {
            return Err(anyhow!(
                "Widget size must be positive, got {}x{}",
                size.width,
                size.height
            ));
        }
        self.record_mut(id)?.geometry.size = size;
        self.pending_events.push(StoreEvent::SizeChanged { id, size });
        Ok(())
    }

    /// Raise `id` above every other widget. Does nothing if it is already on top.
    pub fn bring_to_front(&mut self, id: WidgetId) -> Result<()> {
        let top = self.next_z_index;
        let record = self.record_mut(id)?;
        if record.geometry.z_index + 1 == top {
            return Ok(());
        }
        record.geometry.z_index = top;
        self.next_z_index += 1;
        self.pending_events
            .push(StoreEvent::ZOrderChanged { id, z_index: top });
        Ok(())
    }

    pub fn set_kind(&mut self, id: WidgetId, kind: WidgetKind) -> Result<()> {
        self.record_mut(id)?.kind = kind;
        self.pending_events.push(StoreEvent::KindChanged(id));
        Ok(())
    }

    /// Bounds of every widget except `id`, in insertion order.
    pub fn sibling_snapshot(&self, id: WidgetId) -> Vec<WidgetBounds> {
        self.widgets
            .values()
            .filter(|record| record.geometry.id != id)
            .map(|record| WidgetBounds {
                id: record.geometry.id,
                bounds: record.geometry.bounds(),
            })
            .collect()
    }

    pub fn feed(&self, id: WidgetId, key: &SubscriptionKey) -> Option<&FeedState> {
        self.widgets.get(&id)?.feeds.get(key)
    }

    /// Apply `update` to the feed state of `id` for `key`, creating it if needed.
    pub fn update_feed(
        &mut self,
        id: WidgetId,
        key: &SubscriptionKey,
        update: impl FnOnce(&mut FeedState),
    ) -> Result<()> {
        let record = self.record_mut(id)?;
        update(record.feeds.entry(key.clone()).or_default());
        self.pending_events.push(StoreEvent::FeedChanged {
            id,
            key: key.clone(),
        });
        Ok(())
    }

    pub fn remove_feed(&mut self, id: WidgetId, key: &SubscriptionKey) -> Result<()> {
        if self.record_mut(id)?.feeds.remove(key).is_some() {
            self.pending_events.push(StoreEvent::FeedChanged {
                id,
                key: key.clone(),
            });
        }
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn record(&self, id: WidgetId) -> Result<&WidgetRecord> {
        self.widgets
            .get(&id)
            .ok_or_else(|| anyhow!("Widget {id} not found"))
    }

    fn record_mut(&mut self, id: WidgetId) -> Result<&mut WidgetRecord> {
        self.widgets
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Widget {id} not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use widget_geometry::{point, size};

    fn store() -> WidgetStore {
        WidgetStore::new(Bounds::new(0.0, 0.0, 1920.0, 1080.0))
    }

    #[test]
    fn test_add_and_remove_widgets() {
        let mut store = store();
        let chart = store.add_widget(
            WidgetKind::chart("binance", "BTCUSDT", Timeframe::OneHour, Market::Spot),
            Bounds::new(0.0, 0.0, 400.0, 300.0),
        );
        let portfolio = store.add_widget(WidgetKind::Portfolio, Bounds::new(500.0, 0.0, 300.0, 300.0));

        assert_eq!(store.widget_ids(), vec![chart, portfolio]);
        assert!(
            store.widget(portfolio).unwrap().geometry.z_index
                > store.widget(chart).unwrap().geometry.z_index
        );

        let removed = store.remove_widget(chart).unwrap();
        assert_eq!(removed.geometry.id, chart);
        assert!(store.remove_widget(chart).is_err());
        assert_eq!(
            store.take_events(),
            vec![
                StoreEvent::WidgetAdded(chart),
                StoreEvent::WidgetAdded(portfolio),
                StoreEvent::WidgetRemoved(chart),
            ]
        );
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn test_each_mutation_queues_one_event() {
        let mut store = store();
        let id = store.add_widget(WidgetKind::Portfolio, Bounds::new(0.0, 0.0, 300.0, 200.0));
        store.take_events();

        store.set_position(id, point(10.0, 20.0)).unwrap();
        store.set_size(id, size(320.0, 240.0)).unwrap();
        assert_eq!(store.bounds(id).unwrap(), Bounds::new(10.0, 20.0, 320.0, 240.0));
        assert_eq!(
            store.take_events(),
            vec![
                StoreEvent::PositionChanged {
                    id,
                    position: point(10.0, 20.0)
                },
                StoreEvent::SizeChanged {
                    id,
                    size: size(320.0, 240.0)
                },
            ]
        );

        assert!(store.set_size(id, size(0.0, 10.0)).is_err());
        assert!(store.set_position(WidgetId(99), point(0.0, 0.0)).is_err());
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn test_bring_to_front() {
        let mut store = store();
        let back = store.add_widget(WidgetKind::Portfolio, Bounds::new(0.0, 0.0, 300.0, 200.0));
        let front = store.add_widget(WidgetKind::Portfolio, Bounds::new(10.0, 10.0, 300.0, 200.0));
        store.take_events();

        store.bring_to_front(front).unwrap();
        assert!(store.take_events().is_empty());

        store.bring_to_front(back).unwrap();
        let back_z = store.widget(back).unwrap().geometry.z_index;
        assert!(back_z > store.widget(front).unwrap().geometry.z_index);
        assert_eq!(
            store.take_events(),
            vec![StoreEvent::ZOrderChanged {
                id: back,
                z_index: back_z
            }]
        );
    }

    #[test]
    fn test_sibling_snapshot_excludes_widget() {
        let mut store = store();
        let first = store.add_widget(WidgetKind::Portfolio, Bounds::new(0.0, 0.0, 300.0, 200.0));
        let second = store.add_widget(WidgetKind::Portfolio, Bounds::new(400.0, 0.0, 300.0, 200.0));
        let third = store.add_widget(WidgetKind::Portfolio, Bounds::new(800.0, 0.0, 300.0, 200.0));

        let siblings = store.sibling_snapshot(second);
        assert_eq!(
            siblings.iter().map(|sibling| sibling.id).collect::<Vec<_>>(),
            vec![first, third]
        );
        assert_eq!(siblings[1].bounds, Bounds::new(800.0, 0.0, 300.0, 200.0));
    }

    #[test]
    fn test_feed_state() {
        let mut store = store();
        let kind = WidgetKind::trade_feed("binance", "ETHUSDT", Market::Futures);
        let key = kind.subscription_keys().unwrap().remove(0);
        let id = store.add_widget(kind, Bounds::new(0.0, 0.0, 300.0, 200.0));

        store
            .update_feed(id, &key, |feed| feed.is_loading = true)
            .unwrap();
        assert!(store.feed(id, &key).unwrap().is_loading);

        store
            .update_feed(id, &key, |feed| {
                feed.is_loading = false;
                feed.error = Some("Subscription failed: offline".into());
            })
            .unwrap();
        assert_eq!(
            store.feed(id, &key).unwrap().error.as_deref(),
            Some("Subscription failed: offline")
        );

        store.remove_feed(id, &key).unwrap();
        assert_eq!(store.feed(id, &key), None);
    }

    #[test]
    fn test_subscription_keys_follow_kind() {
        let chart = WidgetKind::chart("Binance", "btcusdt", Timeframe::FourHours, Market::Spot);
        assert_eq!(
            chart.subscription_keys().unwrap()[0].canonical(),
            "binance:BTCUSDT:candles:4h:spot"
        );
        let book = WidgetKind::order_book("kraken", "XBTUSD", Market::Spot);
        assert_eq!(
            book.subscription_keys().unwrap()[0].canonical(),
            "kraken:XBTUSD:orderbook:-:spot"
        );
        assert!(WidgetKind::Portfolio.subscription_keys().unwrap().is_empty());
        assert!(
            WidgetKind::trade_feed("", "BTCUSDT", Market::Spot)
                .subscription_keys()
                .is_err()
        );
    }

    #[test]
    fn test_kind_serialization() {
        let kind = WidgetKind::chart("binance", "BTCUSDT", Timeframe::OneHour, Market::Futures);
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "chart",
                "exchange": "binance",
                "symbol": "BTCUSDT",
                "timeframe": "1h",
                "market": "futures",
            })
        );
        assert_eq!(serde_json::from_value::<WidgetKind>(json).unwrap(), kind);
    }
}
