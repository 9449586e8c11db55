use crate::{
    DashboardSettings, FeedState, LAYOUT_VERSION, PersistedLayout, PersistedWidget, ResultExt as _,
    StoreEvent, WidgetKind, WidgetRecord, WidgetStore,
};
use anyhow::{Context as _, Result, anyhow};
use emitter::{EventEmitter, EventSubscription};
use futures::FutureExt as _;
use futures::future::{self, BoxFuture};
use market_subscriptions::{
    RegistryEvent, SubscriberId, SubscriptionError, SubscriptionKey, SubscriptionRegistry,
    SubscriptionSnapshot, SubscriptionStatus, Timeframe,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use widget_geometry::{
    Bounds, GestureController, GestureDelegate, GestureFrame, GestureKind, GuideLine, Point,
    PointerSample, ResizeHandle, Size, WidgetBounds, WidgetId, bounds, compute_guides, point,
};

#[derive(Clone, Debug, PartialEq)]
pub enum DashboardEvent {
    Store(StoreEvent),
    /// Guides applied by the latest pointer sample. Empty once a gesture ends.
    GuidesChanged {
        widget_id: WidgetId,
        guides: Vec<GuideLine>,
    },
    GestureEnded {
        widget_id: WidgetId,
        kind: GestureKind,
    },
}

struct DashboardInner {
    store: WidgetStore,
    controllers: HashMap<WidgetId, GestureController>,
    /// Keys each widget currently holds in the registry.
    opened: HashMap<WidgetId, BTreeSet<SubscriptionKey>>,
}

struct DashboardState {
    id: Arc<str>,
    settings: DashboardSettings,
    registry: SubscriptionRegistry,
    inner: Mutex<DashboardInner>,
    events: EventEmitter<DashboardEvent>,
    _registry_observer: EventSubscription,
}

impl Drop for DashboardState {
    fn drop(&mut self) {
        for (widget_id, keys) in self.inner.get_mut().opened.drain() {
            let subscriber = SubscriberId::new(self.id.clone(), widget_id.0);
            for key in &keys {
                self.registry.unsubscribe(&subscriber, key);
            }
        }
    }
}

/// One canvas of widgets backed by a shared [`SubscriptionRegistry`].
///
/// Widgets subscribe as `dashboard_id/widget_id`. Gestures run through a
/// per-widget [`GestureController`] that reads sibling bounds from the store
/// and writes results back to it. Observers are notified after the dashboard
/// lock is released.
#[derive(Clone)]
pub struct Dashboard {
    state: Arc<DashboardState>,
}

impl Dashboard {
    pub fn new(
        dashboard_id: impl Into<Arc<str>>,
        settings: DashboardSettings,
        registry: SubscriptionRegistry,
    ) -> Self {
        let id = dashboard_id.into();
        let state = Arc::new_cyclic(|this: &Weak<DashboardState>| {
            let this = this.clone();
            let registry_observer = registry.observe(move |event| {
                if let Some(state) = this.upgrade() {
                    Dashboard { state }.handle_registry_event(event);
                }
            });
            DashboardState {
                id,
                inner: Mutex::new(DashboardInner {
                    store: WidgetStore::new(settings.container_bounds()),
                    controllers: HashMap::new(),
                    opened: HashMap::new(),
                }),
                settings,
                registry,
                events: EventEmitter::new(),
                _registry_observer: registry_observer,
            }
        });
        Self { state }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn settings(&self) -> &DashboardSettings {
        &self.state.settings
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.state.registry
    }

    pub fn subscriber(&self, widget_id: WidgetId) -> SubscriberId {
        SubscriberId::new(self.state.id.clone(), widget_id.0)
    }

    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn observe(
        &self,
        callback: impl Fn(&DashboardEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.state.events.observe(callback)
    }

    /// Place a widget and subscribe to the market data it needs.
    ///
    /// The widget and its subscriptions exist once this returns. The feed
    /// state follows the registry whether or not the task is polled; the task
    /// only reports the first failed attempt.
    pub fn add_widget(
        &self,
        kind: WidgetKind,
        bounds: Bounds,
    ) -> Result<(WidgetId, BoxFuture<'static, Result<()>>)> {
        let keys = kind.subscription_keys()?;
        let bounds = self.fit_to_container(bounds);

        let (id, events) = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            let id = inner.store.add_widget(kind, bounds);
            inner
                .controllers
                .insert(id, GestureController::new(id, self.state.settings.gesture_config()));
            for key in &keys {
                inner.store.update_feed(id, key, start_loading)?;
            }
            inner.opened.insert(id, keys.iter().cloned().collect());
            (id, inner.store.take_events())
        };
        self.emit_store_events(events);
        log::info!("added widget {id} to dashboard {}", self.state.id);

        Ok((id, self.subscribe_keys(id, keys)))
    }

    /// Remove a widget and release every key it holds, including ones whose
    /// connection is still in flight.
    pub fn remove_widget(&self, id: WidgetId) -> Result<()> {
        let (keys, events) = {
            let mut inner = self.state.inner.lock();
            inner.store.remove_widget(id)?;
            inner.controllers.remove(&id);
            let keys = inner.opened.remove(&id).unwrap_or_default();
            (keys, inner.store.take_events())
        };

        let subscriber = self.subscriber(id);
        for key in &keys {
            self.state.registry.unsubscribe(&subscriber, key);
        }
        self.emit_store_events(events);
        log::info!("removed widget {id} from dashboard {}", self.state.id);
        Ok(())
    }

    /// Switch a chart to `timeframe`. The old key is released before the new
    /// one is subscribed.
    pub fn set_chart_timeframe(
        &self,
        id: WidgetId,
        timeframe: Timeframe,
    ) -> Result<BoxFuture<'static, Result<()>>> {
        let (old_key, new_key, events) = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            let record = inner
                .store
                .widget(id)
                .ok_or_else(|| anyhow!("Widget {id} not found"))?;
            let WidgetKind::Chart {
                exchange,
                symbol,
                timeframe: current,
                market,
            } = &record.kind
            else {
                return Err(anyhow!("Widget {id} is not a chart"));
            };
            if *current == timeframe {
                return Ok(future::ready(Ok(())).boxed());
            }

            let new_kind = WidgetKind::chart(exchange, symbol, timeframe, *market);
            let old_key = single_key(&record.kind)?;
            let new_key = single_key(&new_kind)?;

            inner.store.set_kind(id, new_kind)?;
            inner.store.remove_feed(id, &old_key)?;
            inner.store.update_feed(id, &new_key, start_loading)?;
            let opened = inner.opened.entry(id).or_default();
            opened.remove(&old_key);
            opened.insert(new_key.clone());
            (old_key, new_key, inner.store.take_events())
        };
        self.emit_store_events(events);
        log::info!("widget {id} switching from {old_key} to {new_key}");

        let task = self
            .state
            .registry
            .resubscribe(self.subscriber(id), &old_key, new_key.clone());
        self.sync_feed_status(&new_key);
        let this = self.clone();
        Ok(async move {
            let result = task.await;
            this.finish_subscription(id, result)
        }
        .boxed())
    }

    /// Start dragging `id`, raising it above its siblings.
    pub fn begin_drag(&self, id: WidgetId, pointer: Point) -> Result<bool> {
        self.begin_gesture(id, |controller, current| controller.begin_drag(pointer, current))
    }

    /// Start resizing `id` from `handle`, raising it above its siblings.
    pub fn begin_resize(&self, id: WidgetId, pointer: Point, handle: ResizeHandle) -> Result<bool> {
        self.begin_gesture(id, |controller, current| {
            controller.begin_resize(pointer, current, handle)
        })
    }

    pub fn pointer_move(&self, id: WidgetId, sample: PointerSample) -> Result<Option<GestureFrame>> {
        let (frame, store_events) = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            let controller = inner
                .controllers
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Widget {id} not found"))?;
            let mut delegate = StoreDelegate::new(&mut inner.store, self.state.settings.snapping.threshold);
            let frame = controller.on_pointer_move(sample, &mut delegate);
            (frame, inner.store.take_events())
        };

        let mut events: Vec<DashboardEvent> = store_events.into_iter().map(DashboardEvent::Store).collect();
        if let Some(frame) = &frame {
            log::debug!("widget {id} moved to {:?} with {} guides", frame.bounds, frame.guides.len());
            events.push(DashboardEvent::GuidesChanged {
                widget_id: id,
                guides: frame.guides.clone(),
            });
        }
        self.emit(events);
        Ok(frame)
    }

    pub fn end_gesture(&self, id: WidgetId) -> Result<bool> {
        self.finish_gesture(id, false)
    }

    /// Abort the active gesture, restoring the geometry it started from.
    pub fn cancel_gesture(&self, id: WidgetId) -> Result<bool> {
        self.finish_gesture(id, true)
    }

    pub fn active_gesture(&self, id: WidgetId) -> Option<GestureKind> {
        let inner = self.state.inner.lock();
        inner.controllers.get(&id)?.active_gesture()
    }

    pub fn widget(&self, id: WidgetId) -> Option<WidgetRecord> {
        self.state.inner.lock().store.widget(id).cloned()
    }

    pub fn widget_bounds(&self, id: WidgetId) -> Option<Bounds> {
        let inner = self.state.inner.lock();
        inner.store.widget(id).map(|record| record.geometry.bounds())
    }

    pub fn widget_ids(&self) -> Vec<WidgetId> {
        self.state.inner.lock().store.widget_ids()
    }

    pub fn feed_state(&self, id: WidgetId, key: &SubscriptionKey) -> Option<FeedState> {
        self.state.inner.lock().store.feed(id, key).cloned()
    }

    pub fn layout(&self) -> PersistedLayout {
        let inner = self.state.inner.lock();
        PersistedLayout {
            version: LAYOUT_VERSION,
            widgets: inner
                .store
                .widgets()
                .map(|record| PersistedWidget {
                    kind: record.kind.clone(),
                    bounds: record.geometry.bounds(),
                    z_index: record.geometry.z_index,
                })
                .collect(),
        }
    }

    /// Replace every widget with the ones in `layout`, keeping their stacking
    /// order. Entries that cannot be restored are logged and skipped.
    pub fn restore_layout(&self, layout: &PersistedLayout) -> BoxFuture<'static, Result<()>> {
        for id in self.widget_ids() {
            self.remove_widget(id).log_err();
        }

        let tasks: Vec<_> = layout
            .widgets_by_z_index()
            .into_iter()
            .filter_map(|widget| {
                self.add_widget(widget.kind.clone(), widget.bounds)
                    .log_err()
                    .map(|(_, task)| task)
            })
            .collect();
        log::info!("restored {} widgets on dashboard {}", tasks.len(), self.state.id);

        async move {
            let results = future::join_all(tasks).await;
            results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
        }
        .boxed()
    }

    pub fn save_layout(&self, config_dir: &Path) -> Result<()> {
        self.layout()
            .save(config_dir, &self.state.settings.layout.file_name)
            .context("saving dashboard layout")
    }

    /// Restore the layout saved in `config_dir` if the settings ask for it.
    /// An unreadable layout is logged and leaves the dashboard untouched.
    pub fn restore_saved_layout(&self, config_dir: &Path) -> BoxFuture<'static, Result<()>> {
        let settings = &self.state.settings.layout;
        if !settings.restore_on_startup {
            return future::ready(Ok(())).boxed();
        }
        match PersistedLayout::load(config_dir, &settings.file_name).warn_on_err() {
            Some(layout) if !layout.widgets.is_empty() => self.restore_layout(&layout),
            _ => future::ready(Ok(())).boxed(),
        }
    }

    fn subscribe_keys(&self, id: WidgetId, keys: Vec<SubscriptionKey>) -> BoxFuture<'static, Result<()>> {
        let subscriber = self.subscriber(id);
        let pending: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let task = self.state.registry.subscribe(subscriber.clone(), key.clone());
                self.sync_feed_status(&key);
                task
            })
            .collect();

        let this = self.clone();
        async move {
            let mut first_error = None;
            for task in pending {
                let result = task.await;
                if let Err(error) = this.finish_subscription(id, result) {
                    first_error.get_or_insert(error);
                }
            }
            match first_error {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
        .boxed()
    }

    /// Turn the outcome of one of `id`'s subscription attempts into the
    /// widget-facing result.
    fn finish_subscription(&self, id: WidgetId, result: Result<(), SubscriptionError>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error @ SubscriptionError::Unsubscribed { .. }) => {
                log::debug!("widget {id} released {} before it connected", error.key());
                Ok(())
            }
            Err(SubscriptionError::ConnectFailed { key, reason }) => {
                log::warn!(
                    "widget {id} on dashboard {} failed to subscribe to {key}: {reason}",
                    self.state.id
                );
                Err(anyhow!("Subscription failed: {reason}"))
            }
        }
    }

    /// Copy the registry's status for `key` onto every widget here that
    /// holds it.
    fn sync_feed_status(&self, key: &SubscriptionKey) {
        let Some(snapshot) = self.state.registry.record(key) else {
            return;
        };
        let events = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            for (id, keys) in &inner.opened {
                if keys.contains(key) {
                    inner
                        .store
                        .update_feed(*id, key, |feed| apply_status(feed, &snapshot))
                        .log_err();
                }
            }
            inner.store.take_events()
        };
        self.emit_store_events(events);
    }

    fn handle_registry_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::StatusChanged { key, .. } => self.sync_feed_status(key),
            RegistryEvent::Updated {
                key,
                subscribers,
                payload,
            } => self.route_update(key, subscribers, payload),
            RegistryEvent::Closed { .. } => {}
        }
    }

    fn route_update(&self, key: &SubscriptionKey, subscribers: &[SubscriberId], payload: &Value) {
        let widget_ids: Vec<WidgetId> = subscribers
            .iter()
            .filter(|subscriber| subscriber.dashboard_id() == &*self.state.id)
            .map(|subscriber| WidgetId(subscriber.widget_id()))
            .collect();
        if widget_ids.is_empty() {
            return;
        }

        let now = SystemTime::now();
        let events = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            for id in widget_ids {
                if !inner.opened.get(&id).is_some_and(|keys| keys.contains(key)) {
                    continue;
                }
                inner
                    .store
                    .update_feed(id, key, |feed| {
                        feed.is_loading = false;
                        feed.error = None;
                        feed.last_value = Some(payload.clone());
                        feed.last_update = Some(now);
                    })
                    .log_err();
            }
            inner.store.take_events()
        };
        self.emit_store_events(events);
    }

    fn begin_gesture(
        &self,
        id: WidgetId,
        begin: impl FnOnce(&mut GestureController, Bounds) -> bool,
    ) -> Result<bool> {
        let (started, events) = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            let current = inner.store.bounds(id)?;
            let controller = inner
                .controllers
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Widget {id} has no gesture controller"))?;
            let started = begin(controller, current);
            if started {
                inner.store.bring_to_front(id)?;
            }
            (started, inner.store.take_events())
        };
        self.emit_store_events(events);
        Ok(started)
    }

    fn finish_gesture(&self, id: WidgetId, cancel: bool) -> Result<bool> {
        let (ended, store_events) = {
            let mut inner = self.state.inner.lock();
            let inner = &mut *inner;
            let controller = inner
                .controllers
                .get_mut(&id)
                .ok_or_else(|| anyhow!("Widget {id} not found"))?;
            let mut delegate = StoreDelegate::new(&mut inner.store, self.state.settings.snapping.threshold);
            if cancel {
                controller.cancel_gesture(&mut delegate);
            } else {
                controller.end_gesture(&mut delegate);
            }
            (delegate.ended, inner.store.take_events())
        };

        let mut events: Vec<DashboardEvent> = store_events.into_iter().map(DashboardEvent::Store).collect();
        if let Some(kind) = ended {
            events.push(DashboardEvent::GuidesChanged {
                widget_id: id,
                guides: Vec::new(),
            });
            events.push(DashboardEvent::GestureEnded { widget_id: id, kind });
        }
        self.emit(events);
        Ok(ended.is_some())
    }

    /// Shrink and shift `bounds` so it respects the minimum widget size and
    /// lies inside the container.
    fn fit_to_container(&self, requested: Bounds) -> Bounds {
        let container = self.state.settings.container_bounds();
        let mut size = requested.size.max(&self.state.settings.widgets.min_size);
        size.width = size.width.min(container.size.width);
        size.height = size.height.min(container.size.height);

        let x = requested
            .origin
            .x
            .min(container.right() - size.width)
            .max(container.left());
        let y = requested
            .origin
            .y
            .min(container.bottom() - size.height)
            .max(container.top());
        bounds(point(x, y), size)
    }

    fn emit_store_events(&self, events: Vec<StoreEvent>) {
        self.emit(events.into_iter().map(DashboardEvent::Store).collect());
    }

    fn emit(&self, events: Vec<DashboardEvent>) {
        for event in &events {
            self.state.events.emit(event);
        }
    }
}

fn start_loading(feed: &mut FeedState) {
    *feed = FeedState {
        is_loading: true,
        ..FeedState::default()
    };
}

fn apply_status(feed: &mut FeedState, snapshot: &SubscriptionSnapshot) {
    match &snapshot.status {
        SubscriptionStatus::Pending => {
            feed.is_loading = true;
            feed.error = None;
        }
        SubscriptionStatus::Active => {
            feed.is_loading = false;
            feed.error = None;
            if feed.last_value.is_none() {
                feed.last_value = snapshot.last_value.clone();
                feed.last_update = snapshot.last_update;
            }
        }
        SubscriptionStatus::Error(reason) => {
            feed.is_loading = false;
            feed.error = Some(format!("Subscription failed: {reason}"));
        }
    }
}

fn single_key(kind: &WidgetKind) -> Result<SubscriptionKey> {
    kind.subscription_keys()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("{kind:?} has no subscription key"))
}

/// Connects a widget's gesture controller to the store for one call.
struct StoreDelegate<'a> {
    store: &'a mut WidgetStore,
    threshold: f32,
    ended: Option<GestureKind>,
}

impl<'a> StoreDelegate<'a> {
    fn new(store: &'a mut WidgetStore, threshold: f32) -> Self {
        Self {
            store,
            threshold,
            ended: None,
        }
    }
}

impl GestureDelegate for StoreDelegate<'_> {
    fn container_bounds(&self) -> Bounds {
        self.store.container_bounds()
    }

    fn guides_for(&self, candidate: &WidgetBounds) -> Option<Vec<GuideLine>> {
        let siblings = self.store.sibling_snapshot(candidate.id);
        Some(compute_guides(
            candidate,
            &siblings,
            &self.store.container_bounds(),
            self.threshold,
        ))
    }

    fn commit_position(&mut self, widget_id: WidgetId, position: Point) {
        self.store.set_position(widget_id, position).log_err();
    }

    fn commit_size(&mut self, widget_id: WidgetId, size: Size) {
        self.store.set_size(widget_id, size).log_err();
    }

    fn gesture_ended(&mut self, _: WidgetId, kind: GestureKind) {
        self.ended = Some(kind);
    }
}
