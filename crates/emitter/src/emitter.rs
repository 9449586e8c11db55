//! Synchronous observer lists.
//!
//! An [`EventEmitter`] owns a set of callbacks. [`EventEmitter::observe`] hands
//! back an [`EventSubscription`] that unregisters its callback when dropped,
//! so an observer lives exactly as long as the value holding the handle.
//!
//! Callbacks run on the emitting thread, after the observer list lock has been
//! released. An observer may therefore register further observers or drop its
//! own subscription while it is being notified.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Observers<E> {
    next_id: usize,
    callbacks: BTreeMap<usize, Callback<E>>,
}

pub struct EventEmitter<E> {
    observers: Arc<Mutex<Observers<E>>>,
}

impl<E: 'static> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(Mutex::new(Observers {
                next_id: 0,
                callbacks: BTreeMap::new(),
            })),
        }
    }

    /// Register `callback` for every future event.
    ///
    /// Observers are notified in registration order.
    #[must_use = "dropping the subscription unregisters the observer"]
    pub fn observe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> EventSubscription {
        let id = {
            let mut observers = self.observers.lock();
            let id = observers.next_id;
            observers.next_id += 1;
            observers.callbacks.insert(id, Arc::new(callback));
            id
        };

        let observers: Weak<Mutex<Observers<E>>> = Arc::downgrade(&self.observers);
        EventSubscription::new(move || {
            if let Some(observers) = observers.upgrade() {
                observers.lock().callbacks.remove(&id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self.observers.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().callbacks.len()
    }
}

impl<E: 'static> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
        }
    }
}

impl<E> fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("observers", &self.observers.lock().callbacks.len())
            .finish()
    }
}

/// Keeps an observer registered until dropped.
pub struct EventSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl EventSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Keep the observer registered for the lifetime of the emitter.
    pub fn detach(mut self) {
        self.unsubscribe.take();
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
