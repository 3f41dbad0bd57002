//! In-process publish/subscribe used for property and state changes.
//!
//! Subscriptions are keyed by `(event type, subscriber name)`: subscribing
//! twice under the same name replaces the previous callback, so a component
//! that re-registers never receives duplicate deliveries. Emission is
//! synchronous on the emitting thread, in subscription-table order.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Marker trait for event kinds. The key identifies what changed (e.g. a
/// property name or device id), the payload carries the new value.
pub trait Event: 'static {
    type Key: Clone + Send + 'static;
    type Payload: Clone + Send + 'static;
}

type Callback<E> = Arc<dyn Fn(&<E as Event>::Key, &<E as Event>::Payload) + Send + Sync>;

#[derive(Default)]
pub struct EventManager {
    // TypeId of the event kind -> subscriber name -> type-erased callback.
    subscriptions: Mutex<HashMap<TypeId, HashMap<String, Box<dyn Any + Send>>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<E: Event>(
        &self,
        subscriber: &str,
        callback: impl Fn(&E::Key, &E::Payload) + Send + Sync + 'static,
    ) {
        let cb: Callback<E> = Arc::new(callback);
        self.subscriptions
            .lock()
            .entry(TypeId::of::<E>())
            .or_default()
            .insert(subscriber.to_owned(), Box::new(cb));
    }

    pub fn unsubscribe<E: Event>(&self, subscriber: &str) {
        if let Some(subs) = self.subscriptions.lock().get_mut(&TypeId::of::<E>()) {
            subs.remove(subscriber);
        }
    }

    /// Deliver `payload` to every subscriber of `E`, synchronously.
    ///
    /// Callbacks are cloned out before invocation so a callback may call
    /// back into the manager (e.g. unsubscribe itself) without deadlocking.
    pub fn emit<E: Event>(&self, key: &E::Key, payload: &E::Payload) {
        let callbacks: Vec<Callback<E>> = {
            let subs = self.subscriptions.lock();
            match subs.get(&TypeId::of::<E>()) {
                Some(entries) => entries
                    .values()
                    .filter_map(|any| any.downcast_ref::<Callback<E>>().cloned())
                    .collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(key, payload);
        }
    }
}
