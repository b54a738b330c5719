//! The publish-subscribe fabric shared by the clock, sleeper and scheduler.
//!
//! Handlers are called synchronously, in the order their subscriptions were made.
//! The bus keeps two indices that are always updated together: subscription →
//! subscribers and subscriber → subscriptions. Removing a handler therefore only
//! touches the entries it actually owns.
//!
//! Every dispatched event is also sent on a `broadcast` channel, so async observers
//! (a UI, a logger) can follow the bus without registering a handler.

use crate::common::HandlerId;
use crate::events::{Event, EventKind, Subscription};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// Something that reacts to bus events.
pub trait Handler: Send + Sync {
    fn hook(&self, event: &Event);
}

/// Adapts a closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn hook(&self, event: &Event) {
        (self.0)(event)
    }
}

#[derive(Default)]
struct BusInner {
    handlers: SlotMap<HandlerId, Arc<dyn Handler>>,
    /// Subscribers per subscription, each tagged with its registration order.
    event_hooks: HashMap<Subscription, Vec<(u64, HandlerId)>>,
    hook_events: SecondaryMap<HandlerId, HashSet<Subscription>>,
    next_order: u64,
}

impl BusInner {
    fn ordered_subscribers(&self, kind: EventKind) -> Vec<HandlerId> {
        let mut entries: Vec<(u64, HandlerId)> = Vec::new();
        for subscription in [Subscription::Only(kind), Subscription::AllEvents] {
            if let Some(list) = self.event_hooks.get(&subscription) {
                entries.extend(list.iter().copied());
            }
        }
        entries.sort_by_key(|(order, _)| *order);
        let mut seen = HashSet::new();
        entries
            .into_iter()
            .filter(|(_, id)| seen.insert(*id))
            .map(|(_, id)| id)
            .collect()
    }
}

/// The event bus.
pub struct EventBus {
    inner: Mutex<BusInner>,
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(BusInner::default()),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a handler with no subscriptions yet.
    pub fn add_handler(&self, handler: Arc<dyn Handler>) -> HandlerId {
        let mut inner = self.lock();
        let id = inner.handlers.insert(handler);
        inner.hook_events.insert(id, HashSet::new());
        id
    }

    /// Adds a closure as a handler.
    pub fn add_fn<F>(&self, f: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(FnHandler(f)))
    }

    /// Subscribes a handler. Returns `false` if the handler is unknown or already
    /// holds this subscription.
    pub fn register(&self, id: HandlerId, subscription: impl Into<Subscription>) -> bool {
        let subscription = subscription.into();
        let mut inner = self.lock();
        let inserted = match inner.hook_events.get_mut(id) {
            Some(events) => events.insert(subscription),
            None => return false,
        };
        if inserted {
            let order = inner.next_order;
            inner.next_order += 1;
            inner
                .event_hooks
                .entry(subscription)
                .or_default()
                .push((order, id));
        }
        inserted
    }

    /// Removes one subscription. Returns `false` if it did not exist.
    pub fn unregister(&self, id: HandlerId, subscription: impl Into<Subscription>) -> bool {
        let subscription = subscription.into();
        let mut inner = self.lock();
        let removed = match inner.hook_events.get_mut(id) {
            Some(events) => events.remove(&subscription),
            None => false,
        };
        if removed {
            if let Some(list) = inner.event_hooks.get_mut(&subscription) {
                list.retain(|(_, other)| *other != id);
                if list.is_empty() {
                    inner.event_hooks.remove(&subscription);
                }
            }
        }
        removed
    }

    /// Removes a handler together with all of its subscriptions.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        let Some(subscriptions) = inner.hook_events.remove(id) else {
            return false;
        };
        for subscription in subscriptions {
            if let Some(list) = inner.event_hooks.get_mut(&subscription) {
                list.retain(|(_, other)| *other != id);
                if list.is_empty() {
                    inner.event_hooks.remove(&subscription);
                }
            }
        }
        inner.handlers.remove(id);
        true
    }

    pub fn subscriptions(&self, id: HandlerId) -> Vec<Subscription> {
        self.lock()
            .hook_events
            .get(id)
            .map(|events| events.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Handlers that would receive an event of `kind`, in dispatch order.
    pub fn subscribers(&self, kind: EventKind) -> Vec<HandlerId> {
        self.lock().ordered_subscribers(kind)
    }

    pub fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    /// Calls every subscribed handler, then mirrors the event to async observers.
    ///
    /// The bus lock is released before any hook runs, so hooks may use the bus.
    pub fn dispatch(&self, event: Event) {
        let handlers: Vec<Arc<dyn Handler>> = {
            let inner = self.lock();
            inner
                .ordered_subscribers(event.kind())
                .into_iter()
                .filter_map(|id| inner.handlers.get(id).cloned())
                .collect()
        };
        trace!(event = %event.kind(), handlers = handlers.len(), "Dispatching event");
        for handler in &handlers {
            handler.hook(&event);
        }
        self.sender.send(event).ok();
    }

    /// Subscribes to the mirrored event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Drops every handler and subscription.
    pub fn clear(&self) {
        *self.lock() = BusInner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> HandlerId {
        let log = log.clone();
        bus.add_fn(move |event| {
            log.lock()
                .unwrap()
                .push(format!("{tag}:{}", event.kind()));
        })
    }

    #[test]
    fn dispatch_follows_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&bus, &log, "a");
        let b = recorder(&bus, &log, "b");
        let c = recorder(&bus, &log, "c");

        bus.register(b, EventKind::Pause);
        bus.register(c, Subscription::AllEvents);
        bus.register(a, EventKind::Pause);

        bus.dispatch(Event::Pause);
        bus.dispatch(Event::Start);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["b:pause", "c:pause", "a:pause", "c:start"]
        );
    }

    #[test]
    fn handler_subscribed_twice_is_called_once() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&bus, &log, "a");
        assert!(bus.register(a, Subscription::AllEvents));
        assert!(bus.register(a, EventKind::Stop));
        assert!(!bus.register(a, EventKind::Stop));

        bus.dispatch(Event::Stop);
        assert_eq!(*log.lock().unwrap(), vec!["a:stop"]);
    }

    #[test]
    fn unregister_and_remove_keep_both_indices_in_sync() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = recorder(&bus, &log, "a");
        let b = recorder(&bus, &log, "b");
        bus.register(a, EventKind::Start);
        bus.register(a, EventKind::Stop);
        bus.register(b, EventKind::Stop);

        assert!(bus.unregister(a, EventKind::Start));
        assert!(!bus.unregister(a, EventKind::Start));
        assert_eq!(bus.subscriptions(a), vec![Subscription::Only(EventKind::Stop)]);
        assert!(bus.subscribers(EventKind::Start).is_empty());

        assert!(bus.remove_handler(a));
        assert!(!bus.remove_handler(a));
        assert_eq!(bus.subscribers(EventKind::Stop), vec![b]);
        assert!(!bus.register(a, EventKind::Stop));
        assert_eq!(bus.handler_count(), 1);

        bus.dispatch(Event::Stop);
        assert_eq!(*log.lock().unwrap(), vec!["b:stop"]);
    }

    #[test]
    fn dispatch_is_mirrored_to_async_observers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.dispatch(Event::TempoChange { old: 120.0, new: 90.0 });
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::TempoChange { old: 120.0, new: 90.0 }
        );
    }
}
