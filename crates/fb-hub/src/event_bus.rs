use std::sync::{Arc, Mutex};

use crate::event::Event;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`EventBus::subscribe`] creates a new receiver that will
/// receive every event published after the subscription was created.
/// Publication is synchronous from the publisher's point of view: the
/// event is enqueued for every live subscriber before `publish` returns,
/// and each subscriber observes events in publication order. The bus is
/// thread-safe and can be cloned cheaply (it wraps its internals in an
/// `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Arc<Event>>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<Arc<Event>> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// automatically pruned.
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(Arc::clone(&event)).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    #[test]
    fn new_bus_has_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn publish_delivers_to_every_subscriber() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(Event::new(EventType::TicketCreated, json!({"id": "1"})));

        assert_eq!(rx1.try_recv().unwrap().event_type, EventType::TicketCreated);
        assert_eq!(rx2.try_recv().unwrap().event_type, EventType::TicketCreated);
    }

    #[test]
    fn subscriber_observes_publication_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(Event::new(EventType::TicketCreated, json!({})));
        bus.publish(Event::new(EventType::TicketClaimed, json!({})));
        bus.publish(Event::new(EventType::TicketCompleted, json!({})));

        assert_eq!(rx.try_recv().unwrap().event_type, EventType::TicketCreated);
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::TicketClaimed);
        assert_eq!(rx.try_recv().unwrap().event_type, EventType::TicketCompleted);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx1);
        bus.publish(Event::new(EventType::AgentStarted, json!({})));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn no_events_before_subscription() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventType::AgentStarted, json!({})));
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clone_shares_state() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        let rx = bus1.subscribe();
        assert_eq!(bus2.subscriber_count(), 1);
        bus2.publish(Event::new(EventType::BuildStarted, json!({})));
        assert!(rx.try_recv().is_ok());
    }
}
