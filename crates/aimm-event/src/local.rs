//! In-process event bus.
//!
//! Keeps the latest event per event type and fans registered events out to
//! matching subscribers. Used by embedded deployments and tests; a
//! networked bus implements the same [`EventClient`] trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use aimm_core::event::{Event, EventType, RegisterEvent, Subscription};

use crate::{Connection, EventBusResult, EventClient};

#[derive(Default)]
struct BusInner {
    latest: Mutex<HashMap<EventType, Event>>,
    subscribers: Mutex<Vec<(Subscription, mpsc::UnboundedSender<Vec<Event>>)>>,
}

/// An in-process latest-wins event bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

impl LocalBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a client receiving every event matching `subscription`.
    pub fn connect(&self, subscription: Subscription) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push((subscription, tx));
        Connection {
            client: Arc::new(LocalClient {
                inner: Arc::clone(&self.inner),
            }),
            events: rx,
        }
    }

    /// Returns a bare client handle without an inbound stream.
    pub fn client(&self) -> Arc<dyn EventClient> {
        Arc::new(LocalClient {
            inner: Arc::clone(&self.inner),
        })
    }
}

struct LocalClient {
    inner: Arc<BusInner>,
}

impl LocalClient {
    fn publish(&self, events: Vec<RegisterEvent>) -> Vec<Event> {
        let stored: Vec<Event> = events
            .into_iter()
            .map(|e| Event {
                event_type: e.event_type,
                payload: e.payload,
            })
            .collect();

        {
            let mut latest = self.inner.latest.lock();
            for event in &stored {
                latest.insert(event.event_type.clone(), event.clone());
            }
        }

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|(subscription, tx)| {
            let matching: Vec<Event> = stored
                .iter()
                .filter(|e| subscription.matches(&e.event_type))
                .cloned()
                .collect();
            if matching.is_empty() {
                !tx.is_closed()
            } else {
                tx.send(matching).is_ok()
            }
        });

        debug!(count = stored.len(), "published events on local bus");
        stored
    }
}

#[async_trait]
impl EventClient for LocalClient {
    async fn register(&self, events: Vec<RegisterEvent>) -> EventBusResult<()> {
        self.publish(events);
        Ok(())
    }

    async fn register_with_response(
        &self,
        events: Vec<RegisterEvent>,
    ) -> EventBusResult<Vec<Event>> {
        Ok(self.publish(events))
    }

    async fn query(&self, subscription: &Subscription) -> EventBusResult<Vec<Event>> {
        let latest = self.inner.latest.lock();
        Ok(latest
            .values()
            .filter(|e| subscription.matches(&e.event_type))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_fans_out_to_matching_subscriber() {
        let bus = LocalBus::new();
        let mut conn = bus.connect(Subscription::prefix(&path(&["aimm", "fit"])));
        let other = bus.client();

        other
            .register(vec![
                RegisterEvent::new(path(&["aimm", "fit", "1"]), json!({"a": 1})),
                RegisterEvent::new(path(&["unrelated"]), json!(null)),
            ])
            .await
            .unwrap();

        let batch = conn.events.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event_type, path(&["aimm", "fit", "1"]));
    }

    #[tokio::test]
    async fn test_query_returns_latest_per_type() {
        let bus = LocalBus::new();
        let client = bus.client();
        client
            .register(vec![RegisterEvent::new(path(&["m", "1"]), json!("old"))])
            .await
            .unwrap();
        client
            .register(vec![RegisterEvent::new(path(&["m", "1"]), json!("new"))])
            .await
            .unwrap();

        let events = client
            .query(&Subscription::prefix(&path(&["m"])))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, json!("new"));
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let bus = LocalBus::new();
        let conn = bus.connect(Subscription::prefix(&path(&["aimm"])));
        drop(conn.events);
        // Publishing after the receiver is gone must not error.
        bus.client()
            .register(vec![RegisterEvent::new(path(&["aimm", "x"]), json!(1))])
            .await
            .unwrap();
    }
}
