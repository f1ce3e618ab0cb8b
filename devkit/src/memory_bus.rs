/*!
In-memory event bus for tests without a broker.

Records every publish and lets a test inject notifications as if they came
from the broker.
*/

use anyhow::Result;
use async_trait::async_trait;
use conduit_core::bus::topic_matches;
use conduit_core::{BusError, EventBus, Notification, Subscription};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct MemoryBus {
    published: Arc<Mutex<Vec<Notification>>>,
    routes: Arc<Mutex<Vec<(String, mpsc::UnboundedSender<Notification>)>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a notification to the matching subscriptions; returns how many received it
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let notification = Notification::new(topic, payload);
        let mut delivered = 0;
        self.routes.lock().retain(|(filter, tx)| {
            if !topic_matches(filter, topic) {
                return !tx.is_closed();
            }
            let ok = tx.send(notification.clone()).is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        tracing::debug!("[memory-bus] injected {} -> {} subscriber(s)", topic, delivered);
        delivered
    }

    /// Injects `{"conn_id": id}` the way provisioning tools announce connections
    pub fn inject_conn_id(&self, topic: &str, conn_id: &str) -> usize {
        let payload = serde_json::json!({ "conn_id": conn_id }).to_string();
        self.inject(topic, payload)
    }

    pub fn published(&self) -> Vec<Notification> {
        self.published.lock().clone()
    }

    pub fn find_by_topic(&self, topic: &str) -> Vec<Notification> {
        self.published
            .lock()
            .iter()
            .filter(|n| n.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last payload published on `topic`
    pub fn last_json<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_by_topic(topic).last() {
            Some(n) => Ok(Some(serde_json::from_slice(&n.payload)?)),
            None => Ok(None),
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.routes.lock().iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().push((topic.to_string(), tx));
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.published.lock().push(Notification::new(topic, payload));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.routes.lock().clear();
    }
}
