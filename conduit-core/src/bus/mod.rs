//! Event bus adapter.
//!
//! Publish/subscribe over topic strings. Delivery is at-least-once; consumers
//! must treat duplicate notifications as harmless.

mod mqtt;

pub use mqtt::{topic_matches, MqttBus};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Well-known topic names
pub mod topics {
    pub const CONNECTION_ADDED: &str = "system/supervisor/connection_added";
    pub const CONNECTION_REMOVED: &str = "system/supervisor/connection_removed";
    pub const SUPERVISOR_STATUS: &str = "system/supervisor/status";
    /// Restart one managed unit; payload carries the connection id
    pub const SUPERVISOR_RESTART: &str = "system/supervisor/cmd/restart";
    /// Publish the service list now instead of waiting for the next status tick
    pub const SUPERVISOR_LIST: &str = "system/supervisor/cmd/list";

    /// Per-connection reload channel
    pub fn config_reload(conn_id: &str) -> String {
        format!("system/{conn_id}/config_reload")
    }
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Deserialize)]
struct ConnIdPayload {
    conn_id: String,
}

impl Notification {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Extracts the connection id carried by supervisor notifications.
    ///
    /// Accepts `{"conn_id": "..."}`, a JSON string or the raw id as text.
    pub fn conn_id(&self) -> Option<String> {
        if let Ok(p) = serde_json::from_slice::<ConnIdPayload>(&self.payload) {
            return non_empty(p.conn_id);
        }
        if let Ok(s) = serde_json::from_slice::<String>(&self.payload) {
            return non_empty(s);
        }
        let text = std::str::from_utf8(&self.payload).ok()?;
        if text.trim_start().starts_with('{') {
            return None;
        }
        non_empty(text.to_string())
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Stream of notifications for one subscription
pub type Subscription = mpsc::UnboundedReceiver<Notification>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("bus closed")]
    Closed,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Registers interest in `topic`; notifications arrive on the returned channel
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Stops delivery; every open subscription channel is closed
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_payload_shapes() {
        let n = Notification::new(topics::CONNECTION_ADDED, r#"{"conn_id": "mtc-01"}"#);
        assert_eq!(n.conn_id().as_deref(), Some("mtc-01"));

        let n = Notification::new(topics::CONNECTION_ADDED, r#""mtc-02""#);
        assert_eq!(n.conn_id().as_deref(), Some("mtc-02"));

        let n = Notification::new(topics::CONNECTION_REMOVED, " mtc-03\n");
        assert_eq!(n.conn_id().as_deref(), Some("mtc-03"));
    }

    #[test]
    fn test_conn_id_rejects_garbage() {
        assert_eq!(Notification::new("t", "").conn_id(), None);
        assert_eq!(Notification::new("t", r#"{"id": "x"}"#).conn_id(), None);
        assert_eq!(Notification::new("t", vec![0xff, 0xfe]).conn_id(), None);
    }

    #[test]
    fn test_reload_topic_is_scoped() {
        assert_eq!(topics::config_reload("mtc-01"), "system/mtc-01/config_reload");
    }
}
