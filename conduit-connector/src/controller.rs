//! Reconfiguration controller.
//!
//! Each reload notification is only a wake-up: the controller re-reads the
//! connection from the store and compares its transport parameters with the
//! ones the process started with.
//! - same parameters: block-only change, set the reconfigure flag
//! - different parameters: connection-info change, ask for a clean restart

use crate::signals::ControlSignals;
use conduit_core::{
    ConfigStore, ConnectionDescriptor, Notification, StoreError, Subscription, TransportParams,
};
use std::sync::Arc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Hot reload, transport kept
    BlockOnly,
    /// Host, port, timeout or retry interval differ; the process restarts
    ConnectionInfo,
    /// The connection no longer exists in the store
    Vanished,
    /// No comparison possible yet (not configured, or store unreadable); reload anyway
    Unresolved,
}

pub struct ReconfigController {
    conn_id: String,
    store: Arc<dyn ConfigStore>,
    signals: Arc<ControlSignals>,
}

impl ReconfigController {
    pub fn new(
        conn_id: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        signals: Arc<ControlSignals>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            store,
            signals,
        }
    }

    pub fn classify(&self) -> ChangeKind {
        let Some(baseline) = self.signals.baseline() else {
            return ChangeKind::Unresolved;
        };
        self.compare(baseline, self.store.get_connection(&self.conn_id))
    }

    /// Like [`ReconfigController::classify`], with the store read on the blocking pool
    pub async fn classify_off_thread(&self) -> ChangeKind {
        let Some(baseline) = self.signals.baseline().cloned() else {
            return ChangeKind::Unresolved;
        };
        let store = self.store.clone();
        let conn_id = self.conn_id.clone();
        match task::spawn_blocking(move || store.get_connection(&conn_id)).await {
            Ok(lookup) => self.compare(&baseline, lookup),
            Err(e) => {
                warn!(conn_id = %self.conn_id, "Store lookup task failed: {}", e);
                ChangeKind::Unresolved
            }
        }
    }

    fn compare(
        &self,
        baseline: &TransportParams,
        lookup: Result<Option<ConnectionDescriptor>, StoreError>,
    ) -> ChangeKind {
        match lookup {
            Ok(Some(connection)) if connection.transport_params() == *baseline => {
                ChangeKind::BlockOnly
            }
            Ok(Some(_)) => ChangeKind::ConnectionInfo,
            Ok(None) => ChangeKind::Vanished,
            Err(e) => {
                warn!(conn_id = %self.conn_id, "Cannot classify reload: {}", e);
                ChangeKind::Unresolved
            }
        }
    }

    /// Classifies the change and raises the matching control flag
    pub fn handle(&self, notification: &Notification) -> ChangeKind {
        self.apply(notification, self.classify())
    }

    pub async fn handle_off_thread(&self, notification: &Notification) -> ChangeKind {
        let kind = self.classify_off_thread().await;
        self.apply(notification, kind)
    }

    fn apply(&self, notification: &Notification, kind: ChangeKind) -> ChangeKind {
        debug!(conn_id = %self.conn_id, topic = %notification.topic, "Reload classified as {:?}", kind);
        match kind {
            ChangeKind::ConnectionInfo => {
                info!(conn_id = %self.conn_id, "Connection info changed, requesting restart");
                self.signals.request_restart();
            }
            ChangeKind::Vanished => {
                warn!(conn_id = %self.conn_id, "Connection removed from the store, requesting restart");
                self.signals.request_restart();
            }
            ChangeKind::BlockOnly | ChangeKind::Unresolved => self.signals.request_reconfigure(),
        }
        kind
    }

    /// Consumes reload notifications until the subscription closes
    pub fn spawn(self, mut subscription: Subscription) -> JoinHandle<()> {
        task::spawn(async move {
            while let Some(notification) = subscription.recv().await {
                self.handle_off_thread(&notification).await;
            }
            debug!(conn_id = %self.conn_id, "Reload subscription closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::store::MemoryStore;
    use conduit_core::{topics, PropertyMap};
    use std::time::Duration;

    fn connection(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: "mtc-01".into(),
            protocol: "mtc".into(),
            host: Some(host.into()),
            port: Some(502),
            timeout_s: 1.0,
            retry_s: 2.0,
            enabled: true,
            properties: PropertyMap::new(),
            updated_at: None,
        }
    }

    fn setup() -> (MemoryStore, Arc<ControlSignals>, ReconfigController) {
        let store = MemoryStore::new();
        store.upsert_connection(connection("10.0.0.1"));
        let signals = Arc::new(ControlSignals::new());
        signals.pin_baseline(connection("10.0.0.1").transport_params());
        let controller = ReconfigController::new("mtc-01", Arc::new(store.clone()), signals.clone());
        (store, signals, controller)
    }

    fn reload() -> Notification {
        Notification::new(topics::config_reload("mtc-01"), "1700000000")
    }

    #[test]
    fn test_property_change_is_block_only() {
        let (store, signals, controller) = setup();
        store.modify_connection("mtc-01", |c| {
            c.properties.insert("unit_id".into(), 4.into());
        });
        assert_eq!(controller.handle(&reload()), ChangeKind::BlockOnly);
        assert!(signals.take_reconfigure());
        assert!(!signals.restart_requested());
    }

    #[test]
    fn test_host_change_requests_restart() {
        let (store, signals, controller) = setup();
        store.modify_connection("mtc-01", |c| c.host = Some("10.0.0.2".into()));
        assert_eq!(controller.handle(&reload()), ChangeKind::ConnectionInfo);
        assert!(signals.restart_requested());
        assert!(!signals.reconfigure_pending());
    }

    #[test]
    fn test_retry_change_is_connection_info() {
        let (store, _signals, controller) = setup();
        store.modify_connection("mtc-01", |c| c.retry_s = 30.0);
        assert_eq!(controller.classify(), ChangeKind::ConnectionInfo);
    }

    #[test]
    fn test_removed_connection_requests_restart() {
        let (store, signals, controller) = setup();
        store.remove_connection("mtc-01");
        assert_eq!(controller.handle(&reload()), ChangeKind::Vanished);
        assert!(signals.restart_requested());
    }

    #[test]
    fn test_store_failure_falls_back_to_reload() {
        let (store, signals, controller) = setup();
        store.set_unavailable(Some("database is locked"));
        assert_eq!(controller.handle(&reload()), ChangeKind::Unresolved);
        assert!(signals.reconfigure_pending());
    }

    #[test]
    fn test_unpinned_baseline_reloads() {
        let store = MemoryStore::new();
        let signals = Arc::new(ControlSignals::new());
        let controller = ReconfigController::new("mtc-01", Arc::new(store), signals.clone());
        assert_eq!(controller.handle(&reload()), ChangeKind::Unresolved);
        assert!(signals.take_reconfigure());
    }

    #[tokio::test]
    async fn test_off_thread_classification_matches() {
        let (store, signals, controller) = setup();
        assert_eq!(controller.classify_off_thread().await, ChangeKind::BlockOnly);
        store.modify_connection("mtc-01", |c| c.port = Some(1502));
        assert_eq!(
            controller.handle_off_thread(&reload()).await,
            ChangeKind::ConnectionInfo
        );
        assert!(signals.restart_requested());
        store.set_unavailable(Some("database is locked"));
        assert_eq!(controller.classify_off_thread().await, ChangeKind::Unresolved);
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_the_runtime() {
        let (store, signals, controller) = setup();
        store.set_read_delay(Some(Duration::from_millis(500)));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = controller.spawn(rx);
        tx.send(reload()).unwrap();

        // a sibling task keeps ticking while the lookup sleeps on the blocking pool
        let ticker = task::spawn(async {
            let mut ticks = 0;
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ticks += 1;
            }
            ticks
        });
        let started = std::time::Instant::now();
        assert_eq!(ticker.await.unwrap(), 5);
        assert!(started.elapsed() < Duration::from_millis(500));

        drop(tx);
        handle.await.unwrap();
        assert!(signals.take_reconfigure());
    }

    #[tokio::test]
    async fn test_spawned_controller_follows_subscription() {
        let (_store, signals, controller) = setup();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = controller.spawn(rx);
        tx.send(reload()).unwrap();
        tx.send(reload()).unwrap();
        drop(tx);
        handle.await.unwrap();
        assert!(signals.take_reconfigure());
        assert!(!signals.take_reconfigure());
    }
}
