use super::{BusError, EventBus, Notification, Subscription};
use crate::config::MqttSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Routes = Arc<Mutex<Vec<Route>>>;

struct Route {
    filter: String,
    tx: mpsc::UnboundedSender<Notification>,
}

/// MQTT implementation of the event bus.
///
/// One background task polls the rumqttc event loop and fans incoming
/// publishes out to the subscription channels whose filter matches.
pub struct MqttBus {
    client: AsyncClient,
    routes: Routes,
    closed: Arc<AtomicBool>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Creates the client and spawns the event loop task. Must run inside a tokio runtime.
    pub fn connect(settings: &MqttSettings, client_id: &str) -> Self {
        let mut opts = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        opts.set_keep_alive(settings.keep_alive);
        opts.set_clean_session(settings.clean_session);
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let retry_delay = settings.reconnect_delay;

        let poller = {
            let routes = routes.clone();
            let closed = closed.clone();
            let client = client.clone();
            let broker = format!("{}:{}", settings.host, settings.port);
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("Connected to MQTT broker at {}", broker);
                            // the broker may have dropped our session, subscribe again
                            let filters: Vec<String> =
                                routes.lock().iter().map(|r| r.filter.clone()).collect();
                            for filter in filters {
                                if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                                    warn!("Resubscribe to {} failed: {}", filter, e);
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(p))) => {
                            dispatch(&routes, Notification::new(p.topic, p.payload.to_vec()));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if closed.load(Ordering::SeqCst) {
                                break;
                            }
                            warn!("MQTT error: {:?}", e);
                            tokio::time::sleep(retry_delay).await;
                        }
                    }
                }
                debug!("MQTT event loop stopped");
            })
        };

        Self {
            client,
            routes,
            closed,
            poller: Mutex::new(Some(poller)),
        }
    }
}

fn dispatch(routes: &Routes, notification: Notification) {
    let mut routes = routes.lock();
    // receivers that went away are pruned on the way
    routes.retain(|route| {
        if !topic_matches(&route.filter, &notification.topic) {
            return !route.tx.is_closed();
        }
        route.tx.send(notification.clone()).is_ok()
    });
}

/// MQTT filter matching with `+` and `#` wildcards
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if topic_levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

#[async_trait]
impl EventBus for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().push(Route {
            filter: topic.to_string(),
            tx,
        });
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        debug!("Subscribed to {}", topic);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.routes.lock().clear();
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT disconnect: {}", e);
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
    }
}
