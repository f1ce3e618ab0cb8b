/*!
HEALTH - unit liveness housekeeping and the supervisor status topic

The healthcheck only asks the service manager whether units run; it never
reads the configuration store, so membership stays event-driven.
*/

use crate::registry::ServiceRegistry;
use conduit_core::config::SupervisorSettings;
use conduit_core::{topics, EventBus, ServiceManager, Subscription};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    /// A restart older than this resets the counter
    pub window: Duration,
}

impl From<&SupervisorSettings> for RestartPolicy {
    fn from(settings: &SupervisorSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            window: settings.restart_window,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    Restarted { attempt: u32 },
    GaveUp,
    RestartFailed,
    /// The connection was removed while its unit was being restarted; the unit was torn down again
    Superseded,
}

fn window_elapsed(last: Option<OffsetDateTime>, now: OffsetDateTime, window: Duration) -> bool {
    match last {
        None => true,
        Some(last) => {
            let elapsed = now - last;
            elapsed.is_negative() || elapsed.unsigned_abs() > window
        }
    }
}

/// Restarts active units the service manager reports as dead.
///
/// Returns what was done per connection; healthy units are left out.
pub async fn healthcheck(
    registry: &ServiceRegistry,
    manager: &dyn ServiceManager,
    policy: RestartPolicy,
    now: OffsetDateTime,
) -> Vec<(String, HealthAction)> {
    let mut actions = Vec::new();
    let watched = registry
        .snapshot()
        .into_iter()
        .filter(|r| r.enabled && r.active);

    for record in watched {
        let id = record.conn_id.as_str();
        let generation = record.generation;
        if manager.is_active(id).await {
            continue;
        }
        // removed or re-registered while we were asking
        if !registry.is_current(id, generation) {
            debug!(conn_id = %id, "Record changed during healthcheck, leaving the unit alone");
            continue;
        }
        let count = if window_elapsed(record.last_restart, now, policy.window) {
            0
        } else {
            record.restart_count
        };

        let action = if count >= policy.max_restarts {
            error!(
                conn_id = %id,
                "Unit keeps dying ({} restarts within {:?}), giving up until the next event",
                count,
                policy.window
            );
            registry.update(id, |r| {
                if r.generation == generation {
                    r.active = false;
                    r.restart_count = count;
                }
            });
            HealthAction::GaveUp
        } else {
            warn!(conn_id = %id, "Unit not running, restarting ({}/{})", count + 1, policy.max_restarts);
            match manager.start_unit(id).await {
                Ok(()) if !registry.contains(id) => {
                    info!(conn_id = %id, "Connection removed during restart, tearing the unit down");
                    if let Err(e) = manager.stop_unit(id).await {
                        warn!(conn_id = %id, "{}", e);
                    }
                    if let Err(e) = manager.remove_unit(id).await {
                        warn!(conn_id = %id, "{}", e);
                    }
                    HealthAction::Superseded
                }
                Ok(()) => {
                    registry.update(id, |r| {
                        r.restart_count = count + 1;
                        r.last_restart = Some(now);
                    });
                    HealthAction::Restarted { attempt: count + 1 }
                }
                Err(e) => {
                    error!(conn_id = %id, "{}", e);
                    registry.update(id, |r| {
                        if r.generation == generation {
                            r.active = false;
                        }
                    });
                    HealthAction::RestartFailed
                }
            }
        };
        actions.push((record.conn_id, action));
    }

    if !actions.is_empty() {
        if let Err(e) = registry.save().await {
            warn!("Cannot persist service registry: {}", e);
        }
    }
    actions
}

pub fn spawn_health_monitor(
    registry: ServiceRegistry,
    manager: Arc<dyn ServiceManager>,
    policy: RestartPolicy,
    period: Duration,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // first tick fires immediately, the startup pass just ran
        interval.tick().await;
        loop {
            interval.tick().await;
            let actions =
                healthcheck(&registry, manager.as_ref(), policy, OffsetDateTime::now_utc()).await;
            if !actions.is_empty() {
                debug!("Healthcheck acted on {} unit(s)", actions.len());
            }
        }
    })
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub protocol: String,
    pub module: String,
    pub enabled: bool,
    pub active: bool,
    pub restart_count: u32,
}

#[derive(Debug, Serialize)]
pub struct SupervisorStatus {
    pub uptime_seconds: u64,
    pub total: usize,
    pub active: usize,
    pub services: BTreeMap<String, ServiceStatus>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

pub fn status_of(registry: &ServiceRegistry, started: Instant) -> SupervisorStatus {
    let services: BTreeMap<String, ServiceStatus> = registry
        .snapshot()
        .into_iter()
        .map(|r| {
            (
                r.conn_id,
                ServiceStatus {
                    protocol: r.protocol,
                    module: r.module,
                    enabled: r.enabled,
                    active: r.active,
                    restart_count: r.restart_count,
                },
            )
        })
        .collect();
    SupervisorStatus {
        uptime_seconds: started.elapsed().as_secs(),
        total: services.len(),
        active: services.values().filter(|s| s.active).count(),
        services,
        timestamp: OffsetDateTime::now_utc(),
    }
}

async fn publish_status(bus: &dyn EventBus, registry: &ServiceRegistry, started: Instant) {
    let status = status_of(registry, started);
    match serde_json::to_vec(&status) {
        Ok(payload) => match bus.publish(topics::SUPERVISOR_STATUS, payload).await {
            Ok(()) => debug!("Published status ({} active / {})", status.active, status.total),
            Err(e) => warn!("Failed to publish status: {}", e),
        },
        Err(e) => error!("Cannot encode status: {}", e),
    }
}

/// Publishes the service list every `period`, and immediately on each list command
pub fn spawn_status_publisher(
    bus: Arc<dyn EventBus>,
    registry: ServiceRegistry,
    mut list_requests: Subscription,
    period: Duration,
) -> JoinHandle<()> {
    let started = Instant::now();
    task::spawn(async move {
        let mut interval = tokio::time::interval(period);
        let mut requests_open = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                request = list_requests.recv(), if requests_open => {
                    if request.is_none() {
                        requests_open = false;
                        continue;
                    }
                    info!("Service list requested");
                }
            }
            publish_status(bus.as_ref(), &registry, started).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_window() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let window = Duration::from_secs(300);
        assert!(window_elapsed(None, now, window));
        assert!(!window_elapsed(Some(datetime!(2024-05-01 11:56 UTC)), now, window));
        assert!(window_elapsed(Some(datetime!(2024-05-01 11:54 UTC)), now, window));
        // clock went backwards
        assert!(window_elapsed(Some(datetime!(2024-05-01 12:10 UTC)), now, window));
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_restarts, 5);
        assert_eq!(policy.window, Duration::from_secs(300));
    }
}
