/*!
FLEET RECONCILER - keeps one running unit per enabled connection

ROLE:
Converges service-manager units with the enabled connections in the store,
driven by `connection_added` / `connection_removed` plus one startup pass.
There is no periodic re-scan of the store.

OPERATION:
- Startup: prune records no longer wanted, create missing units, a single
  manager reload, start inactive units, persist
- Added: re-read the connection from the store, then create/start as needed
- Removed: stop, remove the unit, reload, drop the record

Failures are logged and absorbed: one connection never takes the others
down, and an unconverged connection waits for the next event or startup.
Registry access is short critical sections; all manager I/O runs unlocked
and commits through a generation check.
*/

use crate::error::SupervisorError;
use crate::modules::resolve_module;
use crate::registry::{ServiceRecord, ServiceRegistry};
use conduit_core::{
    topics, BusError, ConfigStore, ConnectionDescriptor, EventBus, ManagerError, ServiceManager,
    Subscription, UnitSpec,
};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Started,
    AlreadyRunning,
    NotInStore,
    Disabled,
    UnknownProtocol,
    StoreFailed,
    CreateFailed,
    StartFailed,
    /// Removed while its unit was being provisioned; the unit was rolled back
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    Unknown,
    Failed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub pruned: Vec<String>,
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    manager: Arc<dyn ServiceManager>,
    registry: ServiceRegistry,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        manager: Arc<dyn ServiceManager>,
        registry: ServiceRegistry,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<dyn ServiceManager> {
        &self.manager
    }

    fn resolve(&self, connection: &ConnectionDescriptor) -> Result<&'static str, SupervisorError> {
        resolve_module(&connection.protocol).ok_or_else(|| SupervisorError::UnknownProtocol {
            conn_id: connection.id.clone(),
            protocol: connection.protocol.clone(),
        })
    }

    /// Creates the unit if missing; true when it was created
    async fn ensure_unit(&self, conn_id: &str, module: &str) -> Result<bool, ManagerError> {
        if self.manager.unit_exists(conn_id).await {
            return Ok(false);
        }
        self.manager
            .create_unit(&UnitSpec::for_connection(conn_id, module))
            .await?;
        Ok(true)
    }

    /// Starts the unit if not active; true when a start was issued
    async fn ensure_started(&self, conn_id: &str) -> Result<bool, ManagerError> {
        if self.manager.is_active(conn_id).await {
            return Ok(false);
        }
        self.manager.start_unit(conn_id).await?;
        Ok(true)
    }

    async fn reload_manager(&self) {
        if let Err(e) = self.manager.reload_manager().await {
            warn!("Service manager reload failed: {}", e);
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.registry.save().await {
            warn!("Cannot persist service registry: {}", e);
        }
    }

    /// Stops and removes the unit; errors are logged, the unit is gone as far as we care
    async fn teardown_unit(&self, conn_id: &str) {
        if let Err(e) = self.manager.stop_unit(conn_id).await {
            warn!(conn_id = %conn_id, "{}", e);
        }
        if let Err(e) = self.manager.remove_unit(conn_id).await {
            warn!(conn_id = %conn_id, "{}", e);
        }
    }

    /// One pass over every enabled connection. Idempotent: against an unchanged
    /// store a second run issues no create or start.
    pub async fn reconcile_startup(&self) -> StartupReport {
        let mut report = StartupReport::default();
        let connections = match self.store.list_enabled_connections() {
            Ok(connections) => connections,
            Err(e) => {
                error!("Startup reconciliation skipped, store unreadable: {}", e);
                return report;
            }
        };
        let wanted: BTreeSet<&str> = connections.iter().map(|c| c.id.as_str()).collect();

        let stale: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|r| r.conn_id)
            .filter(|id| !wanted.contains(id.as_str()))
            .collect();
        for conn_id in &stale {
            info!(conn_id = %conn_id, "No longer enabled, decommissioning");
            self.teardown_unit(conn_id).await;
            self.registry.remove(conn_id);
        }
        report.pruned = stale;

        // create everything first so the manager is reloaded once
        let mut provisioned = Vec::new();
        let mut changed_units = !report.pruned.is_empty();
        for connection in &connections {
            let module = match self.resolve(connection) {
                Ok(module) => module,
                Err(e) => {
                    warn!("{}, skipped", e);
                    report.skipped.push(connection.id.clone());
                    continue;
                }
            };
            let generation = self.registry.register(ServiceRecord::new(connection, module));
            match self.ensure_unit(&connection.id, module).await {
                Ok(created) => {
                    changed_units |= created;
                    provisioned.push((connection.id.clone(), generation));
                }
                Err(e) => {
                    warn!(conn_id = %connection.id, "{}", e);
                    self.registry.commit_active(&connection.id, generation, false);
                    report.failed.push(connection.id.clone());
                }
            }
        }
        if changed_units {
            self.reload_manager().await;
        }

        for (conn_id, generation) in provisioned {
            match self.ensure_started(&conn_id).await {
                Ok(started) => {
                    if !self.registry.commit_active(&conn_id, generation, true) {
                        self.roll_back(&conn_id, started).await;
                        continue;
                    }
                    if started {
                        info!(conn_id = %conn_id, "Connector started");
                        report.started.push(conn_id);
                    } else {
                        debug!(conn_id = %conn_id, "Connector already running");
                        report.already_running.push(conn_id);
                    }
                }
                Err(e) => {
                    warn!(conn_id = %conn_id, "{}", e);
                    self.registry.commit_active(&conn_id, generation, false);
                    report.failed.push(conn_id);
                }
            }
        }
        self.persist().await;

        info!(
            "Startup reconciliation: {} started, {} already running, {} skipped, {} failed, {} pruned",
            report.started.len(),
            report.already_running.len(),
            report.skipped.len(),
            report.failed.len(),
            report.pruned.len()
        );
        report
    }

    pub async fn handle_added(&self, conn_id: &str) -> AddOutcome {
        let connection = match self.store.get_connection(conn_id) {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                warn!(conn_id = %conn_id, "connection_added for a connection absent from the store");
                return AddOutcome::NotInStore;
            }
            Err(e) => {
                error!(conn_id = %conn_id, "Cannot read connection: {}", e);
                return AddOutcome::StoreFailed;
            }
        };
        if !connection.enabled {
            info!(conn_id = %conn_id, "Connection is disabled, nothing to run");
            return AddOutcome::Disabled;
        }
        let module = match self.resolve(&connection) {
            Ok(module) => module,
            Err(e) => {
                warn!("{}, skipped", e);
                return AddOutcome::UnknownProtocol;
            }
        };

        let generation = self.registry.register(ServiceRecord::new(&connection, module));
        let created = match self.ensure_unit(conn_id, module).await {
            Ok(created) => created,
            Err(e) => {
                warn!(conn_id = %conn_id, "{}", e);
                self.registry.commit_active(conn_id, generation, false);
                return AddOutcome::CreateFailed;
            }
        };
        if created {
            self.reload_manager().await;
        }
        if !self.registry.is_current(conn_id, generation) {
            return self.roll_back(conn_id, created).await;
        }

        let started = match self.ensure_started(conn_id).await {
            Ok(started) => started,
            Err(e) => {
                warn!(conn_id = %conn_id, "{}", e);
                self.registry.commit_active(conn_id, generation, false);
                return AddOutcome::StartFailed;
            }
        };
        if !self.registry.commit_active(conn_id, generation, true) {
            return self.roll_back(conn_id, true).await;
        }
        self.persist().await;

        if started {
            info!(conn_id = %conn_id, module, "Connector started");
            AddOutcome::Started
        } else {
            debug!(conn_id = %conn_id, "Connector already running");
            AddOutcome::AlreadyRunning
        }
    }

    /// The record went away (or was re-registered) during provisioning.
    async fn roll_back(&self, conn_id: &str, touched: bool) -> AddOutcome {
        if self.registry.contains(conn_id) {
            // a newer add owns the unit now
            debug!(conn_id = %conn_id, "Superseded by a newer add");
            return AddOutcome::Superseded;
        }
        info!(conn_id = %conn_id, "Removed while provisioning, rolling back the unit");
        if touched {
            self.teardown_unit(conn_id).await;
            self.reload_manager().await;
        }
        AddOutcome::Superseded
    }

    pub async fn handle_removed(&self, conn_id: &str) -> RemoveOutcome {
        let Some(record) = self.registry.remove(conn_id) else {
            warn!(conn_id = %conn_id, "connection_removed for an unmanaged connection");
            return RemoveOutcome::Unknown;
        };
        self.teardown_unit(conn_id).await;
        self.reload_manager().await;
        self.persist().await;
        info!(conn_id = %conn_id, module = %record.module, "Connector removed");
        RemoveOutcome::Removed
    }

    /// Operator-requested restart of one managed unit
    pub async fn handle_restart(&self, conn_id: &str) -> RestartOutcome {
        let Some(record) = self.registry.get(conn_id) else {
            warn!(conn_id = %conn_id, "Restart requested for an unmanaged connection");
            return RestartOutcome::Unknown;
        };
        if let Err(e) = self.manager.stop_unit(conn_id).await {
            debug!(conn_id = %conn_id, "{}", e);
        }
        let outcome = match self.manager.start_unit(conn_id).await {
            Ok(()) => {
                info!(conn_id = %conn_id, "Connector restarted on request");
                RestartOutcome::Restarted
            }
            Err(e) => {
                warn!(conn_id = %conn_id, "{}", e);
                RestartOutcome::Failed
            }
        };
        let active = outcome == RestartOutcome::Restarted;
        self.registry.update(conn_id, |r| {
            if r.generation == record.generation {
                r.active = active;
                r.restart_count = 0;
                r.last_restart = None;
            }
        });
        self.persist().await;
        outcome
    }
}

/// Spawns one task per supervisor topic. Add and remove events are handled
/// on separate tasks and may run concurrently.
pub async fn spawn_listeners(
    bus: Arc<dyn EventBus>,
    reconciler: Arc<Reconciler>,
) -> Result<Vec<JoinHandle<()>>, BusError> {
    let added = bus.subscribe(topics::CONNECTION_ADDED).await?;
    let removed = bus.subscribe(topics::CONNECTION_REMOVED).await?;
    let restart = bus.subscribe(topics::SUPERVISOR_RESTART).await?;

    let r = reconciler.clone();
    let on_added = listen(added, move |id| {
        let r = r.clone();
        async move {
            r.handle_added(&id).await;
        }
    });
    let r = reconciler.clone();
    let on_removed = listen(removed, move |id| {
        let r = r.clone();
        async move {
            r.handle_removed(&id).await;
        }
    });
    let r = reconciler;
    let on_restart = listen(restart, move |id| {
        let r = r.clone();
        async move {
            r.handle_restart(&id).await;
        }
    });
    Ok(vec![on_added, on_removed, on_restart])
}

fn listen<F, Fut>(mut subscription: Subscription, handler: F) -> JoinHandle<()>
where
    F: Fn(String) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(notification) = subscription.recv().await {
            match notification.conn_id() {
                Some(id) => handler(id).await,
                None => warn!(topic = %notification.topic, "Notification without a connection id"),
            }
        }
        debug!("Subscription closed");
    })
}
