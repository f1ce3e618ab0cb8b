/*!
CONDUIT SUPERVISOR - entry point

ROLE:
Bootstraps store, bus and systemd adapter, subscribes to the fleet topics,
runs the startup reconciliation, then serves events until SIGTERM/Ctrl-C.

Connector units are owned by systemd and keep running after we exit.
*/

use anyhow::Context;
use conduit_core::bus::MqttBus;
use conduit_core::logging::init_logging;
use conduit_core::store::SqliteStore;
use conduit_core::{load_config, topics, ConfigStore, EventBus, ServiceManager};
use conduit_supervisor::health::{spawn_health_monitor, spawn_status_publisher};
use conduit_supervisor::{spawn_listeners, Reconciler, RestartPolicy, ServiceRegistry, SystemdManager};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info");
    let config = load_config().await;
    let settings = &config.supervisor;

    let store: Arc<dyn ConfigStore> = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .with_context(|| format!("opening store {}", config.store.db_path.display()))?,
    );
    let manager: Arc<dyn ServiceManager> =
        Arc::new(SystemdManager::from_settings(settings).context("service manager")?);

    let registry = ServiceRegistry::at_path(&settings.registry_path);
    if let Err(e) = registry.load().await {
        warn!("Ignoring unreadable service registry: {}", e);
    }

    let client_id = format!("conduit-supervisor-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let bus: Arc<dyn EventBus> = Arc::new(MqttBus::connect(&config.mqtt, &client_id));

    let reconciler = Arc::new(Reconciler::new(store, manager.clone(), registry.clone()));
    // subscribed before the startup pass so nothing published meanwhile is lost
    let listeners = spawn_listeners(bus.clone(), reconciler.clone())
        .await
        .context("subscribing to supervisor topics")?;
    let list_requests = bus
        .subscribe(topics::SUPERVISOR_LIST)
        .await
        .context("subscribing to the list command")?;

    reconciler.reconcile_startup().await;

    let monitor = spawn_health_monitor(
        registry.clone(),
        manager,
        RestartPolicy::from(settings),
        settings.healthcheck_interval,
    );
    let publisher = spawn_status_publisher(
        bus.clone(),
        registry.clone(),
        list_requests,
        settings.status_interval,
    );

    wait_for_shutdown().await;
    info!("Supervisor stopping, {} connector unit(s) keep running", registry.len());

    monitor.abort();
    publisher.abort();
    for listener in listeners {
        listener.abort();
    }
    if let Err(e) = registry.save().await {
        warn!("Cannot persist service registry: {}", e);
    }
    bus.close().await;
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot install SIGTERM handler: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
