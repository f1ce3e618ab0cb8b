//! Process bootstrap shared by every connector binary.

use crate::cli::ConnectorArgs;
use crate::controller::ReconfigController;
use crate::error::ConnectorError;
use crate::hooks::ProtocolHooks;
use crate::machine::{Exit, LifecycleMachine, MachineOptions};
use crate::signals::{spawn_signal_listener, ControlSignals};
use anyhow::Context;
use clap::Parser;
use conduit_core::bus::MqttBus;
use conduit_core::logging::{init_logging, level_for};
use conduit_core::store::SqliteStore;
use conduit_core::{load_config, topics, ConduitConfig, ConfigStore, EventBus};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Process-wide handles, built once in `main` and released on exit
pub struct ConnectorContext {
    pub args: ConnectorArgs,
    pub config: ConduitConfig,
    pub store: Arc<dyn ConfigStore>,
    pub bus: Arc<dyn EventBus>,
}

impl ConnectorContext {
    pub async fn bootstrap(args: ConnectorArgs) -> anyhow::Result<Self> {
        let mut config = load_config().await;
        config.mqtt.clean_session = args.clean;

        let store = SqliteStore::open(&config.store.db_path)
            .with_context(|| format!("opening store {}", config.store.db_path.display()))?;
        let client_id = format!(
            "conduit-{}-{}",
            args.conn_id,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let bus = MqttBus::connect(&config.mqtt, &client_id);

        Ok(Self {
            args,
            config,
            store: Arc::new(store),
            bus: Arc::new(bus),
        })
    }

    pub async fn release(self) {
        self.bus.close().await;
    }
}

/// Wires controller, signal handling and lifecycle machine around `hooks`
pub async fn run_connector<P: ProtocolHooks>(
    ctx: &ConnectorContext,
    hooks: P,
) -> Result<Exit, ConnectorError> {
    let conn_id = ctx.args.conn_id.clone();
    let signals = Arc::new(ControlSignals::new());

    let reloads = ctx.bus.subscribe(&topics::config_reload(&conn_id)).await?;
    let controller =
        ReconfigController::new(conn_id.clone(), ctx.store.clone(), signals.clone()).spawn(reloads);
    let listener = spawn_signal_listener(signals.clone());

    let mut machine = LifecycleMachine::new(
        conn_id,
        ctx.store.clone(),
        signals,
        hooks,
        MachineOptions::from(&ctx.config.connector),
    );
    let result = machine.run().await;

    controller.abort();
    listener.abort();
    result
}

/// Shutdown and connection-info restart are both successes for the process manager
pub fn exit_code(result: &Result<Exit, ConnectorError>) -> u8 {
    match result {
        Ok(Exit::Shutdown) | Ok(Exit::Restart) => 0,
        Err(_) => 1,
    }
}

/// Entry point for connector binaries
pub fn launch<P, F>(make_hooks: F) -> ExitCode
where
    P: ProtocolHooks,
    F: FnOnce(&ConnectorArgs) -> P,
{
    let args = ConnectorArgs::parse();
    init_logging(level_for(args.verbose));

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        info!("Connector starting for {}", args.conn_id);
        let hooks = make_hooks(&args);
        let ctx = match ConnectorContext::bootstrap(args).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("Bootstrap failed: {:#}", e);
                return ExitCode::FAILURE;
            }
        };

        let result = run_connector(&ctx, hooks).await;
        match &result {
            Ok(exit) => info!("Connector stopped: {:?}", exit),
            Err(e) => error!("Connector failed: {}", e),
        }
        ctx.release().await;
        ExitCode::from(exit_code(&result))
    })
}
