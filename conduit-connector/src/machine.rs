//! Connector lifecycle machine.
//!
//! PREPARE -> CONFIGURE -> CONNECT -> EXECUTE, with RECOVER on faults and a
//! hot-reload loop EXECUTE -> CONFIGURE -> CONNECT -> EXECUTE that keeps the
//! transport open. Control requests are observed only at cycle boundaries and
//! wait points, never in the middle of a protocol exchange.

use crate::error::ConnectorError;
use crate::hooks::{ConfigSnapshot, ProtocolHooks, Recovery};
use crate::session::SessionGuard;
use crate::signals::ControlSignals;
use crate::state::LifecycleState;
use crate::stats::{SharedStats, Stats};
use conduit_core::config::ConnectorSettings;
use conduit_core::{ConfigStore, TransportParams};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the machine ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Orderly shutdown request
    Shutdown,
    /// Connection info changed; the process manager relaunches us with the new parameters
    Restart,
}

#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub execute_interval: Duration,
    pub default_retry: Duration,
    pub exception_limit: u32,
    /// Session lock directory; `None` disables the lock file
    pub runtime_dir: Option<PathBuf>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self::from(&ConnectorSettings::default())
    }
}

impl From<&ConnectorSettings> for MachineOptions {
    fn from(settings: &ConnectorSettings) -> Self {
        Self {
            execute_interval: settings.execute_interval,
            default_retry: settings.default_retry,
            exception_limit: settings.exception_limit,
            runtime_dir: Some(settings.runtime_dir.clone()),
        }
    }
}

enum Step {
    Goto(LifecycleState),
    /// Shutdown or restart: straight to DISCONNECT whatever the table says
    Teardown,
    Exit(Exit),
    /// Unrecoverable error raised by a hook; RECOVER is skipped
    Fail(ConnectorError),
}

pub struct LifecycleMachine<P: ProtocolHooks> {
    conn_id: String,
    store: Arc<dyn ConfigStore>,
    signals: Arc<ControlSignals>,
    hooks: P,
    options: MachineOptions,

    state: LifecycleState,
    state_tx: watch::Sender<LifecycleState>,
    stats: SharedStats,

    snapshot: Option<ConfigSnapshot>,
    transport: Option<P::Transport>,
    transport_params: Option<TransportParams>,
    session_ready: bool,
    configured_once: bool,
    session: Option<SessionGuard>,
    last_fault: Option<ConnectorError>,
    logged: HashSet<&'static str>,
}

impl<P: ProtocolHooks> LifecycleMachine<P> {
    pub fn new(
        conn_id: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        signals: Arc<ControlSignals>,
        hooks: P,
        options: MachineOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Prepare);
        Self {
            conn_id: conn_id.into(),
            store,
            signals,
            hooks,
            options,
            state: LifecycleState::Prepare,
            state_tx,
            stats: Arc::new(Mutex::new(Stats::default())),
            snapshot: None,
            transport: None,
            transport_params: None,
            session_ready: false,
            configured_once: false,
            session: None,
            last_fault: None,
            logged: HashSet::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Follows state changes from another task
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    pub fn signals(&self) -> Arc<ControlSignals> {
        self.signals.clone()
    }

    pub fn hooks(&self) -> &P {
        &self.hooks
    }

    /// Drives the machine until shutdown, restart or a fatal error.
    ///
    /// Fatal errors leave directly without going through DISCONNECT; the
    /// transport and the session lock are dropped with the machine.
    pub async fn run(&mut self) -> Result<Exit, ConnectorError> {
        self.stats.lock().record_entry(LifecycleState::Prepare);
        self.state_tx.send_replace(LifecycleState::Prepare);

        loop {
            if self.state != LifecycleState::Disconnect && self.signals.stop_requested() {
                self.force(LifecycleState::Disconnect);
            }

            let step = match self.state {
                LifecycleState::Prepare => self.prepare().await?,
                LifecycleState::Configure => self.configure().await?,
                LifecycleState::Connect => self.connect().await,
                LifecycleState::Execute => self.execute().await,
                LifecycleState::Recover => self.recover().await,
                LifecycleState::Disconnect => self.disconnect().await,
            };

            match step {
                Step::Goto(next) => self.transition(next)?,
                Step::Teardown => self.force(LifecycleState::Disconnect),
                Step::Exit(exit) => {
                    self.session = None;
                    info!(
                        conn_id = %self.conn_id,
                        "Connector exiting ({:?}): {:?}",
                        exit,
                        self.stats.lock().summary()
                    );
                    return Ok(exit);
                }
                Step::Fail(e) => return Err(e),
            }
        }
    }

    fn transition(&mut self, next: LifecycleState) -> Result<(), ConnectorError> {
        if !self.state.can_transition_to(next) {
            return Err(ConnectorError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.enter(next);
        Ok(())
    }

    fn force(&mut self, next: LifecycleState) {
        debug!(conn_id = %self.conn_id, "Forcing {} -> {}", self.state, next);
        self.enter(next);
    }

    fn enter(&mut self, next: LifecycleState) {
        debug!(conn_id = %self.conn_id, from = %self.state, to = %next, "transition");
        self.state = next;
        self.stats.lock().record_entry(next);
        self.state_tx.send_replace(next);
    }

    /// Logs a stage once per success streak
    fn once(&mut self, stage: &'static str) {
        if self.logged.insert(stage) {
            info!(conn_id = %self.conn_id, "{}", stage);
        }
    }

    async fn prepare(&mut self) -> Result<Step, ConnectorError> {
        let snapshot = ConfigSnapshot::fetch(self.store.clone(), &self.conn_id).await?;
        self.hooks.prepare(&snapshot).await?;
        self.snapshot = Some(snapshot);
        self.once("prepared");
        Ok(Step::Goto(LifecycleState::Configure))
    }

    async fn configure(&mut self) -> Result<Step, ConnectorError> {
        let snapshot = ConfigSnapshot::fetch(self.store.clone(), &self.conn_id).await?;
        if snapshot.connection.protocol != self.hooks.protocol() {
            return Err(ConnectorError::malformed(
                &self.conn_id,
                format!(
                    "protocol '{}' is not served by this module ('{}')",
                    snapshot.connection.protocol,
                    self.hooks.protocol()
                ),
            ));
        }
        let params = snapshot.connection.transport_params();

        if !self.configured_once {
            if self.transport.is_some() {
                return Err(ConnectorError::AlreadyRunning {
                    conn_id: self.conn_id.clone(),
                    pid: std::process::id() as i32,
                });
            }
            if let Some(dir) = &self.options.runtime_dir {
                self.session = Some(SessionGuard::acquire(dir, &self.conn_id)?);
            }
            self.signals.pin_baseline(params.clone());
        } else {
            let current = self
                .transport_params
                .as_ref()
                .or_else(|| self.signals.baseline());
            if current.is_some_and(|open| *open != params) {
                info!(conn_id = %self.conn_id, "Connection info changed, restarting");
                self.signals.request_restart();
                return Ok(Step::Teardown);
            }
        }

        self.hooks.configure(&snapshot).await?;
        self.snapshot = Some(snapshot);
        self.configured_once = true;
        self.once("configured");
        Ok(Step::Goto(LifecycleState::Connect))
    }

    async fn connect(&mut self) -> Step {
        let Some(connection) = self.snapshot.as_ref().map(|s| s.connection.clone()) else {
            return self.fault(ConnectorError::ConfigurationNotFound(self.conn_id.clone()));
        };

        if self.transport.is_none() {
            match self.hooks.open_transport(&connection).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.transport_params = Some(connection.transport_params());
                    self.session_ready = false;
                    self.stats.lock().transport_opens += 1;
                    debug!(conn_id = %self.conn_id, "Transport open to {}", connection.endpoint());
                }
                Err(e) => return self.fault(e),
            }
        }

        let Some(transport) = self.transport.as_mut() else {
            return self.fault(ConnectorError::transport("transport missing after open"));
        };
        match self.hooks.connect(transport).await {
            Ok(()) => {
                self.session_ready = true;
                self.once("connected");
                Step::Goto(LifecycleState::Execute)
            }
            Err(e) => {
                self.session_ready = false;
                self.fault(e)
            }
        }
    }

    async fn execute(&mut self) -> Step {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return self.fault(ConnectorError::transport("no open transport"));
            };

            let started = Instant::now();
            if let Err(e) = self.hooks.execute(transport).await {
                return self.fault(e);
            }
            self.stats.lock().record_cycle(started.elapsed());
            self.logged.remove("recovering");
            self.once("executing");

            if let Some(step) = self.boundary() {
                return step;
            }
            self.signals.wait(self.options.execute_interval).await;
            if let Some(step) = self.boundary() {
                return step;
            }
        }
    }

    /// Control requests seen between two work cycles
    fn boundary(&self) -> Option<Step> {
        if self.signals.stop_requested() {
            return Some(Step::Teardown);
        }
        if self.signals.take_reconfigure() {
            debug!(conn_id = %self.conn_id, "Reconfiguration requested");
            return Some(Step::Goto(LifecycleState::Configure));
        }
        None
    }

    fn fault(&mut self, error: ConnectorError) -> Step {
        if error.is_fatal() {
            error!(conn_id = %self.conn_id, state = %self.state, "Fatal: {}", error);
            return Step::Fail(error);
        }
        let streak = self.stats.lock().record_fault();
        if streak <= self.options.exception_limit {
            warn!(conn_id = %self.conn_id, state = %self.state, "Fault: {}", error);
        } else {
            debug!(conn_id = %self.conn_id, state = %self.state, streak, "Fault: {}", error);
        }
        self.logged.remove("connected");
        self.logged.remove("executing");
        self.last_fault = Some(error);
        Step::Goto(LifecycleState::Recover)
    }

    async fn recover(&mut self) -> Step {
        self.once("recovering");
        let backoff = self
            .snapshot
            .as_ref()
            .map(|s| s.connection.retry_interval())
            .filter(|d| !d.is_zero())
            .unwrap_or(self.options.default_retry);
        self.signals.backoff(backoff).await;
        if self.signals.stop_requested() {
            return Step::Teardown;
        }

        let fault = self
            .last_fault
            .take()
            .unwrap_or_else(|| ConnectorError::execution("unspecified fault"));
        let decision = self.hooks.recover(self.transport.as_mut(), &fault).await;
        if decision == Recovery::Resume && self.transport.is_some() && self.session_ready {
            debug!(conn_id = %self.conn_id, "Resuming on the open transport");
            Step::Goto(LifecycleState::Execute)
        } else {
            Step::Goto(LifecycleState::Disconnect)
        }
    }

    async fn disconnect(&mut self) -> Step {
        let transport = self.transport.take();
        self.transport_params = None;
        self.session_ready = false;
        self.hooks.disconnect(transport).await;

        if self.signals.shutdown_requested() {
            Step::Exit(Exit::Shutdown)
        } else if self.signals.restart_requested() {
            Step::Exit(Exit::Restart)
        } else {
            Step::Goto(LifecycleState::Connect)
        }
    }
}
