/*!
Test harness.

Bundles the in-memory store, bus and service manager, plus a scratch
directory for session locks, registries and unit files.
*/

use crate::memory_bus::MemoryBus;
use crate::recording_manager::RecordingManager;
use anyhow::Result;
use conduit_connector::{ConnectorArgs, ConnectorContext, MachineOptions};
use conduit_core::store::MemoryStore;
use conduit_core::ConduitConfig;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct TestHarness {
    pub store: MemoryStore,
    pub bus: MemoryBus,
    pub manager: RecordingManager,
    scratch: tempfile::TempDir,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(store: MemoryStore) -> Result<Self> {
        conduit_core::logging::init_logging("debug");
        Ok(Self {
            store,
            bus: MemoryBus::new(),
            manager: RecordingManager::new(),
            scratch: tempfile::tempdir()?,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.scratch.path().join("run")
    }

    /// Configuration pointing every path into the scratch directory
    pub fn config(&self) -> ConduitConfig {
        let mut config = ConduitConfig::default();
        config.store.db_path = self.scratch.path().join("edge.db");
        config.connector.runtime_dir = self.runtime_dir();
        config.connector.execute_interval = Duration::from_millis(100);
        config.supervisor.unit_dir = self.scratch.path().join("units");
        config.supervisor.bin_dir = self.scratch.path().join("bin");
        config.supervisor.registry_path = self.scratch.path().join("services.json");
        config
    }

    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions::from(&self.config().connector)
    }

    /// Connector context over the in-memory store and bus
    pub fn connector_context(&self, conn_id: &str) -> ConnectorContext {
        ConnectorContext {
            args: ConnectorArgs {
                conn_id: conn_id.to_string(),
                clean: false,
                verbose: true,
            },
            config: self.config(),
            store: Arc::new(self.store.clone()),
            bus: Arc::new(self.bus.clone()),
        }
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Awaits `fut` with a timeout, failing the test with `what` when it does not complete
pub async fn within<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {what}"))
}
