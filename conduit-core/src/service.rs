//! Process/service manager interface.
//!
//! The supervisor only talks to the host service manager through this trait;
//! a real implementation drives systemd, tests record the calls.

use async_trait::async_trait;

/// What a unit runs: one connector module for one connection id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub id: String,
    /// Executable name of the connector module (ex: "conduit-modbus-tcp")
    pub module: String,
    pub args: Vec<String>,
}

impl UnitSpec {
    pub fn for_connection(id: &str, module: &str) -> Self {
        Self {
            id: id.to_string(),
            module: module.to_string(),
            args: vec![format!("--conn-id={id}")],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("cannot create unit for {id}: {reason}")]
    Create { id: String, reason: String },
    #[error("cannot start unit for {id}: {reason}")]
    Start { id: String, reason: String },
    #[error("cannot stop unit for {id}: {reason}")]
    Stop { id: String, reason: String },
    #[error("cannot remove unit for {id}: {reason}")]
    Remove { id: String, reason: String },
    #[error("service manager command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn unit_exists(&self, id: &str) -> bool;

    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ManagerError>;

    async fn start_unit(&self, id: &str) -> Result<(), ManagerError>;

    async fn stop_unit(&self, id: &str) -> Result<(), ManagerError>;

    async fn remove_unit(&self, id: &str) -> Result<(), ManagerError>;

    /// Makes the manager pick up created or removed unit definitions
    async fn reload_manager(&self) -> Result<(), ManagerError>;

    async fn is_active(&self, id: &str) -> bool;
}
