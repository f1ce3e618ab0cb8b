use conduit_core::{BusError, ManagerError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("connection {conn_id}: unknown protocol {protocol}")]
    UnknownProtocol { conn_id: String, protocol: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("registry file: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry format: {0}")]
    Json(#[from] serde_json::Error),
}
