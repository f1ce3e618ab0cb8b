use crate::state::LifecycleState;
use conduit_core::{BusError, StoreError};
use std::fmt::Display;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("connection {0} not found in the configuration store")]
    ConfigurationNotFound(String),
    #[error("malformed configuration for {conn_id}: {reason}")]
    ConfigurationMalformed { conn_id: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("connection {conn_id} is already served by pid {pid}")]
    AlreadyRunning { conn_id: String, pid: i32 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("execution fault: {0}")]
    Execution(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectorError {
    pub fn malformed(conn_id: &str, reason: impl Display) -> Self {
        ConnectorError::ConfigurationMalformed {
            conn_id: conn_id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(reason: impl Display) -> Self {
        ConnectorError::Transport(reason.to_string())
    }

    pub fn execution(reason: impl Display) -> Self {
        ConnectorError::Execution(reason.to_string())
    }

    /// Fatal errors end the process with a nonzero status; the rest go through RECOVER
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ConnectorError::Transport(_) | ConnectorError::Execution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!ConnectorError::transport("refused").is_fatal());
        assert!(!ConnectorError::execution("timeout").is_fatal());
        assert!(ConnectorError::ConfigurationNotFound("x".into()).is_fatal());
        assert!(ConnectorError::malformed("x", "bad port").is_fatal());
        assert!(ConnectorError::Store(StoreError::Unavailable("locked".into())).is_fatal());
    }
}
