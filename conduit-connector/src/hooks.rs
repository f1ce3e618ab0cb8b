//! Protocol extension point.
//!
//! A protocol module implements [`ProtocolHooks`]; the lifecycle machine owns
//! the transport and calls the hooks at each state.

use crate::error::ConnectorError;
use async_trait::async_trait;
use conduit_core::{BlockDescriptor, ConfigStore, ConnectionDescriptor, TagMapping};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Full configuration of one connection, re-read from the store on every CONFIGURE
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub connection: ConnectionDescriptor,
    pub blocks: Vec<BlockDescriptor>,
    /// Tag mappings keyed by block id
    pub tags: BTreeMap<String, Vec<TagMapping>>,
}

impl ConfigSnapshot {
    pub fn load(store: &dyn ConfigStore, conn_id: &str) -> Result<Self, ConnectorError> {
        let connection = store
            .get_connection(conn_id)?
            .ok_or_else(|| ConnectorError::ConfigurationNotFound(conn_id.to_string()))?;
        let blocks = store.list_blocks(conn_id)?;
        let mut tags = BTreeMap::new();
        for block in &blocks {
            tags.insert(block.id.clone(), store.list_tag_mappings(&block.id)?);
        }
        Ok(Self {
            connection,
            blocks,
            tags,
        })
    }

    /// [`ConfigSnapshot::load`] on the blocking pool, so a locked database
    /// does not stall the runtime thread
    pub async fn fetch(store: Arc<dyn ConfigStore>, conn_id: &str) -> Result<Self, ConnectorError> {
        let conn_id = conn_id.to_string();
        tokio::task::spawn_blocking(move || Self::load(store.as_ref(), &conn_id))
            .await
            .map_err(|e| ConnectorError::Io(std::io::Error::other(e)))?
    }

    pub fn enabled_blocks(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.blocks.iter().filter(|b| b.enabled)
    }

    pub fn tags_for(&self, block_id: &str) -> &[TagMapping] {
        self.tags.get(block_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// What RECOVER does once the backoff has elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The fault was transient; keep the transport and go back to EXECUTE
    Resume,
    /// Release the transport and acquire a fresh one
    Reconnect,
}

#[async_trait]
pub trait ProtocolHooks: Send {
    type Transport: Send;

    /// Protocol code served by this module (ex: "mtc")
    fn protocol(&self) -> &str;

    /// Called once after the first configuration load
    async fn prepare(&mut self, _snapshot: &ConfigSnapshot) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// Parses protocol-specific properties. Any error is fatal.
    async fn configure(&mut self, snapshot: &ConfigSnapshot) -> Result<(), ConnectorError>;

    async fn open_transport(
        &mut self,
        connection: &ConnectionDescriptor,
    ) -> Result<Self::Transport, ConnectorError>;

    /// Session work on top of an open transport; runs on every CONNECT entry
    async fn connect(&mut self, _transport: &mut Self::Transport) -> Result<(), ConnectorError> {
        Ok(())
    }

    /// One bounded read/write pass
    async fn execute(&mut self, transport: &mut Self::Transport) -> Result<(), ConnectorError>;

    async fn recover(
        &mut self,
        _transport: Option<&mut Self::Transport>,
        _fault: &ConnectorError,
    ) -> Recovery {
        Recovery::Reconnect
    }

    async fn disconnect(&mut self, transport: Option<Self::Transport>);
}
