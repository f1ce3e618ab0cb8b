//! Conduit core - shared building blocks for connector processes and the supervisor
//!
//! Provides:
//! - The data model read from the configuration store (connections, blocks, tag mappings)
//! - The configuration store adapter (`ConfigStore`, SQLite and in-memory implementations)
//! - The event bus adapter (`EventBus`, MQTT implementation, topic names)
//! - The process/service manager interface used by the supervisor
//! - Shared YAML configuration and logging bootstrap

pub mod bus;
pub mod config;
pub mod logging;
pub mod models;
pub mod service;
pub mod store;

pub use bus::{topics, BusError, EventBus, Notification, Subscription};
pub use config::{load_config, ConduitConfig};
pub use models::{
    BlockDescriptor, ConnectionDescriptor, Direction, PropertyMap, TagMapping, TransportParams,
    TriggerMode,
};
pub use service::{ManagerError, ServiceManager, UnitSpec};
pub use store::{ConfigStore, StoreError};
