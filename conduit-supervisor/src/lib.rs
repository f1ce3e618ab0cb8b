//! Conduit supervisor - keeps the fleet of connector units converged with the store
//!
//! - `reconciler`: startup pass and add/remove/restart event handling
//! - `registry`: ServiceRecords, persisted as JSON
//! - `systemd`: `ServiceManager` over unit files and systemctl
//! - `health`: dead-unit restarts and the status topic

pub mod error;
pub mod health;
pub mod modules;
pub mod reconciler;
pub mod registry;
pub mod systemd;

pub use error::SupervisorError;
pub use health::{healthcheck, HealthAction, RestartPolicy};
pub use modules::resolve_module;
pub use reconciler::{
    spawn_listeners, AddOutcome, Reconciler, RemoveOutcome, RestartOutcome, StartupReport,
};
pub use registry::{ServiceRecord, ServiceRegistry};
pub use systemd::SystemdManager;
