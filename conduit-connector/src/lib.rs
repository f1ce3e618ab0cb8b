//! Conduit connector runtime
//!
//! Everything a protocol module needs to become a connector process:
//! - `LifecycleMachine`: PREPARE/CONFIGURE/CONNECT/EXECUTE/RECOVER/DISCONNECT
//! - `ProtocolHooks`: the per-protocol extension point
//! - `ReconfigController`: hot reload vs restart on `system/{id}/config_reload`
//! - `launch`: CLI, logging, store and bus bootstrap, exit codes

pub mod cli;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod launch;
pub mod machine;
pub mod session;
pub mod signals;
pub mod state;
pub mod stats;

pub use cli::ConnectorArgs;
pub use controller::{ChangeKind, ReconfigController};
pub use error::ConnectorError;
pub use hooks::{ConfigSnapshot, ProtocolHooks, Recovery};
pub use launch::{launch, run_connector, ConnectorContext};
pub use machine::{Exit, LifecycleMachine, MachineOptions};
pub use signals::ControlSignals;
pub use state::LifecycleState;
pub use stats::Stats;
