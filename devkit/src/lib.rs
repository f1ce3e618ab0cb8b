/*!
# Conduit DevKit - test doubles for connectors and the supervisor

- In-memory event bus (no broker needed)
- Recording service manager with failure injection
- Scripted protocol hooks with a call journal
- Record fixtures and a test harness
*/

pub mod fixtures;
pub mod harness;
pub mod memory_bus;
pub mod recording_manager;
pub mod scripted;

pub use harness::{wait_until, within, TestHarness};
pub use memory_bus::MemoryBus;
pub use recording_manager::{Hold, ManagerCall, Op, RecordingManager};
pub use scripted::{HookCall, ScriptControl, ScriptedProtocol, ScriptedTransport};
