/*!
Scripted protocol hooks.

A protocol implementation with no real I/O: every hook call is journaled and
failures can be queued from the test through a [`ScriptControl`] handle.
*/

use async_trait::async_trait;
use conduit_connector::{ConfigSnapshot, ConnectorError, ProtocolHooks, Recovery};
use conduit_core::{ConnectionDescriptor, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;

/// Transport handed out by [`ScriptedProtocol`]; `id` identifies each open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedTransport {
    pub id: u64,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Prepare,
    Configure { blocks: usize },
    Open { transport: u64, host: Option<String> },
    Connect { transport: u64 },
    Execute { transport: u64 },
    Recover { transport: Option<u64> },
    Disconnect { transport: Option<u64> },
}

#[derive(Default)]
struct Script {
    journal: Vec<HookCall>,
    next_transport: u64,
    open_failures: u32,
    connect_failures: u32,
    execute_failures: u32,
    execute_store_outage: Option<String>,
    fail_configure: bool,
    recovery: Option<Recovery>,
}

/// Test-side handle on a running [`ScriptedProtocol`]
#[derive(Clone, Default)]
pub struct ScriptControl {
    script: Arc<Mutex<Script>>,
}

impl ScriptControl {
    pub fn journal(&self) -> Vec<HookCall> {
        self.script.lock().journal.clone()
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&HookCall) -> bool,
    {
        self.script.lock().journal.iter().filter(|c| pred(c)).count()
    }

    pub fn configures(&self) -> usize {
        self.count(|c| matches!(c, HookCall::Configure { .. }))
    }

    pub fn opens(&self) -> usize {
        self.count(|c| matches!(c, HookCall::Open { .. }))
    }

    pub fn executes(&self) -> usize {
        self.count(|c| matches!(c, HookCall::Execute { .. }))
    }

    /// Transport ids used by execute cycles, in order
    pub fn executed_on(&self) -> Vec<u64> {
        self.script
            .lock()
            .journal
            .iter()
            .filter_map(|c| match c {
                HookCall::Execute { transport } => Some(*transport),
                _ => None,
            })
            .collect()
    }

    pub fn last_open_host(&self) -> Option<String> {
        self.script.lock().journal.iter().rev().find_map(|c| match c {
            HookCall::Open { host, .. } => host.clone(),
            _ => None,
        })
    }

    pub fn fail_opens(&self, n: u32) {
        self.script.lock().open_failures = n;
    }

    pub fn fail_connects(&self, n: u32) {
        self.script.lock().connect_failures = n;
    }

    pub fn fail_executes(&self, n: u32) {
        self.script.lock().execute_failures = n;
    }

    /// Next execute cycle reports a store outage instead of a device fault
    pub fn break_store_on_execute(&self, reason: &str) {
        self.script.lock().execute_store_outage = Some(reason.to_string());
    }

    pub fn fail_configure(&self, fail: bool) {
        self.script.lock().fail_configure = fail;
    }

    /// Decision returned by the recover hook (default: reconnect)
    pub fn recover_with(&self, recovery: Recovery) {
        self.script.lock().recovery = Some(recovery);
    }
}

pub struct ScriptedProtocol {
    protocol: String,
    control: ScriptControl,
}

impl ScriptedProtocol {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            control: ScriptControl::default(),
        }
    }

    pub fn control(&self) -> ScriptControl {
        self.control.clone()
    }

    fn log(&self, call: HookCall) {
        self.control.script.lock().journal.push(call);
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl ProtocolHooks for ScriptedProtocol {
    type Transport = ScriptedTransport;

    fn protocol(&self) -> &str {
        &self.protocol
    }

    async fn prepare(&mut self, _snapshot: &ConfigSnapshot) -> Result<(), ConnectorError> {
        self.log(HookCall::Prepare);
        Ok(())
    }

    async fn configure(&mut self, snapshot: &ConfigSnapshot) -> Result<(), ConnectorError> {
        self.log(HookCall::Configure {
            blocks: snapshot.enabled_blocks().count(),
        });
        if self.control.script.lock().fail_configure {
            return Err(ConnectorError::malformed(
                &snapshot.connection.id,
                "scripted configure failure",
            ));
        }
        Ok(())
    }

    async fn open_transport(
        &mut self,
        connection: &ConnectionDescriptor,
    ) -> Result<ScriptedTransport, ConnectorError> {
        let mut script = self.control.script.lock();
        if take_failure(&mut script.open_failures) {
            return Err(ConnectorError::transport("scripted open failure"));
        }
        script.next_transport += 1;
        let transport = ScriptedTransport {
            id: script.next_transport,
            host: connection.host.clone(),
            port: connection.port,
        };
        script.journal.push(HookCall::Open {
            transport: transport.id,
            host: transport.host.clone(),
        });
        Ok(transport)
    }

    async fn connect(&mut self, transport: &mut ScriptedTransport) -> Result<(), ConnectorError> {
        let mut script = self.control.script.lock();
        script.journal.push(HookCall::Connect {
            transport: transport.id,
        });
        if take_failure(&mut script.connect_failures) {
            return Err(ConnectorError::transport("scripted handshake failure"));
        }
        Ok(())
    }

    async fn execute(&mut self, transport: &mut ScriptedTransport) -> Result<(), ConnectorError> {
        let mut script = self.control.script.lock();
        script.journal.push(HookCall::Execute {
            transport: transport.id,
        });
        if let Some(reason) = script.execute_store_outage.take() {
            return Err(StoreError::Unavailable(reason).into());
        }
        if take_failure(&mut script.execute_failures) {
            return Err(ConnectorError::execution("scripted execute failure"));
        }
        Ok(())
    }

    async fn recover(
        &mut self,
        transport: Option<&mut ScriptedTransport>,
        _fault: &ConnectorError,
    ) -> Recovery {
        let mut script = self.control.script.lock();
        script.journal.push(HookCall::Recover {
            transport: transport.map(|t| t.id),
        });
        script.recovery.unwrap_or(Recovery::Reconnect)
    }

    async fn disconnect(&mut self, transport: Option<ScriptedTransport>) {
        self.log(HookCall::Disconnect {
            transport: transport.map(|t| t.id),
        });
    }
}
