/*!
Service manager double that records every call.

Keeps a little unit table (exists / active) so reconciliation can be
asserted on both the calls made and the resulting state.
*/

use async_trait::async_trait;
use conduit_core::{ManagerError, ServiceManager, UnitSpec};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Remove,
    Reload,
}

/// Calls a test can hold back with [`RecordingManager::gate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hold {
    Create,
    Start,
    Remove,
    IsActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerCall {
    pub op: Op,
    /// Empty for `Reload`
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct UnitState {
    pub spec: UnitSpec,
    pub active: bool,
}

#[derive(Default)]
struct Inner {
    units: BTreeMap<String, UnitState>,
    calls: Vec<ManagerCall>,
    failures: HashSet<(Op, String)>,
    gates: HashMap<(Hold, String), Arc<Notify>>,
}

#[derive(Clone, Default)]
pub struct RecordingManager {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ManagerCall> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.inner.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn calls_for(&self, id: &str) -> Vec<Op> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.id == id)
            .map(|c| c.op)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn unit(&self, id: &str) -> Option<UnitState> {
        self.inner.lock().units.get(id).cloned()
    }

    pub fn unit_ids(&self) -> Vec<String> {
        self.inner.lock().units.keys().cloned().collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .units
            .iter()
            .filter(|(_, u)| u.active)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pre-existing unit, as if left over from a previous supervisor run
    pub fn install(&self, spec: UnitSpec, active: bool) {
        self.inner
            .lock()
            .units
            .insert(spec.id.clone(), UnitState { spec, active });
    }

    /// Simulates a crashed process
    pub fn kill(&self, id: &str) {
        if let Some(unit) = self.inner.lock().units.get_mut(id) {
            unit.active = false;
        }
    }

    pub fn fail_on(&self, op: Op, id: &str) {
        self.inner.lock().failures.insert((op, id.to_string()));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().failures.clear();
    }

    /// Blocks the next `hold` call for `id` until the returned handle is notified
    pub fn gate(&self, hold: Hold, id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner
            .lock()
            .gates
            .insert((hold, id.to_string()), gate.clone());
        gate
    }

    pub fn gate_create(&self, id: &str) -> Arc<Notify> {
        self.gate(Hold::Create, id)
    }

    /// True once a call has reached the gate (and is waiting on it, unless released)
    pub fn gate_reached(&self, hold: Hold, id: &str) -> bool {
        !self.inner.lock().gates.contains_key(&(hold, id.to_string()))
    }

    async fn pass(&self, hold: Hold, id: &str) {
        let gate = self.inner.lock().gates.remove(&(hold, id.to_string()));
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn record(&self, op: Op, id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.calls.push(ManagerCall {
            op,
            id: id.to_string(),
        });
        inner.failures.contains(&(op, id.to_string()))
    }
}

#[async_trait]
impl ServiceManager for RecordingManager {
    async fn unit_exists(&self, id: &str) -> bool {
        self.inner.lock().units.contains_key(id)
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ManagerError> {
        self.pass(Hold::Create, &spec.id).await;
        if self.record(Op::Create, &spec.id) {
            return Err(ManagerError::Create {
                id: spec.id.clone(),
                reason: "injected failure".into(),
            });
        }
        self.inner.lock().units.insert(
            spec.id.clone(),
            UnitState {
                spec: spec.clone(),
                active: false,
            },
        );
        Ok(())
    }

    async fn start_unit(&self, id: &str) -> Result<(), ManagerError> {
        self.pass(Hold::Start, id).await;
        if self.record(Op::Start, id) {
            return Err(ManagerError::Start {
                id: id.to_string(),
                reason: "injected failure".into(),
            });
        }
        match self.inner.lock().units.get_mut(id) {
            Some(unit) => {
                unit.active = true;
                Ok(())
            }
            None => Err(ManagerError::Start {
                id: id.to_string(),
                reason: "no such unit".into(),
            }),
        }
    }

    async fn stop_unit(&self, id: &str) -> Result<(), ManagerError> {
        if self.record(Op::Stop, id) {
            return Err(ManagerError::Stop {
                id: id.to_string(),
                reason: "injected failure".into(),
            });
        }
        if let Some(unit) = self.inner.lock().units.get_mut(id) {
            unit.active = false;
        }
        Ok(())
    }

    async fn remove_unit(&self, id: &str) -> Result<(), ManagerError> {
        self.pass(Hold::Remove, id).await;
        if self.record(Op::Remove, id) {
            return Err(ManagerError::Remove {
                id: id.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.inner.lock().units.remove(id);
        Ok(())
    }

    async fn reload_manager(&self) -> Result<(), ManagerError> {
        self.record(Op::Reload, "");
        Ok(())
    }

    async fn is_active(&self, id: &str) -> bool {
        self.pass(Hold::IsActive, id).await;
        self.inner
            .lock()
            .units
            .get(id)
            .map(|u| u.active)
            .unwrap_or(false)
    }
}
