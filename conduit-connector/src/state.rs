use serde::Serialize;
use std::fmt;

/// Connector lifecycle states. PREPARE is initial; there is no terminal state,
/// the process exits from CONFIGURE/PREPARE on fatal errors or after DISCONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Prepare,
    Configure,
    Connect,
    Execute,
    Recover,
    Disconnect,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Prepare,
        LifecycleState::Configure,
        LifecycleState::Connect,
        LifecycleState::Execute,
        LifecycleState::Recover,
        LifecycleState::Disconnect,
    ];

    /// Regular transitions. Shutdown and restart bypass this table and go
    /// straight to DISCONNECT.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Prepare, Configure)
                | (Configure, Connect)
                | (Connect, Execute)
                | (Connect, Recover)
                | (Execute, Configure)
                | (Execute, Recover)
                | (Recover, Execute)
                | (Recover, Disconnect)
                | (Disconnect, Connect)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Prepare => "PREPARE",
            LifecycleState::Configure => "CONFIGURE",
            LifecycleState::Connect => "CONNECT",
            LifecycleState::Execute => "EXECUTE",
            LifecycleState::Recover => "RECOVER",
            LifecycleState::Disconnect => "DISCONNECT",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
