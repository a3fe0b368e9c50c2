//! VM power states as reported by the hypervisor

use serde::{Deserialize, Serialize};

/// Power state of a VM definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// No state reported yet (definition exists, never started)
    #[default]
    NoState,
    Running,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
}

impl PowerState {
    pub fn is_running(&self) -> bool {
        matches!(self, PowerState::Running)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, PowerState::Shutdown | PowerState::NoState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_predicates() {
        assert!(PowerState::Running.is_running());
        assert!(!PowerState::Paused.is_running());
        assert!(PowerState::Shutdown.is_shutdown());
        assert!(PowerState::NoState.is_shutdown());
        assert!(!PowerState::Running.is_shutdown());
    }
}
