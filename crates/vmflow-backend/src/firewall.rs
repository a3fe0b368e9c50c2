//! Packet-filtering capability
//!
//! Filtering is an optional backend capability: a driver that does not
//! implement it reports `NotSupported` and the workflows move on. The
//! tri-state outcome keeps that branch in data instead of in error
//! identity.

use async_trait::async_trait;
use vmflow_types::{InstanceSpec, NetworkInterface};

/// Outcome of invoking an optional backend capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutcome {
    /// The capability is implemented and the call succeeded
    Applied,

    /// The capability is implemented but the call failed
    Failed(String),

    /// The backend does not implement this capability
    NotSupported,
}

impl CapabilityOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CapabilityOutcome::Applied)
    }
}

/// Firewall driver surface for an instance's interfaces
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Install baseline anti-spoofing rules for the interfaces
    async fn setup_basic_filtering(
        &self,
        spec: &InstanceSpec,
        vifs: &[NetworkInterface],
    ) -> CapabilityOutcome;

    /// Stage the instance's security-group rules
    async fn prepare_instance_filter(
        &self,
        spec: &InstanceSpec,
        vifs: &[NetworkInterface],
    ) -> CapabilityOutcome;

    /// Activate the staged rules once the instance is running
    async fn apply_instance_filter(&self, spec: &InstanceSpec) -> CapabilityOutcome;

    /// Remove all rules for the instance
    async fn remove_instance_filter(&self, spec: &InstanceSpec) -> CapabilityOutcome;
}
