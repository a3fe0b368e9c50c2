//! Durable instance record store

use crate::error::Result;
use async_trait::async_trait;
use vmflow_types::VmMode;

/// A published guest-agent build for one (hypervisor, os, arch) triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBuild {
    pub version: String,
    pub url: String,
}

/// Persistence surface for instance attributes derived during
/// orchestration. Reads of the full instance record happen upstream;
/// the workflows only write back.
#[async_trait]
pub trait InstanceRecordStore: Send + Sync {
    /// Persist the instance's progress percentage
    async fn update_progress(&self, instance_uuid: &str, percent: u8) -> Result<()>;

    /// Persist the normalized VM mode chosen at spawn time
    async fn update_vm_mode(&self, instance_uuid: &str, mode: VmMode) -> Result<()>;

    /// Latest known agent build for a guest triple, if any is published
    async fn latest_agent_build(
        &self,
        hypervisor: &str,
        os_type: &str,
        architecture: &str,
    ) -> Result<Option<AgentBuild>>;
}
