//! Guest-agent negotiation
//!
//! Runs after a VM boots: probe the agent, upgrade it when a newer
//! build is published for the guest's (hypervisor, os, arch) triple,
//! then push credentials and reset networking. Every agent RPC returns
//! a structured result; nothing in here fails the spawn.

use crate::config::VmOpsConfig;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmflow_backend::{AgentBuild, AgentRpc, GuestAgentChannel, InstanceRecordStore};
use vmflow_types::{InstanceSpec, VmRef};

/// Compare two dotted version strings component-wise.
///
/// Components are numeric; when all shared components tie, the shorter
/// string is the smaller version ("1" < "1.0").
pub fn cmp_version(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let va = parse(a);
    let vb = parse(b);
    for (x, y) in va.iter().zip(vb.iter()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    va.len().cmp(&vb.len())
}

/// Credentials and files pushed into the guest after boot
#[derive(Debug, Clone, Default)]
pub struct GuestCredentials {
    pub ssh_key: Option<String>,
    pub admin_password: Option<String>,
    /// (path, contents) pairs written into the guest filesystem
    pub files: Vec<(String, String)>,
}

/// Outcome of one negotiation, kept for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct AgentHandshakeState {
    pub enabled: bool,
    pub detected_version: Option<String>,
    pub available_build: Option<AgentBuild>,
    pub updated: bool,
}

impl AgentHandshakeState {
    /// An agent answered the probe but no build is published for its
    /// guest triple
    pub fn present_without_build(&self) -> bool {
        self.detected_version.is_some() && self.available_build.is_none()
    }
}

/// Post-boot agent handshake
pub struct GuestAgentNegotiator {
    agent: Arc<dyn GuestAgentChannel>,
    records: Arc<dyn InstanceRecordStore>,
    hypervisor_type: String,
}

impl GuestAgentNegotiator {
    pub fn new(
        agent: Arc<dyn GuestAgentChannel>,
        records: Arc<dyn InstanceRecordStore>,
        config: &VmOpsConfig,
    ) -> Self {
        Self {
            agent,
            records,
            hypervisor_type: config.hypervisor_type.clone(),
        }
    }

    /// Run the handshake. Never fails: agent absence, staleness and RPC
    /// flakiness are recorded in the returned state and logged.
    pub async fn negotiate(
        &self,
        spec: &InstanceSpec,
        vm: &VmRef,
        credentials: &GuestCredentials,
    ) -> AgentHandshakeState {
        if !spec.agent_enabled {
            debug!(instance = %spec.uuid, "Guest agent disabled, skipping negotiation");
            return AgentHandshakeState::default();
        }

        let mut state = AgentHandshakeState {
            enabled: true,
            ..AgentHandshakeState::default()
        };

        state.detected_version = match self.agent.agent_version(vm).await {
            AgentRpc::Ok(version) => {
                info!(instance = %spec.uuid, %version, "Guest agent detected");
                Some(version)
            }
            outcome => {
                debug!(instance = %spec.uuid, ?outcome, "No guest agent detected yet");
                None
            }
        };

        state.available_build = self.lookup_build(spec).await;
        if state.present_without_build() {
            debug!(instance = %spec.uuid, "Agent present but no build published for guest triple");
        }

        if let (Some(detected), Some(build)) = (&state.detected_version, &state.available_build) {
            if cmp_version(&build.version, detected) == Ordering::Greater {
                info!(
                    instance = %spec.uuid,
                    from = %detected,
                    to = %build.version,
                    "Updating guest agent"
                );
                match self.agent.agent_update(vm, &build.url).await {
                    AgentRpc::Ok(()) => state.updated = true,
                    outcome => {
                        warn!(instance = %spec.uuid, ?outcome, "Guest agent update failed")
                    }
                }
            }
        }

        self.configure(spec, vm, credentials, &state).await;
        state
    }

    async fn lookup_build(&self, spec: &InstanceSpec) -> Option<AgentBuild> {
        let os_type = spec.os_type.as_deref().unwrap_or("linux");
        let architecture = spec.architecture.as_deref().unwrap_or("x86_64");
        match self
            .records
            .latest_agent_build(&self.hypervisor_type, os_type, architecture)
            .await
        {
            Ok(build) => build,
            Err(e) => {
                warn!(instance = %spec.uuid, error = %e, "Agent build lookup failed");
                None
            }
        }
    }

    async fn configure(
        &self,
        spec: &InstanceSpec,
        vm: &VmRef,
        credentials: &GuestCredentials,
        state: &AgentHandshakeState,
    ) {
        if let Some(key) = &credentials.ssh_key {
            if let outcome @ (AgentRpc::Timeout | AgentRpc::NotImplemented | AgentRpc::Error(_)) =
                self.agent.inject_ssh_key(vm, key).await
            {
                warn!(instance = %spec.uuid, ?outcome, "SSH key injection failed");
            }
        }

        for (path, contents) in &credentials.files {
            if !self.agent.inject_file(vm, path, contents).await.is_ok() {
                warn!(instance = %spec.uuid, %path, "File injection failed");
            }
        }

        // An agent-less guest cannot take a password; skipping beats
        // failing the whole spawn.
        if let Some(password) = &credentials.admin_password {
            if state.detected_version.is_some() {
                if !self.agent.set_admin_password(vm, password).await.is_ok() {
                    warn!(instance = %spec.uuid, "Admin password injection failed");
                }
            } else {
                debug!(instance = %spec.uuid, "No agent detected, skipping password injection");
            }
        }

        if !self.agent.reset_network(vm).await.is_ok() {
            warn!(instance = %spec.uuid, "Guest network reset failed");
        }
    }
}
