//! Guest-agent side channel
//!
//! Agent absence, staleness and flakiness are expected operating
//! conditions, so the channel never returns a hard error: every call
//! yields an [`AgentRpc`] value and the caller branches on data.

use async_trait::async_trait;
use vmflow_types::VmRef;

/// Outcome of one guest-agent RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRpc<T> {
    /// The agent answered
    Ok(T),

    /// No answer within the RPC deadline (agent absent or not yet up)
    Timeout,

    /// The agent answered but does not implement this command
    NotImplemented,

    /// The agent answered with a failure
    Error(String),
}

impl<T> AgentRpc<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, AgentRpc::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            AgentRpc::Ok(value) => Some(value),
            _ => None,
        }
    }
}

/// RPC surface of the in-guest helper agent
#[async_trait]
pub trait GuestAgentChannel: Send + Sync {
    /// Probe the agent and return its version string
    async fn agent_version(&self, vm: &VmRef) -> AgentRpc<String>;

    /// Tell the agent to update itself from the given build URL
    async fn agent_update(&self, vm: &VmRef, url: &str) -> AgentRpc<()>;

    /// Add an SSH public key to the guest's authorized keys
    async fn inject_ssh_key(&self, vm: &VmRef, key: &str) -> AgentRpc<()>;

    /// Write a file into the guest filesystem
    async fn inject_file(&self, vm: &VmRef, path: &str, contents: &str) -> AgentRpc<()>;

    /// Set the guest administrator password
    async fn set_admin_password(&self, vm: &VmRef, password: &str) -> AgentRpc<()>;

    /// Ask the agent to re-read and apply its network configuration
    async fn reset_network(&self, vm: &VmRef) -> AgentRpc<()>;
}
