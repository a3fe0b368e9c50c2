//! Capability interfaces consumed by the orchestration layer
//!
//! The orchestration crates never talk to a hypervisor directly; they
//! depend on the traits defined here. Four collaborators:
//!
//! ```text
//!   VirtualizationBackend   disk/VM/VIF lifecycle, power, transfers
//!   GuestAgentChannel       in-guest agent RPC (tri-state results)
//!   InstanceRecordStore     durable instance attributes and progress
//!   FirewallBackend         packet filtering (optional capability)
//! ```
//!
//! `fake` provides in-memory recording implementations of all four,
//! used by the workflow tests.

pub mod agent;
pub mod error;
pub mod fake;
pub mod firewall;
pub mod records;
pub mod virt;

pub use agent::{AgentRpc, GuestAgentChannel};
pub use error::{BackendError, Result};
pub use fake::{FakeAgent, FakeBackend, FakeFirewall, FakeRecordStore};
pub use firewall::{CapabilityOutcome, FirewallBackend};
pub use records::{AgentBuild, InstanceRecordStore};
pub use virt::VirtualizationBackend;
