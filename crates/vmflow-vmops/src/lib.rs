//! VM provisioning and migration workflows
//!
//! The two long-running operations (spawn, migrate) are built on the
//! step/rollback engine from `vmflow-workflow`; everything that touches
//! a hypervisor goes through the capability traits in `vmflow-backend`.
//!
//! ```text
//!   ProvisioningWorkflow ──┐
//!   MigrationWorkflow ─────┼──> WorkflowEngine ──> VirtualizationBackend
//!   LifecycleOps ──────────┘         │
//!                                    └──> RecordProgressReporter
//! ```
//!
//! `boot` and `agent` hold the two post-boot collaborators invoked by
//! the terminal spawn step: the bounded-time readiness poller and the
//! guest-agent negotiation state machine.

pub mod agent;
pub mod boot;
pub mod config;
pub mod error;
mod inject;
pub mod locks;
pub mod migrate;
pub mod ops;
pub mod report;
pub mod spawn;

pub use agent::{GuestAgentNegotiator, GuestCredentials};
pub use boot::BootReadinessPoller;
pub use config::VmOpsConfig;
pub use error::{Result, VmOpsError};
pub use migrate::{MigrationRequest, MigrationWorkflow};
pub use ops::LifecycleOps;
pub use spawn::{ProvisioningWorkflow, SpawnRequest};
