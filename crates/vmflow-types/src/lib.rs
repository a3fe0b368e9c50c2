//! vmflow domain types
//!
//! Plain data types shared by the workflow engine, the backend
//! capability interfaces, and the provisioning/migration workflows.
//! No I/O happens in this crate.

pub mod disk;
pub mod instance;
pub mod migration;
pub mod network;
pub mod power;

pub use disk::*;
pub use instance::*;
pub use migration::*;
pub use network::*;
pub use power::*;
