//! Error taxonomy shared by all backend capabilities

use std::time::Duration;
use thiserror::Error;

/// Error type for backend operations
#[derive(Debug, Error)]
pub enum BackendError {
    /// A VM with the requested display name already exists
    #[error("a VM named '{0}' already exists")]
    DuplicateName(String),

    /// The host cannot satisfy the requested resources
    #[error("insufficient resources: requested {requested_mib} MiB, {available_mib} MiB free")]
    InsufficientResources {
        requested_mib: u64,
        available_mib: u64,
    },

    /// A VM, disk, or other referenced object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// An RPC did not complete within its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend itself could not be reached or failed internally
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The object exists but is in a state that forbids the operation
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
