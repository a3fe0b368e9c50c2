//! Error types for the VM operations layer

use thiserror::Error;
use vmflow_backend::BackendError;
use vmflow_workflow::WorkflowError;

/// Error type for spawn, migration, and lifecycle operations
#[derive(Debug, Error)]
pub enum VmOpsError {
    /// A spawn step failed; all side effects were rolled back
    #[error("spawn failed: {source}")]
    SpawnFailed {
        #[source]
        source: WorkflowError,
    },

    /// A migration shrink phase failed after the source VM was already
    /// renamed or its disk duplicated. Rollback ran (and its own
    /// failures, if any, are carried by the source) but the instance
    /// should be flagged for inspection.
    #[error("migration rolled back: {source}")]
    InstanceFaultRollback {
        #[source]
        source: WorkflowError,
    },

    /// A migration grow phase failed; the source VM name was restored
    #[error("migration failed while {phase}: {source}")]
    MigrationFailed {
        phase: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result type for VM operations
pub type Result<T> = std::result::Result<T, VmOpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_passthrough() {
        let err: VmOpsError = BackendError::NotFound("VM vm-9".to_string()).into();
        assert_eq!(err.to_string(), "VM vm-9 not found");
    }
}
