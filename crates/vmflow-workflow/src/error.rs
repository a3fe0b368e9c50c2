//! Error types for workflow execution

use thiserror::Error;

/// Error produced by a step's forward action.
///
/// Steps surface whatever domain error their backend produced; the
/// engine wraps it exactly once, so callers can still downcast to the
/// original type.
pub type StepError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for workflow execution
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step failed; everything registered so far was rolled back
    #[error("workflow '{workflow}' aborted at step '{step}': {source}")]
    Aborted {
        workflow: String,
        step: String,
        #[source]
        source: StepError,
    },

    /// A step failed and, under an escalating rollback policy, at least
    /// one undo action failed too
    #[error(
        "workflow '{workflow}' aborted at step '{step}' ({source}); \
         rollback failed at '{undo}': {rollback}"
    )]
    RollbackFailed {
        workflow: String,
        step: String,
        undo: String,
        rollback: String,
        #[source]
        source: StepError,
    },
}

impl WorkflowError {
    /// The error raised by the failing step, for callers that branch on
    /// the underlying cause (e.g. retry on duplicate-name conflicts).
    pub fn cause(&self) -> &StepError {
        match self {
            WorkflowError::Aborted { source, .. } => source,
            WorkflowError::RollbackFailed { source, .. } => source,
        }
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn test_error_display() {
        let err = WorkflowError::Aborted {
            workflow: "spawn".to_string(),
            step: "create_disks".to_string(),
            source: Box::new(DiskFull),
        };
        assert_eq!(
            err.to_string(),
            "workflow 'spawn' aborted at step 'create_disks': disk full"
        );
    }

    #[test]
    fn test_cause_downcast() {
        let err = WorkflowError::Aborted {
            workflow: "spawn".to_string(),
            step: "create_disks".to_string(),
            source: Box::new(DiskFull),
        };
        assert!(err.cause().downcast_ref::<DiskFull>().is_some());
    }
}
