//! Step trait definition
//!
//! A step is one named unit of a workflow: a forward action that may
//! register undo actions in the ledger once its side effects exist.
//! Steps share progress through a workflow-specific state value `S`
//! owned by the caller and threaded through the engine.

use crate::error::StepError;
use crate::ledger::UndoLedger;
use async_trait::async_trait;

/// Core trait for workflow steps
///
/// Implementations hold whatever backend handles they need; the engine
/// gives each step mutable access to the shared workflow state (for
/// outputs of earlier steps) and to the undo ledger.
///
/// Undo actions must only be registered after the forward work they
/// reverse has actually happened, so a failure mid-step never rolls
/// back effects that were never created.
#[async_trait]
pub trait Step<S: Send>: Send + Sync {
    /// Step name, used in progress logs and error wrapping
    fn name(&self) -> &str;

    /// Execute the step
    async fn run(&self, state: &mut S, ledger: &mut UndoLedger) -> Result<(), StepError>;
}

/// A step with no side effects, used for phase alignment and testing
pub struct NoopStep {
    name: String,
}

impl NoopStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl<S: Send> Step<S> for NoopStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _state: &mut S, _ledger: &mut UndoLedger) -> Result<(), StepError> {
        Ok(())
    }
}

/// A step that always fails (for testing rollback)
pub struct FailingStep {
    name: String,
    message: String,
}

impl FailingStep {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl<S: Send> Step<S> for FailingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _state: &mut S, _ledger: &mut UndoLedger) -> Result<(), StepError> {
        Err(self.message.clone().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_step() {
        let step = NoopStep::new("align");
        let mut ledger = UndoLedger::new();
        let mut state = ();

        assert_eq!(Step::<()>::name(&step), "align");
        assert!(step.run(&mut state, &mut ledger).await.is_ok());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_failing_step() {
        let step = FailingStep::new("boom", "something bad");
        let mut ledger = UndoLedger::new();
        let mut state = ();

        let err = step.run(&mut state, &mut ledger).await.unwrap_err();
        assert!(err.to_string().contains("something bad"));
    }
}
