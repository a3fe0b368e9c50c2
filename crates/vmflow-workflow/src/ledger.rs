//! The undo ledger
//!
//! Steps that create a side effect register a named undo action here
//! immediately after the forward action succeeds. On abort the engine
//! replays the ledger strictly in reverse insertion order; each undo
//! runs at most once. Failures during replay are collected rather than
//! raised so the original failure is never masked.

use futures::future::BoxFuture;
use tracing::{debug, warn};

/// Error produced by an undo action
pub type UndoError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A replay failure, recorded for logging (or escalation)
#[derive(Debug)]
pub struct UndoFailure {
    pub name: String,
    pub error: String,
}

struct UndoAction {
    name: String,
    action: Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<(), UndoError>> + Send>,
}

/// Ordered record of reversal actions for one workflow run.
#[derive(Default)]
pub struct UndoLedger {
    actions: Vec<UndoAction>,
}

impl UndoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo action. Call only after the corresponding
    /// forward action has succeeded; a step with no side effect
    /// registers nothing.
    pub fn record<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), UndoError>> + Send + 'static,
    {
        self.actions.push(UndoAction {
            name: name.into(),
            action: Box::new(move || Box::pin(f())),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Replay all registered undo actions in reverse insertion order.
    ///
    /// Each action is consumed, so a second call is a no-op. Failures
    /// are logged and returned; they are never raised from here.
    pub async fn unwind(&mut self) -> Vec<UndoFailure> {
        let mut failures = Vec::new();
        while let Some(undo) = self.actions.pop() {
            debug!(undo = %undo.name, "Replaying undo action");
            if let Err(e) = (undo.action)().await {
                warn!(undo = %undo.name, error = %e, "Undo action failed");
                failures.push(UndoFailure {
                    name: undo.name,
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}

impl std::fmt::Debug for UndoLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoLedger")
            .field(
                "actions",
                &self.actions.iter().map(|a| &a.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_ledger() -> (UndoLedger, Arc<Mutex<Vec<&'static str>>>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = UndoLedger::new();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            ledger.record(name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        (ledger, order)
    }

    #[tokio::test]
    async fn test_unwind_is_reverse_insertion_order() {
        let (mut ledger, order) = recording_ledger();
        assert_eq!(ledger.len(), 3);

        let failures = ledger.unwind().await;
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_each_undo_runs_at_most_once() {
        let (mut ledger, order) = recording_ledger();

        ledger.unwind().await;
        ledger.unwind().await;

        assert_eq!(order.lock().unwrap().len(), 3);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = UndoLedger::new();

        let o = order.clone();
        ledger.record("works", move || async move {
            o.lock().unwrap().push("works");
            Ok(())
        });
        ledger.record("breaks", move || async move {
            Err("backend gone".to_string().into())
        });

        let failures = ledger.unwind().await;

        // "breaks" ran first (reverse order), failed, and did not stop "works"
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "breaks");
        assert_eq!(failures[0].error, "backend gone");
        assert_eq!(*order.lock().unwrap(), vec!["works"]);
    }
}
