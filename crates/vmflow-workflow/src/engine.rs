//! Workflow execution engine
//!
//! Executes an ordered step list strictly in sequence, bumping a
//! per-run counter and reporting progress after every successful step.
//! The first failure stops execution, replays the undo ledger in
//! reverse, and surfaces one wrapped error carrying the original cause.

use crate::error::{Result, WorkflowError};
use crate::ledger::UndoLedger;
use crate::progress::ProgressReporter;
use crate::step::Step;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What to do when an undo action fails during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Log undo failures and surface only the original cause. Safe
    /// default: an error during rollback must not mask the failure
    /// that triggered it.
    #[default]
    BestEffort,

    /// Surface undo failures alongside the original cause. Used where
    /// an incomplete rollback leaves state worse than a duplicated
    /// error report (the migration shrink path).
    Escalate,
}

/// Counters for one workflow execution.
///
/// The total is fixed before the first step runs and never recomputed
/// mid-run; conditional steps are resolved by the builder that
/// assembles the step list.
#[derive(Debug)]
pub struct WorkflowRun {
    total: u32,
    current: u32,
    started_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            current: 0,
            started_at: Utc::now(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn advance(&mut self) -> u32 {
        self.current += 1;
        self.current
    }
}

/// Workflow execution engine
pub struct WorkflowEngine {
    reporter: Arc<dyn ProgressReporter>,
    policy: RollbackPolicy,
}

impl WorkflowEngine {
    /// Create an engine with the default best-effort rollback policy
    pub fn new(reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            policy: RollbackPolicy::default(),
        }
    }

    /// Set the rollback policy
    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Execute the steps in order. The progress denominator is the
    /// number of steps scheduled.
    pub async fn run<S: Send>(
        &self,
        workflow: &str,
        steps: Vec<Box<dyn Step<S>>>,
        state: &mut S,
    ) -> Result<()> {
        let total = steps.len() as u32;
        self.run_with_total(workflow, steps, total, state).await
    }

    /// Execute the steps in order against an explicit progress
    /// denominator.
    ///
    /// Used by phase-normalized sequences whose final phase completes
    /// elsewhere (the destination host finishes a migration), so local
    /// progress must stop short of 100%.
    pub async fn run_with_total<S: Send>(
        &self,
        workflow: &str,
        steps: Vec<Box<dyn Step<S>>>,
        total: u32,
        state: &mut S,
    ) -> Result<()> {
        info!(workflow, steps = steps.len(), total, "Starting workflow");

        let mut run = WorkflowRun::new(total);
        let mut ledger = UndoLedger::new();

        for step in &steps {
            debug!(workflow, step = step.name(), "Executing step");

            if let Err(source) = step.run(state, &mut ledger).await {
                error!(workflow, step = step.name(), error = %source, "Step failed, rolling back");
                return Err(self
                    .abort(workflow, step.name(), source, &mut ledger)
                    .await);
            }

            let current = run.advance();
            self.reporter.report(current, run.total()).await;
            debug!(workflow, step = step.name(), current, total, "Step completed");
        }

        let elapsed = Utc::now().signed_duration_since(run.started_at());
        info!(workflow, elapsed_ms = elapsed.num_milliseconds(), "Workflow completed");
        Ok(())
    }

    async fn abort(
        &self,
        workflow: &str,
        step: &str,
        source: crate::error::StepError,
        ledger: &mut UndoLedger,
    ) -> WorkflowError {
        let failures = ledger.unwind().await;

        if self.policy == RollbackPolicy::Escalate {
            if let Some(failure) = failures.into_iter().next() {
                return WorkflowError::RollbackFailed {
                    workflow: workflow.to_string(),
                    step: step.to_string(),
                    undo: failure.name,
                    rollback: failure.error,
                    source,
                };
            }
        }

        WorkflowError::Aborted {
            workflow: workflow.to_string(),
            step: step.to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
