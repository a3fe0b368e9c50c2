//! Progress reporting for workflow execution
//!
//! The engine reports (completed, total) after every successful step;
//! implementations turn that into a percentage and publish it wherever
//! progress is observed. Publishing is observability, not correctness:
//! a reporter must swallow (and log) its own failures rather than
//! abort the workflow.

use async_trait::async_trait;

/// Percentage for `current` completed units out of `total`.
pub fn percent(current: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    (f64::from(current) / f64::from(total) * 100.0).round() as u8
}

/// Trait for types that publish workflow progress
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Report that `current` of `total` units have completed
    async fn report(&self, current: u32, total: u32);
}

/// A no-op progress reporter
#[derive(Debug, Default, Clone)]
pub struct NoopReporter;

#[async_trait]
impl ProgressReporter for NoopReporter {
    async fn report(&self, _current: u32, _total: u32) {}
}

/// A progress update captured by [`CollectingReporter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current: u32,
    pub total: u32,
    pub percent: u8,
}

/// A progress reporter that collects all updates, for tests
#[derive(Debug, Default)]
pub struct CollectingReporter {
    updates: std::sync::Mutex<Vec<ProgressUpdate>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn percentages(&self) -> Vec<u8> {
        self.updates.lock().unwrap().iter().map(|u| u.percent).collect()
    }

    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProgressReporter for CollectingReporter {
    async fn report(&self, current: u32, total: u32) {
        self.updates.lock().unwrap().push(ProgressUpdate {
            current,
            total,
            percent: percent(current, total),
        });
    }
}
