//! Progress publication into the instance record store

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use vmflow_backend::InstanceRecordStore;
use vmflow_workflow::{percent, ProgressReporter};

/// Publishes workflow progress to the durable instance record.
///
/// Persistence failures are logged and dropped: progress is
/// observability, never correctness, and must not abort a workflow.
pub struct RecordProgressReporter {
    records: Arc<dyn InstanceRecordStore>,
    instance_uuid: String,
}

impl RecordProgressReporter {
    pub fn new(records: Arc<dyn InstanceRecordStore>, instance_uuid: impl Into<String>) -> Self {
        Self {
            records,
            instance_uuid: instance_uuid.into(),
        }
    }
}

#[async_trait]
impl ProgressReporter for RecordProgressReporter {
    async fn report(&self, current: u32, total: u32) {
        let pct = percent(current, total);
        debug!(instance = %self.instance_uuid, current, total, pct, "Updating progress");
        if let Err(e) = self.records.update_progress(&self.instance_uuid, pct).await {
            warn!(instance = %self.instance_uuid, error = %e, "Failed to persist progress");
        }
    }
}
