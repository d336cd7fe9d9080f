//! Progress reporting
//!
//! Stages report sub-step text through a [`ProgressSink`]; the pipeline
//! wires it to the job record so polling clients see the latest step.

use crate::job_store::JobStore;
use crate::types::{JobId, JobStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives latest-wins progress text
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, text: String);
}

/// Writes progress into a job record
pub struct JobProgress {
    store: Arc<dyn JobStore>,
    job_id: JobId,
}

impl JobProgress {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }
}

#[async_trait]
impl ProgressSink for JobProgress {
    async fn report(&self, text: String) {
        tracing::debug!(job_id = %self.job_id, progress = %text);
        // a rejected progress write must not disturb the stage reporting it
        if let Err(e) = self
            .store
            .set_status(&self.job_id, JobStatus::Analyzing, Some(text))
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "progress update rejected");
        }
    }
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _text: String) {}
}
