//! In-process [`JobStore`] backed by a single `RwLock<HashMap>`.
//!
//! One global critical section is plenty at the scale of a handful of
//! concurrent jobs.

use std::collections::HashMap;

use async_trait::async_trait;
use esprelay_core::error::CoreError;
use esprelay_core::job::{Job, JobStatus};
use esprelay_core::types::JobId;
use tokio::sync::RwLock;

use crate::job_store::{JobMutation, JobStore};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), CoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(CoreError::Conflict(format!("job {} already exists", job.id)));
        }
        tracing::debug!(job_id = %job.id, kind = %job.kind, "Job stored");
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, CoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update(&self, id: &JobId, mutate: JobMutation) -> Result<Job, CoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| CoreError::job_not_found(id))?;

        // Work on a copy so a failed mutation leaves no partial writes.
        let mut draft = stored.clone();
        mutate(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    async fn list(&self) -> Result<Vec<Job>, CoreError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(jobs)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, CoreError> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .count())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
