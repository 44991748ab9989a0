use async_trait::async_trait;
use esprelay_core::error::CoreError;
use esprelay_core::job::{Job, JobStatus};
use esprelay_core::types::JobId;

/// A mutation applied to one job inside the store's critical section.
///
/// Returning `Err` aborts the update and leaves the stored record untouched.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> Result<(), CoreError> + Send>;

/// Shared job record store.
///
/// Readers get snapshots; nothing outside the store holds a reference to
/// the live record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. Fails with `Conflict` if the id is already taken.
    async fn insert(&self, job: Job) -> Result<(), CoreError>;

    /// Snapshot of a job, if present.
    async fn get(&self, id: &JobId) -> Result<Option<Job>, CoreError>;

    /// Atomically apply `mutate` to the job and return the new snapshot.
    async fn update(&self, id: &JobId, mutate: JobMutation) -> Result<Job, CoreError>;

    /// All jobs, newest submission first.
    async fn list(&self) -> Result<Vec<Job>, CoreError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<usize, CoreError>;
}
