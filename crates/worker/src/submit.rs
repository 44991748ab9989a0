//! Job submission: turn uploaded files or a finished compile into a queued
//! job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use esprelay_core::device::device_name_from_str;
use esprelay_core::error::CoreError;
use esprelay_core::job::{Credential, Job, JobStatus};
use esprelay_core::naming::download_name;
use esprelay_core::types::JobId;
use esprelay_db::JobStore;

use crate::config::RelayConfig;
use crate::dispatcher::DispatchQueue;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job {0} could not be queued")]
    NotQueued(JobId),
}

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

fn is_yaml(name: &str) -> bool {
    name.ends_with(".yaml") || name.ends_with(".yml")
}

/// Only the final path component of an uploaded name is kept.
fn plain_name(name: &str) -> Option<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
}

/// Entry point used by whatever accepts jobs from users.
#[derive(Clone)]
pub struct Submission {
    store: Arc<dyn JobStore>,
    queue: DispatchQueue,
    config: Arc<RelayConfig>,
}

impl Submission {
    pub fn new(store: Arc<dyn JobStore>, queue: DispatchQueue, config: Arc<RelayConfig>) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Accept a device configuration (plus secrets and headers) and queue a
    /// compile job for it.
    pub async fn compile(&self, files: Vec<UploadedFile>) -> Result<Job, SubmitError> {
        if files.iter().all(|f| f.name.is_empty()) {
            return Err(SubmitError::Rejected("No files provided in the request".into()));
        }

        let mut kept: Vec<(String, Vec<u8>)> = Vec::new();
        let mut entry: Option<usize> = None;
        for file in files {
            let Some(name) = plain_name(&file.name).map(str::to_string) else {
                continue;
            };
            if !(is_yaml(&name) || name.ends_with(".h")) {
                tracing::warn!(file = %name, "Skipping file with invalid extension");
                continue;
            }
            if is_yaml(&name) && !self.config.is_secret_file(&name) {
                if let Some(existing) = entry {
                    return Err(SubmitError::Rejected(format!(
                        "Ambiguous request: Found multiple non-secret YAML files: {} and {}",
                        kept[existing].0, name
                    )));
                }
                entry = Some(kept.len());
            }
            kept.push((name, file.contents));
        }

        let Some(entry) = entry else {
            return Err(SubmitError::Rejected(
                "No main device YAML file found. Please upload a device config, not just secret files."
                    .into(),
            ));
        };
        let entry_file = kept[entry].0.clone();

        let device_name = device_name_from_str(&String::from_utf8_lossy(&kept[entry].1))
            .ok_or_else(|| {
                SubmitError::Rejected(
                    "Could not parse 'name:' from your YAML file. Make sure it's set.".into(),
                )
            })?;
        if plain_name(&device_name) != Some(device_name.as_str()) {
            return Err(SubmitError::Rejected(format!(
                "Device name {device_name:?} cannot be used as a directory name"
            )));
        }

        let project_dir = self.config.projects_dir.join(&device_name);
        if !tokio::fs::try_exists(&project_dir).await? {
            tokio::fs::create_dir_all(&project_dir).await?;
            tracing::info!(device = %device_name, path = %project_dir.display(), "Created project directory");
        }
        for (name, contents) in &kept {
            tokio::fs::write(project_dir.join(name), contents).await?;
        }

        let id = JobId::generate();
        let job = Job::compile(
            id.clone(),
            project_dir,
            entry_file,
            device_name,
            self.config.transcript_path(&id),
        );
        self.admit(job).await
    }

    /// Queue an upload of a successfully compiled project to `target`.
    pub async fn upload(
        &self,
        original_job_id: &JobId,
        target: &str,
        credential: Option<Credential>,
    ) -> Result<Job, SubmitError> {
        let original = self
            .store
            .get(original_job_id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(original_job_id))?;

        let id = JobId::generate();
        let transcript = self.config.transcript_path(&id);
        let credential = credential.filter(|c| !c.expose().is_empty());
        let job = Job::upload_from(id, &original, target.trim(), credential, transcript)?;
        self.admit(job).await
    }

    /// Stored path and offered download name of a successful job's artifact.
    pub async fn artifact(&self, job_id: &JobId) -> Result<(PathBuf, String), SubmitError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(job_id))?;
        match (&job.status, &job.artifact_ref) {
            (JobStatus::Success, Some(artifact_ref)) => Ok((
                self.config.binaries_dir.join(artifact_ref),
                download_name(&job.id, artifact_ref).to_string(),
            )),
            _ => Err(CoreError::NotFound {
                entity: "artifact",
                id: job_id.to_string(),
            }
            .into()),
        }
    }

    async fn admit(&self, job: Job) -> Result<Job, SubmitError> {
        self.store.insert(job.clone()).await?;
        if !self.queue.enqueue(job.id.clone()) {
            return Err(SubmitError::NotQueued(job.id));
        }
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            device = %job.device_name,
            "Job submitted",
        );
        Ok(job)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
