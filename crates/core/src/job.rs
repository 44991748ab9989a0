//! Job record for one compile or upload attempt.
//!
//! A [`Job`] is created `pending`, moves to `running` when a capacity slot
//! is acquired, and ends in exactly one of `success` or `failed`. All
//! transitions go through [`Job::transition`], which rejects anything that
//! is not a step along `pending -> running -> {success | failed}`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Kind / status
// ---------------------------------------------------------------------------

/// What the external toolchain is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Compile,
    Upload,
}

impl JobKind {
    /// Upper-case label used in transcript banners.
    pub fn banner(self) -> &'static str {
        match self {
            Self::Compile => "COMPILE",
            Self::Upload => "UPLOAD",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => f.write_str("compile"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

/// Lifecycle status of a job. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether `self -> next` is a legal single step.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// Upload password. Write-only: never printed, never serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub const REDACTED: &'static str = "********";

    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for injection into the child environment only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::REDACTED)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub working_directory: PathBuf,
    pub entry_file: String,
    pub device_name: String,
    pub upload_target: Option<String>,
    #[serde(skip_serializing, default)]
    pub upload_credential: Option<Credential>,
    /// Compile job an upload was derived from.
    pub original_job_id: Option<JobId>,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub duration_seconds: Option<f64>,
    pub transcript_path: PathBuf,
    pub artifact_ref: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    /// Create a pending compile job.
    pub fn compile(
        id: JobId,
        working_directory: impl Into<PathBuf>,
        entry_file: impl Into<String>,
        device_name: impl Into<String>,
        transcript_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            kind: JobKind::Compile,
            status: JobStatus::Pending,
            working_directory: working_directory.into(),
            entry_file: entry_file.into(),
            device_name: device_name.into(),
            upload_target: None,
            upload_credential: None,
            original_job_id: None,
            submitted_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            transcript_path: transcript_path.into(),
            artifact_ref: None,
            error_message: None,
        }
    }

    /// Create a pending upload job flashing the project of a successful
    /// compile job onto `target`.
    pub fn upload_from(
        id: JobId,
        original: &Job,
        target: impl Into<String>,
        credential: Option<Credential>,
        transcript_path: impl Into<PathBuf>,
    ) -> Result<Self, CoreError> {
        if original.status != JobStatus::Success {
            return Err(CoreError::Validation(format!(
                "Original job {} was not successful. Cannot upload.",
                original.id
            )));
        }
        let target = target.into();
        if target.trim().is_empty() {
            return Err(CoreError::Validation("Upload target is required".into()));
        }

        let mut job = Self::compile(
            id,
            original.working_directory.clone(),
            original.entry_file.clone(),
            original.device_name.clone(),
            transcript_path,
        );
        job.kind = JobKind::Upload;
        job.upload_target = Some(target);
        job.upload_credential = credential;
        job.original_job_id = Some(original.id.clone());
        Ok(job)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The kind the runner actually executes: an upload without a target
    /// address degrades to a compile.
    pub fn effective_kind(&self) -> JobKind {
        match (self.kind, &self.upload_target) {
            (JobKind::Upload, Some(_)) => JobKind::Upload,
            _ => JobKind::Compile,
        }
    }

    /// Apply a single status step, rejecting anything non-monotonic.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `pending -> running`, stamping the start time.
    pub fn mark_running(&mut self, at: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(at);
        Ok(())
    }

    /// Record end time and duration. Only the first call has an effect.
    pub fn mark_finished(&mut self, at: Timestamp) {
        if self.finished_at.is_some() {
            return;
        }
        self.finished_at = Some(at);
        self.duration_seconds = self
            .started_at
            .map(|start| (at - start).num_milliseconds() as f64 / 1000.0);
    }

    /// `running -> success` with the produced artifact.
    pub fn succeed(&mut self, artifact_ref: impl Into<String>) -> Result<(), CoreError> {
        self.transition(JobStatus::Success)?;
        self.artifact_ref = Some(artifact_ref.into());
        self.error_message = None;
        Ok(())
    }

    /// `running -> failed` with a human-readable reason.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        let message = message.into();
        self.transition(JobStatus::Failed)?;
        self.artifact_ref = None;
        self.error_message = Some(if message.trim().is_empty() {
            "Job failed".to_string()
        } else {
            message
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
