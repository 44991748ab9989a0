//! Process runner: executes one job from `running` to a terminal status.
//!
//! A job is first claimed with [`claim`], the single atomic
//! `pending -> running` step; only the caller that wins it may execute the
//! job and publish to its viewers. [`ProcessRunner::execute`] never returns
//! an error. Everything that goes wrong while executing a job ends up in the
//! job record (`failed` plus an error message) and, where possible, in the
//! transcript. Cleanup always runs: the classifier is finalized, `Close` is
//! published and the job's broadcaster entry is released. The caller's
//! capacity slot is released when the caller drops it after `execute`
//! returns.

use std::collections::VecDeque;
use std::io::{self, BufRead, Read};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use esprelay_core::classifier::Classifier;
use esprelay_core::error::CoreError;
use esprelay_core::event::LogEvent;
use esprelay_core::job::{Job, JobKind, JobStatus};
use esprelay_core::transcript::{self, body_line, Header, Trailer, TrailerStatus};
use esprelay_core::types::JobId;
use esprelay_db::JobStore;
use esprelay_events::EventBroadcaster;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinError;

use crate::artifact;
use crate::command::ToolCommand;
use crate::config::RelayConfig;

/// Number of trailing output lines inspected for status markers.
pub const TRAILING_WINDOW: usize = 10;

/// Lines buffered between the output readers and the runner loop.
const LINE_BUFFER: usize = 1024;

pub const AUTH_FAILED_MESSAGE: &str = "Upload failed: Authentication Invalid.";
pub const PROCESS_FAILED_MESSAGE: &str = "Process failed. Check log for details.";

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] CoreError),

    #[error("Failed to store artifact: {0}")]
    Artifact(#[source] io::Error),

    #[error("Runner task panicked: {0}")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Status inference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    AuthFailed,
    ProcessFailed,
}

/// Decide the outcome from the exit code and the last output lines.
///
/// Uploads need an explicit success marker in the window as well as a zero
/// exit code.
pub fn judge<'a>(
    kind: JobKind,
    return_code: i32,
    window: impl IntoIterator<Item = &'a String> + Clone,
) -> Verdict {
    let uploaded = window
        .clone()
        .into_iter()
        .any(|l| l.contains("Successfully uploaded") || l.contains("===== [SUCCESS]"));
    let auth_failed = window
        .into_iter()
        .any(|l| l.contains("Authentication invalid"));

    if return_code == 0 && (kind == JobKind::Compile || uploaded) {
        Verdict::Passed
    } else if auth_failed {
        Verdict::AuthFailed
    } else {
        Verdict::ProcessFailed
    }
}

enum Outcome {
    Success(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Live event sink
// ---------------------------------------------------------------------------

/// Classifier plus broadcaster for one live run. Shared between the
/// execution task and the cleanup step, so it outlives a panicking task.
struct LiveSink {
    job_id: JobId,
    broadcaster: Arc<EventBroadcaster>,
    classifier: Mutex<Classifier>,
}

impl LiveSink {
    fn new(job_id: JobId, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self {
            job_id,
            broadcaster,
            classifier: Mutex::new(Classifier::new()),
        }
    }

    fn feed(&self, raw: &str) {
        let Some(line) = body_line(raw) else {
            return;
        };
        let events = self.classifier.lock().classify(line);
        self.publish(&events);
    }

    fn finalize(&self) {
        let events = self.classifier.lock().finalize();
        self.publish(&events);
    }

    fn publish(&self, events: &[LogEvent]) {
        for event in events {
            self.broadcaster.publish(&self.job_id, event);
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Move `job_id` from `pending` to `running` and return the started job.
///
/// The transition happens inside one store update, so of any number of
/// concurrent callers exactly one succeeds. The others get
/// `InvalidTransition` (or `NotFound` for an unknown id).
pub async fn claim(store: &dyn JobStore, job_id: &JobId) -> Result<Job, CoreError> {
    store
        .update(
            job_id,
            Box::new(|job: &mut Job| job.mark_running(Utc::now())),
        )
        .await
}

pub struct ProcessRunner {
    store: Arc<dyn JobStore>,
    broadcaster: Arc<EventBroadcaster>,
    config: Arc<RelayConfig>,
}

impl ProcessRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        broadcaster: Arc<EventBroadcaster>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            config,
        }
    }

    /// Claim `job_id` and execute it.
    ///
    /// Fails only when the job cannot be claimed. Nothing is published in
    /// that case: the job and its viewers belong to whoever claimed it.
    pub async fn run(&self, job_id: &JobId) -> Result<JobStatus, CoreError> {
        let started = claim(self.store.as_ref(), job_id).await?;
        Ok(self.execute(started).await)
    }

    /// Execute a job already returned by [`claim`] and return its terminal
    /// status.
    pub async fn execute(&self, started: Job) -> JobStatus {
        let job_id = &started.id;
        tracing::info!(
            job_id = %job_id,
            kind = %started.effective_kind(),
            device = %started.device_name,
            "Job started",
        );

        let sink = Arc::new(LiveSink::new(job_id.clone(), Arc::clone(&self.broadcaster)));
        let execution = Execution {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            sink: Arc::clone(&sink),
            job: started.clone(),
        };

        // A separate task so a panic is contained and reported like any
        // other crash.
        let result = match tokio::spawn(execution.run()).await {
            Ok(result) => result,
            Err(e) => Err(RunnerError::Panicked(join_error_message(e))),
        };

        let status = match result {
            Ok(status) => status,
            Err(e) => self.record_crash(&started, &sink, e).await,
        };

        sink.finalize();
        self.broadcaster.close(job_id);
        tracing::info!(job_id = %job_id, status = %status, "Job finished");
        status
    }

    /// Mark the job failed after a crash and make the crash visible in the
    /// transcript and to live viewers.
    async fn record_crash(&self, job: &Job, sink: &LiveSink, error: RunnerError) -> JobStatus {
        let detail = error.to_string().replace(['\r', '\n'], " ");
        tracing::error!(job_id = %job.id, error = %detail, "Runner crashed");

        if let Ok(Some(current)) = self.store.get(&job.id).await {
            if current.is_terminal() {
                return current.status;
            }
        }

        if let Err(e) = append_crash(&job.transcript_path, &detail).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to append crash to transcript");
        }
        sink.feed(&transcript::crash_line(&detail));

        let message = format!("Runner crashed: {detail}");
        let update = self
            .store
            .update(
                &job.id,
                Box::new(move |job: &mut Job| {
                    job.mark_finished(Utc::now());
                    job.fail(message)
                }),
            )
            .await;

        match update {
            Ok(job) => job.status,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to record crash");
                JobStatus::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Owned state of one execution, moved into its own task.
struct Execution {
    store: Arc<dyn JobStore>,
    config: Arc<RelayConfig>,
    sink: Arc<LiveSink>,
    job: Job,
}

impl Execution {
    async fn run(self) -> Result<JobStatus, RunnerError> {
        let job = &self.job;
        let cmd = ToolCommand::for_job(&self.config, job);

        if let Some(parent) = job.transcript_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = tokio::fs::File::create(&job.transcript_path).await?;
        let command_line = cmd.display();
        let header = Header {
            version: &self.config.app_version,
            kind: cmd.kind,
            job_id: &job.id,
            device_name: &job.device_name,
            credential_set: cmd.has_credential(),
            command: &command_line,
            project_dir: &job.working_directory,
            cache_dir: &self.config.platformio_core_dir,
        };
        log.write_all(header.render().as_bytes()).await?;
        log.flush().await?;

        let (mut child, output) = cmd.spawn_merged().map_err(|source| RunnerError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        tracing::debug!(job_id = %job.id, command = %command_line, "Process spawned");

        let (tx, mut rx) = mpsc::channel::<String>(LINE_BUFFER);
        tokio::task::spawn_blocking(move || forward_lines(output, tx));

        let mut window: VecDeque<String> = VecDeque::with_capacity(TRAILING_WINDOW);
        while let Some(line) = rx.recv().await {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
            log.flush().await?;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if window.len() == TRAILING_WINDOW {
                window.pop_front();
            }
            window.push_back(trimmed.to_string());
            self.sink.feed(trimmed);
        }

        let exit = child.wait().await?;
        let return_code = exit.code().unwrap_or(-1);
        let finished_at = Utc::now();
        let duration_seconds = job
            .started_at
            .map(|start| (finished_at - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        tracing::info!(job_id = %job.id, return_code, duration_seconds, "Process exited");

        let (outcome, trailer_status) = match judge(cmd.kind, return_code, &window) {
            Verdict::Passed => self.collect_artifact().await?,
            Verdict::AuthFailed => (
                Outcome::Failed(AUTH_FAILED_MESSAGE.to_string()),
                TrailerStatus::Failed,
            ),
            Verdict::ProcessFailed => (
                Outcome::Failed(PROCESS_FAILED_MESSAGE.to_string()),
                TrailerStatus::Failed,
            ),
        };

        let trailer = Trailer {
            finished_at,
            return_code,
            duration_seconds,
            status: trailer_status,
        };
        log.write_all(trailer.render().as_bytes()).await?;
        log.flush().await?;
        drop(log);

        let finished = self
            .store
            .update(
                &job.id,
                Box::new(move |job: &mut Job| {
                    job.mark_finished(finished_at);
                    match outcome {
                        Outcome::Success(artifact_ref) => job.succeed(artifact_ref),
                        Outcome::Failed(message) => job.fail(message),
                    }
                }),
            )
            .await?;

        match &finished.error_message {
            Some(message) => {
                tracing::warn!(job_id = %job.id, error = %message, "Job failed")
            }
            None => tracing::info!(
                job_id = %job.id,
                artifact = finished.artifact_ref.as_deref().unwrap_or_default(),
                "Job succeeded",
            ),
        }
        Ok(finished.status)
    }

    async fn collect_artifact(&self) -> Result<(Outcome, TrailerStatus), RunnerError> {
        let job = &self.job;
        match artifact::find_firmware(&job.working_directory, &job.device_name).await? {
            Some(source) => {
                let name = artifact::store_artifact(
                    &source,
                    &self.config.binaries_dir,
                    &job.id,
                    &job.device_name,
                )
                .await
                .map_err(RunnerError::Artifact)?;
                tracing::info!(job_id = %job.id, source = %source.display(), artifact = %name, "Artifact stored");
                Ok((Outcome::Success(name), TrailerStatus::Success))
            }
            None => {
                let message = format!(
                    "Source binary not found in {}",
                    job.working_directory.display()
                );
                tracing::error!(job_id = %job.id, "Process succeeded but {message}");
                Ok((
                    Outcome::Failed(message.clone()),
                    TrailerStatus::FailedWith(message),
                ))
            }
        }
    }
}

/// Read the merged output pipe line by line into `tx` until every writer
/// has closed it. Blocking; runs on the blocking pool. Invalid UTF-8 is
/// replaced.
fn forward_lines(reader: impl Read, tx: mpsc::Sender<String>) {
    let mut reader = io::BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output stream read failed");
                break;
            }
        }
    }
}

async fn append_crash(path: &Path, detail: &str) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(transcript::render_crash(detail).as_bytes())
        .await?;
    file.flush().await
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "execution task cancelled".to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
