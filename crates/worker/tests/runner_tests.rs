//! Integration tests for the process runner.
//!
//! Each test drives a real child process (a `/bin/sh` script standing in
//! for the toolchain) from `pending` to a terminal status and checks the
//! job record, the transcript and the live event stream.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{drain, milestones, Harness, COMPILE_OK};
use esprelay_core::classifier::COMPILE_STEP;
use esprelay_core::error::CoreError;
use esprelay_core::event::LogEvent;
use esprelay_core::job::{Credential, JobStatus};
use esprelay_core::types::JobId;
use esprelay_events::{LogStream, TranscriptReplay};
use esprelay_worker::config::ToolProgram;
use esprelay_worker::runner::{claim, AUTH_FAILED_MESSAGE, PROCESS_FAILED_MESSAGE};

// ---------------------------------------------------------------------------
// Test: compile lifecycle
// ---------------------------------------------------------------------------

/// A compile that exits 0 and leaves a firmware image ends `success` with
/// the image copied into the binaries directory under a job-scoped name.
#[tokio::test]
async fn compile_success_stores_artifact() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;

    let status = h.runner.run(&job.id).await.unwrap();

    assert_eq!(status, JobStatus::Success);
    let done = h.job(&job.id).await;
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.error_message, None);
    let artifact = done.artifact_ref.expect("artifact should be recorded");
    assert_eq!(artifact, format!("{}-kitchen-firmware.bin", job.id));
    assert_eq!(std::fs::read(h.config.binaries_dir.join(&artifact)).unwrap(), b"fw");
    assert!(done.started_at.is_some());
    assert!(done.finished_at >= done.started_at);
    assert!(done.duration_seconds.is_some());
}

/// The transcript carries the header, the raw output and a trailer.
#[tokio::test]
async fn transcript_has_header_output_and_trailer() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;
    h.runner.run(&job.id).await.unwrap();

    let transcript = h.transcript(&job);
    assert!(transcript.starts_with("--- RUNNING SCRIPT VERSION "));
    assert!(transcript.contains(&format!("--- Starting COMPILE job {} for project 'kitchen' ---", job.id)));
    assert!(transcript.contains("Command: /bin/sh "));
    assert!(transcript.contains("Linking .pioenvs/kitchen/firmware.elf"));
    assert!(transcript.contains("Return Code: 0"));
    assert!(transcript.ends_with("Status: SUCCESS\n"));
}

/// A compile that exits 0 without producing an image fails with the
/// missing-binary message, and the trailer says why.
#[tokio::test]
async fn compile_without_artifact_fails() {
    let h = Harness::new("echo 'INFO Successfully compiled program.'", "exit 1");
    let job = h.compile_job("kitchen").await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);

    let done = h.job(&job.id).await;
    let message = done.error_message.expect("failure should carry a message");
    assert!(message.starts_with("Source binary not found in "), "got {message}");
    assert_eq!(done.artifact_ref, None);
    assert!(h.transcript(&job).contains("Status: FAILED (Source binary not found in "));
}

/// A non-zero exit is a plain process failure.
#[tokio::test]
async fn non_zero_exit_fails() {
    let h = Harness::new("echo 'Error: something broke' >&2\nexit 2", "exit 1");
    let job = h.compile_job("kitchen").await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);

    let done = h.job(&job.id).await;
    assert_eq!(done.error_message.as_deref(), Some(PROCESS_FAILED_MESSAGE));
    let transcript = h.transcript(&job);
    assert!(transcript.contains("Error: something broke"));
    assert!(transcript.contains("Return Code: 2"));
}

// ---------------------------------------------------------------------------
// Test: upload lifecycle
// ---------------------------------------------------------------------------

/// An upload needs a success marker in its last lines; exit code 0 alone
/// is not enough.
#[tokio::test]
async fn upload_without_marker_fails() {
    let h = Harness::new(COMPILE_OK, "echo 'INFO OTA done'\nexit 0");
    let job = h.upload_job("kitchen", None).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);
    assert_eq!(
        h.job(&job.id).await.error_message.as_deref(),
        Some(PROCESS_FAILED_MESSAGE)
    );
}

/// The upload tool receives the password through its environment, and the
/// password never reaches the transcript.
#[tokio::test]
async fn upload_success_keeps_credential_out_of_transcript() {
    let upload = r#"
echo "INFO Uploading to $9"
if [ "$ESPHOME_API_PASSWORD" = "hunter2" ]; then echo "INFO password received"; fi
echo "INFO Successfully uploaded program."
"#;
    let h = Harness::new(COMPILE_OK, upload);
    let job = h.upload_job("kitchen", Some(Credential::new("hunter2"))).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Success);

    let transcript = h.transcript(&job);
    assert!(transcript.contains("--- Starting UPLOAD job"));
    assert!(transcript.contains("INFO Uploading to kitchen.local"));
    assert!(transcript.contains("INFO password received"));
    assert!(transcript.contains(&format!("set to '{}'", Credential::REDACTED)));
    assert!(!transcript.contains("hunter2"));
}

/// Rejected credentials are reported as an authentication failure.
#[tokio::test]
async fn upload_auth_failure_is_reported() {
    let upload = "echo 'ERROR Authentication invalid. Is the password correct?' >&2\nexit 1";
    let h = Harness::new(COMPILE_OK, upload);
    let job = h.upload_job("kitchen", Some(Credential::new("wrong"))).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);
    assert_eq!(
        h.job(&job.id).await.error_message.as_deref(),
        Some(AUTH_FAILED_MESSAGE)
    );
}

// ---------------------------------------------------------------------------
// Test: runner crash
// ---------------------------------------------------------------------------

/// A tool that cannot be started is a runner crash: the job fails with the
/// crash detail, the transcript records it and live viewers see it as an
/// error milestone before `Close`.
#[tokio::test]
async fn spawn_failure_is_recorded_as_crash() {
    let h = Harness::with(|config, _| {
        config.compile_program = ToolProgram::new("/nonexistent/esphome");
    });
    let job = h.compile_job("kitchen").await;
    let subscription = h.broadcaster.subscribe(&job.id);

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);

    let done = h.job(&job.id).await;
    let message = done.error_message.expect("crash should be recorded");
    assert!(message.starts_with("Runner crashed: Failed to start /nonexistent/esphome"), "got {message}");
    assert!(done.finished_at.is_some());

    let transcript = h.transcript(&job);
    assert!(transcript.contains("--- RUNNER CRASHED ---"));
    assert!(transcript.contains("Error: Failed to start /nonexistent/esphome"));

    let events = drain(subscription).await;
    assert!(milestones(&events)
        .iter()
        .any(|m| m.starts_with("Error: Failed to start")));
    assert_eq!(events.last(), Some(&LogEvent::Close));
}

/// A finished job cannot be claimed again, and a refused run publishes
/// nothing.
#[tokio::test]
async fn terminal_job_is_not_rerun() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;
    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Success);
    let before = h.job(&job.id).await;

    let mut subscription = h.broadcaster.subscribe(&job.id);
    assert_matches!(
        h.runner.run(&job.id).await,
        Err(CoreError::InvalidTransition { from: JobStatus::Success, .. })
    );

    let nothing = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
    assert!(nothing.is_err(), "refused run published {nothing:?}");
    assert_eq!(h.job(&job.id).await.finished_at, before.finished_at);
}

/// A second run of a job that is still running is refused and leaves the
/// running job's viewers and status untouched.
#[tokio::test]
async fn running_job_is_not_claimed_twice() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;
    let started = claim(h.store.as_ref(), &job.id).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);

    let mut subscription = h.broadcaster.subscribe(&job.id);
    assert_matches!(
        h.runner.run(&job.id).await,
        Err(CoreError::InvalidTransition { from: JobStatus::Running, .. })
    );
    let nothing = tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await;
    assert!(nothing.is_err(), "refused run published {nothing:?}");
    assert_eq!(h.job(&job.id).await.status, JobStatus::Running);

    // The claimant still runs it to completion and its viewer sees it all.
    assert_eq!(h.runner.execute(started).await, JobStatus::Success);
    let events = drain(subscription).await;
    assert!(events.contains(&LogEvent::log("INFO Successfully compiled program.")));
    assert_eq!(events.iter().filter(|e| e.is_close()).count(), 1);
}

/// Unknown ids are refused as not found.
#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    assert_matches!(
        h.runner.run(&JobId::from("ghost")).await,
        Err(CoreError::NotFound { .. })
    );
}

// ---------------------------------------------------------------------------
// Test: trailing window and output order
// ---------------------------------------------------------------------------

/// A success marker followed by ten more output lines has left the
/// trailing window, so the upload is judged failed.
#[tokio::test]
async fn marker_pushed_out_of_window_fails_upload() {
    let upload = r#"
echo "INFO Successfully uploaded program."
for i in 1 2 3 4 5 6 7 8 9 10; do echo "INFO after upload $i"; done
exit 0
"#;
    let h = Harness::new(COMPILE_OK, upload);
    let job = h.upload_job("kitchen", None).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Failed);
    assert_eq!(
        h.job(&job.id).await.error_message.as_deref(),
        Some(PROCESS_FAILED_MESSAGE)
    );
}

/// With nine lines after it the marker is still the oldest line in the
/// window.
#[tokio::test]
async fn marker_at_window_edge_passes_upload() {
    let upload = r#"
echo "INFO Successfully uploaded program."
for i in 1 2 3 4 5 6 7 8 9; do echo "INFO after upload $i"; done
exit 0
"#;
    let h = Harness::new(COMPILE_OK, upload);
    let job = h.upload_job("kitchen", None).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Success);
}

/// Blank lines do not take up room in the trailing window.
#[tokio::test]
async fn blank_lines_do_not_push_marker_out() {
    let upload = r#"
echo "INFO Successfully uploaded program."
for i in 1 2 3 4 5 6 7 8 9 10 11 12; do echo ""; echo "   "; done
exit 0
"#;
    let h = Harness::new(COMPILE_OK, upload);
    let job = h.upload_job("kitchen", None).await;

    assert_eq!(h.runner.run(&job.id).await.unwrap(), JobStatus::Success);
}

/// stdout and stderr share one pipe, so the transcript keeps the order in
/// which the tool wrote its lines.
#[tokio::test]
async fn interleaved_streams_keep_write_order() {
    let compile = r#"
for i in 1 2 3 4 5; do echo "out $i"; echo "err $i" >&2; done
"#;
    let h = Harness::new(compile, "exit 1");
    let job = h.compile_job("kitchen").await;
    h.runner.run(&job.id).await.unwrap();

    let transcript = h.transcript(&job);
    assert!(
        transcript.contains("out 1\nerr 1\nout 2\nerr 2\nout 3\nerr 3\nout 4\nerr 4\nout 5\nerr 5\n"),
        "got {transcript}"
    );
}

// ---------------------------------------------------------------------------
// Test: live and replay agree
// ---------------------------------------------------------------------------

/// The events a live viewer saw equal the events replayed from the
/// finished transcript, step ids included.
#[tokio::test]
async fn replay_matches_live_stream() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;
    let subscription = h.broadcaster.subscribe(&job.id);

    h.runner.run(&job.id).await.unwrap();
    let live = drain(subscription).await;
    let replayed = TranscriptReplay::new(&job.transcript_path).collect().await;

    assert_eq!(live, replayed);
    assert_eq!(
        milestones(&live),
        vec![
            "Generating C++",
            COMPILE_STEP,
            "Linking Firmware",
            "Calculating Firmware Size",
        ]
    );
    assert!(live.contains(&LogEvent::UpdateSummary {
        target_id: "step-2".into(),
        text: format!("{COMPILE_STEP} (3 files)"),
    }));
    assert!(live.iter().all(|e| !matches!(e, LogEvent::Log { line } if line.starts_with("Return Code"))));
}

/// A crash transcript replays to the same events the live viewer saw.
#[tokio::test]
async fn crash_replay_matches_live_stream() {
    let h = Harness::with(|config, _| {
        config.compile_program = ToolProgram::new("/nonexistent/esphome");
    });
    let job = h.compile_job("kitchen").await;
    let subscription = h.broadcaster.subscribe(&job.id);

    h.runner.run(&job.id).await.unwrap();
    let live = drain(subscription).await;
    let replayed = TranscriptReplay::new(&job.transcript_path).collect().await;

    assert_eq!(live, replayed);
}

/// Opening a stream for a finished job serves the transcript.
#[tokio::test]
async fn stream_for_finished_job_replays() {
    let h = Harness::new(COMPILE_OK, "exit 1");
    let job = h.compile_job("kitchen").await;
    h.runner.run(&job.id).await.unwrap();

    let mut stream = LogStream::open(h.store.as_ref(), &h.broadcaster, &job.id)
        .await
        .unwrap();
    assert!(!stream.is_live());

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    assert_matches!(events.last(), Some(LogEvent::Close));
    assert_eq!(events.iter().filter(|e| e.is_close()).count(), 1);
    assert!(events.contains(&LogEvent::log("INFO Successfully compiled program.")));
}
