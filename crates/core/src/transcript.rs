//! Transcript file format.
//!
//! A transcript is plain text: a header block written by the runner, the
//! raw tool output, then a trailer block. Header and trailer lines start
//! with one of [`HOUSEKEEPING_PREFIXES`]; everything else is tool output
//! and gets classified, both live and on replay.

use std::path::Path;

use crate::job::{Credential, JobKind};
use crate::types::{JobId, Timestamp};

/// Forty dashes, closing the header and opening the trailer.
pub const SEPARATOR: &str = "----------------------------------------";

/// Line prefixes written by the runner rather than the toolchain.
pub const HOUSEKEEPING_PREFIXES: [&str; 8] = [
    "---",
    "Command:",
    "Project Dir:",
    "PlatformIO Cache:",
    "Env:",
    "Return Code:",
    "Duration:",
    "Status:",
];

pub fn is_housekeeping(line: &str) -> bool {
    HOUSEKEEPING_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Trim a raw transcript or process line and return it if it should be
/// classified. Blank and housekeeping lines yield `None`.
pub fn body_line(raw: &str) -> Option<&str> {
    let line = raw.trim();
    if line.is_empty() || is_housekeeping(line) {
        None
    } else {
        Some(line)
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Everything the header block records about a run.
#[derive(Debug, Clone)]
pub struct Header<'a> {
    pub version: &'a str,
    pub kind: JobKind,
    pub job_id: &'a JobId,
    pub device_name: &'a str,
    pub credential_set: bool,
    /// Display form of the command line, secrets already redacted.
    pub command: &'a str,
    pub project_dir: &'a Path,
    pub cache_dir: &'a Path,
}

impl Header<'_> {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("--- RUNNING SCRIPT VERSION {} ---\n", self.version));
        out.push_str(&format!(
            "--- Starting {} job {} for project '{}' ---\n",
            self.kind.banner(),
            self.job_id,
            self.device_name
        ));
        if self.credential_set {
            out.push_str(&format!(
                "Env: ESPHOME_API_PASSWORD set to '{}'\n",
                Credential::REDACTED
            ));
        }
        out.push_str(&format!("Command: {}\n", self.command));
        out.push_str(&format!("Project Dir: {}\n", self.project_dir.display()));
        out.push_str(&format!("PlatformIO Cache: {}\n", self.cache_dir.display()));
        out.push_str(SEPARATOR);
        out.push_str("\n\n");
        out
    }
}

// ---------------------------------------------------------------------------
// Trailer
// ---------------------------------------------------------------------------

/// Outcome recorded in the final `Status:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrailerStatus {
    Success,
    Failed,
    FailedWith(String),
}

#[derive(Debug, Clone)]
pub struct Trailer {
    pub finished_at: Timestamp,
    pub return_code: i32,
    pub duration_seconds: f64,
    pub status: TrailerStatus,
}

impl Trailer {
    pub fn render(&self) -> String {
        let status = match &self.status {
            TrailerStatus::Success => "SUCCESS".to_string(),
            TrailerStatus::Failed => "FAILED".to_string(),
            TrailerStatus::FailedWith(reason) => format!("FAILED ({reason})"),
        };
        format!(
            "\n{SEPARATOR}\n--- Job finished at {} ---\nReturn Code: {}\nDuration: {:.2} seconds\nStatus: {status}\n",
            self.finished_at.to_rfc3339(),
            self.return_code,
            self.duration_seconds,
        )
    }
}

/// The line appended (and classified) when the runner itself fails.
pub fn crash_line(detail: &str) -> String {
    format!("Error: {detail}")
}

/// Block appended to the transcript on a runner crash.
pub fn render_crash(detail: &str) -> String {
    format!("\n--- RUNNER CRASHED ---\n{}\n", crash_line(detail))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
