//! Rebuild a finished job's event stream from its transcript.
//!
//! The transcript is read lazily, one line at a time, and fed through a
//! fresh [`Classifier`] exactly as the runner fed the live process output,
//! so the replayed events match what live viewers saw.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use esprelay_core::classifier::Classifier;
use esprelay_core::event::LogEvent;
use esprelay_core::transcript::body_line;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Step id used for replay failure milestones.
pub const REPLAY_ERROR_ID: &str = "err";

enum State {
    Unopened,
    Reading(BufReader<File>),
    Done,
}

/// Lazy replay of one transcript. Always ends with exactly one `Close`.
pub struct TranscriptReplay {
    path: PathBuf,
    state: State,
    classifier: Classifier,
    pending: VecDeque<LogEvent>,
    buf: Vec<u8>,
}

impl TranscriptReplay {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: State::Unopened,
            classifier: Classifier::new(),
            pending: VecDeque::new(),
            buf: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match &mut self.state {
                State::Done => return None,
                State::Unopened => match File::open(&self.path).await {
                    Ok(file) => {
                        tracing::debug!(path = %self.path.display(), "Replaying transcript");
                        self.state = State::Reading(BufReader::new(file));
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!(path = %self.path.display(), "Transcript not found");
                        self.fail("Error: Log file not found".to_string());
                    }
                    Err(e) => {
                        tracing::warn!(path = %self.path.display(), error = %e, "Failed to open transcript");
                        self.fail(format!("Error: {e}"));
                    }
                },
                State::Reading(reader) => {
                    self.buf.clear();
                    match reader.read_until(b'\n', &mut self.buf).await {
                        Ok(0) => {
                            self.pending.extend(self.classifier.finalize());
                            self.pending.push_back(LogEvent::Close);
                            self.state = State::Done;
                        }
                        Ok(_) => {
                            let raw = String::from_utf8_lossy(&self.buf);
                            if let Some(line) = body_line(&raw) {
                                self.pending.extend(self.classifier.classify(line));
                            }
                        }
                        Err(e) => {
                            tracing::warn!(path = %self.path.display(), error = %e, "Transcript read failed");
                            self.fail(format!("Error: {e}"));
                        }
                    }
                }
            }
        }
    }

    /// Drain the whole replay into a vector.
    pub async fn collect(mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    fn fail(&mut self, name: String) {
        self.pending.push_back(LogEvent::Milestone {
            name,
            id: REPLAY_ERROR_ID.to_string(),
            line: None,
        });
        self.pending.push_back(LogEvent::Close);
        self.state = State::Done;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
