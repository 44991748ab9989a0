//! Stateful classifier turning raw toolchain lines into [`LogEvent`]s.
//!
//! [`Classifier`] is a pure state machine: [`Classifier::classify`] takes one
//! line and returns the events it produces, [`Classifier::finalize`] closes
//! whatever aggregation is still open at end of stream. Output depends only
//! on the sequence of lines fed in, so a live run and a replay of the same
//! transcript yield identical events, step ids included.

pub mod rules;

use crate::event::LogEvent;

use self::rules::{LineClass, ProgressLine, STARTING, SUPPRESSED_MILESTONES};

/// Label of the aggregated compile/archive step.
pub const COMPILE_STEP: &str = "Compiling C/C++ Sources & Archiving";

/// Every this many repeated lines the step label is refreshed.
pub const SUMMARY_CADENCE: usize = 25;

/// Per-stream classifier state. Owned by exactly one run or replay.
#[derive(Debug, Clone)]
pub struct Classifier {
    current_milestone: String,
    in_repeat_step: bool,
    repeat_count: usize,
    summary_id: Option<String>,
    steps_opened: u64,
    finalized: bool,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            current_milestone: STARTING.to_string(),
            in_repeat_step: false,
            repeat_count: 0,
            summary_id: None,
            steps_opened: 0,
            finalized: false,
        }
    }

    pub fn current_milestone(&self) -> &str {
        &self.current_milestone
    }

    /// Classify one (already trimmed) line.
    pub fn classify(&mut self, line: &str) -> Vec<LogEvent> {
        let mut events = Vec::new();

        match rules::classify_line(line) {
            LineClass::RepeatStep => self.repeat_step(line, &mut events),
            LineClass::Milestone(name) => {
                self.enter_milestone(&name, &mut events);
                if !SUPPRESSED_MILESTONES.contains(&name.as_str()) {
                    events.push(LogEvent::log(line));
                }
            }
            LineClass::Progress(progress) => self.progress(progress, &mut events),
            LineClass::Plain => events.push(LogEvent::log(line)),
        }

        events
    }

    /// Close a still-open aggregation. Only the first call emits anything.
    pub fn finalize(&mut self) -> Vec<LogEvent> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;
        let mut events = Vec::new();
        self.close_repeat_step(true, &mut events);
        events
    }

    fn next_step_id(&mut self) -> String {
        self.steps_opened += 1;
        format!("step-{}", self.steps_opened)
    }

    fn repeat_step(&mut self, line: &str, events: &mut Vec<LogEvent>) {
        if !self.in_repeat_step {
            let id = self.next_step_id();
            self.in_repeat_step = true;
            self.repeat_count = 1;
            self.current_milestone = COMPILE_STEP.to_string();
            self.summary_id = Some(id.clone());
            events.push(LogEvent::Milestone {
                name: COMPILE_STEP.to_string(),
                id,
                line: Some(line.to_string()),
            });
            return;
        }

        self.repeat_count += 1;
        if self.repeat_count % SUMMARY_CADENCE == 0 {
            if let Some(target_id) = &self.summary_id {
                events.push(LogEvent::UpdateSummary {
                    target_id: target_id.clone(),
                    text: format!("{COMPILE_STEP} ({} files...)", self.repeat_count),
                });
            }
        }
        events.push(LogEvent::log(line));
    }

    fn progress(&mut self, progress: ProgressLine, events: &mut Vec<LogEvent>) {
        if let Some(bucket) = progress.bucket() {
            self.enter_milestone(bucket, events);
        }
        events.push(LogEvent::Progress {
            name: progress.name,
            bar: progress.bar,
            percent: progress.percent,
        });
    }

    /// Open `name` as a new step unless it is already the current one.
    fn enter_milestone(&mut self, name: &str, events: &mut Vec<LogEvent>) {
        if self.current_milestone == name {
            return;
        }
        self.close_repeat_step(false, events);
        let id = self.next_step_id();
        self.current_milestone = name.to_string();
        events.push(LogEvent::Milestone {
            name: name.to_string(),
            id,
            line: None,
        });
    }

    fn close_repeat_step(&mut self, interrupted: bool, events: &mut Vec<LogEvent>) {
        if !self.in_repeat_step {
            return;
        }
        let mut text = format!("{COMPILE_STEP} ({} files)", self.repeat_count);
        if interrupted {
            text.push_str(" - Interrupted");
        }
        if let Some(target_id) = self.summary_id.take() {
            events.push(LogEvent::UpdateSummary { target_id, text });
        }
        self.in_repeat_step = false;
        self.repeat_count = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
