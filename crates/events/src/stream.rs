//! Viewer entry point: follow a job live, or replay it once finished.

use esprelay_core::error::CoreError;
use esprelay_core::event::LogEvent;
use esprelay_core::types::JobId;
use esprelay_db::JobStore;

use crate::broadcaster::{EventBroadcaster, Subscription};
use crate::replay::TranscriptReplay;

enum Source {
    Live(Subscription),
    Replay(TranscriptReplay),
}

/// One viewer's event stream. Yields exactly one `Close`, last.
pub struct LogStream {
    source: Source,
    closed: bool,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl LogStream {
    /// Open a stream for `job_id`.
    ///
    /// Terminal jobs are always served from their transcript. For active jobs
    /// the subscription is taken first and the status checked again
    /// afterwards: the runner records the terminal status before publishing
    /// `Close`, so a job that finished in between is caught here and
    /// replayed instead of waiting on a channel nobody will close.
    pub async fn open(
        store: &dyn JobStore,
        broadcaster: &EventBroadcaster,
        job_id: &JobId,
    ) -> Result<Self, CoreError> {
        let job = store
            .get(job_id)
            .await?
            .ok_or_else(|| CoreError::job_not_found(job_id))?;

        if job.is_terminal() {
            return Ok(Self::replay(TranscriptReplay::new(job.transcript_path)));
        }

        let subscription = broadcaster.subscribe(job_id);
        match store.get(job_id).await? {
            Some(job) if job.is_terminal() => {
                drop(subscription);
                tracing::debug!(job_id = %job_id, "Job finished while subscribing, replaying");
                Ok(Self::replay(TranscriptReplay::new(job.transcript_path)))
            }
            Some(_) => Ok(Self {
                source: Source::Live(subscription),
                closed: false,
            }),
            None => Err(CoreError::job_not_found(job_id)),
        }
    }

    fn replay(replay: TranscriptReplay) -> Self {
        Self {
            source: Source::Replay(replay),
            closed: false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.source, Source::Live(_))
    }

    pub async fn next(&mut self) -> Option<LogEvent> {
        if self.closed {
            return None;
        }
        let event = match &mut self.source {
            Source::Live(sub) => sub.recv().await,
            Source::Replay(replay) => replay.next().await,
        };
        match event {
            Some(event) => {
                self.closed = event.is_close();
                Some(event)
            }
            // The entry was released but our Close was dropped on a full
            // buffer; still terminate the stream properly.
            None => {
                self.closed = true;
                Some(LogEvent::Close)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
