//! Live fan-out and replay of job log events.
//!
//! - [`broadcaster`]: per-job bounded fan-out to live subscribers.
//! - [`replay`]: deterministic reconstruction from a transcript.
//! - [`stream`]: picks one of the two for a viewer.

pub mod broadcaster;
pub mod replay;
pub mod stream;

pub use broadcaster::{EventBroadcaster, Subscription};
pub use replay::TranscriptReplay;
pub use stream::LogStream;
