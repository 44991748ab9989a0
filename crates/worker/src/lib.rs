//! Job execution: configuration, the process runner, the bounded
//! dispatcher and the submission entry points.

pub mod artifact;
pub mod capacity;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod runner;
pub mod submit;

pub use capacity::Capacity;
pub use config::{ConfigError, RelayConfig};
pub use dispatcher::{DispatchQueue, TaskDispatcher};
pub use runner::{ProcessRunner, RunnerError};
pub use submit::{SubmitError, Submission, UploadedFile};
