pub mod classifier;
pub mod device;
pub mod error;
pub mod event;
pub mod job;
pub mod naming;
pub mod transcript;
pub mod types;
