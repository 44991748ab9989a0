//! Job record storage.
//!
//! Components receive an `Arc<dyn JobStore>` rather than reaching for a
//! global map. Every mutation goes through [`JobStore::update`], which is
//! an atomic read-modify-write for one job id.

pub mod job_store;
pub mod memory;

pub use job_store::{JobMutation, JobStore};
pub use memory::MemoryJobStore;
