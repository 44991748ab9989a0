//! Artifact naming convention.
//!
//! Artifacts are stored as `{job_id}-{device_name}-firmware.bin` so that
//! every build of the same device keeps its own file.

use crate::types::JobId;

/// Filename the toolchain produces inside the build directory.
pub const FIRMWARE_FILENAME: &str = "firmware.bin";

/// Stored artifact name for a job.
///
/// ```
/// use esprelay_core::naming::artifact_name;
/// use esprelay_core::types::JobId;
///
/// assert_eq!(artifact_name(&JobId::from("j1"), "kitchen"), "j1-kitchen-firmware.bin");
/// ```
pub fn artifact_name(job_id: &JobId, device_name: &str) -> String {
    format!("{job_id}-{device_name}-{FIRMWARE_FILENAME}")
}

/// Name offered to the caller on download: the stored name minus its
/// `{job_id}-` prefix. Names without that prefix are returned unchanged.
pub fn download_name<'a>(job_id: &JobId, artifact_ref: &'a str) -> &'a str {
    artifact_ref
        .strip_prefix(job_id.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(artifact_ref)
}
