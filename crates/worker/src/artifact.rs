//! Locate the firmware produced by a build and store it as an artifact.

use std::io;
use std::path::{Path, PathBuf};

use esprelay_core::naming::{artifact_name, FIRMWARE_FILENAME};
use esprelay_core::types::JobId;

/// Build output directory the toolchain writes for `device_name`.
pub fn build_dir(project_dir: &Path, device_name: &str) -> PathBuf {
    project_dir.join(".esphome").join("build").join(device_name)
}

/// Depth-first search of the device's build directory for the firmware
/// image. Directory entries are visited in name order so the result is
/// stable when several images exist.
pub async fn find_firmware(project_dir: &Path, device_name: &str) -> io::Result<Option<PathBuf>> {
    let root = build_dir(project_dir, device_name);
    if !tokio::fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
        return Ok(None);
    }

    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                subdirs.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }

        if let Some(found) = files
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == FIRMWARE_FILENAME))
        {
            return Ok(Some(found));
        }
        subdirs.sort();
        stack.extend(subdirs.into_iter().rev());
    }
    Ok(None)
}

/// Copy `source` into `binaries_dir` under the job's artifact name and
/// return that name.
pub async fn store_artifact(
    source: &Path,
    binaries_dir: &Path,
    job_id: &JobId,
    device_name: &str,
) -> io::Result<String> {
    let name = artifact_name(job_id, device_name);
    tokio::fs::create_dir_all(binaries_dir).await?;
    tokio::fs::copy(source, binaries_dir.join(&name)).await?;
    Ok(name)
}
