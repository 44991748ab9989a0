//! Device name discovery from a device configuration YAML.
//!
//! This is a line scan, not a YAML parse: the first uncommented line
//! containing `name:` wins. Values that are YAML tags (`!secret`,
//! `!include`, ...) are skipped.

use std::path::Path;

/// Extract the device name from configuration text.
pub fn device_name_from_str(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once("name:").map(|(_, value)| value))
        .map(|value| value.trim().trim_matches('"').trim_matches('\''))
        .find(|value| !value.is_empty() && !value.starts_with('!'))
        .map(str::to_string)
}

/// Read `path` and extract its device name.
pub fn device_name_from_yaml(path: &Path) -> std::io::Result<Option<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(device_name_from_str(&contents))
}
