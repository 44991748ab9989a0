//! Worker configuration loaded from environment variables.

use std::path::PathBuf;

/// Invalid configuration or failed directory bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    NotPositive { key: &'static str, value: String },

    #[error("{key} must not be empty")]
    Empty { key: &'static str },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An external tool invocation prefix, e.g. `esphome` or `python -m esphome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProgram {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolProgram {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Split a whitespace-separated command prefix.
    pub fn parse(key: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ConfigError::Empty { key })?;
        Ok(Self {
            program,
            leading_args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity slots (default: `2`).
    pub max_concurrent_jobs: usize,
    pub jobs_dir: PathBuf,
    /// Transcripts, one `{job_id}.log` per job.
    pub logs_dir: PathBuf,
    /// Persistent per-device project directories.
    pub projects_dir: PathBuf,
    /// Stored firmware artifacts.
    pub binaries_dir: PathBuf,
    /// Toolchain cache, exported to every child as `PLATFORMIO_CORE_DIR`.
    pub platformio_core_dir: PathBuf,
    pub app_version: String,
    /// Per-subscriber event buffer length (default: `256`).
    pub subscriber_buffer: usize,
    pub compile_program: ToolProgram,
    pub upload_program: ToolProgram,
    /// Uploaded files that are never the entry YAML.
    pub secret_filenames: Vec<String>,
}

impl RelayConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var               | Default                      |
    /// |-----------------------|------------------------------|
    /// | `MAX_CONCURRENT_JOBS` | `2`                          |
    /// | `JOBS_DIR`            | `esphome_jobs`               |
    /// | `LOGS_DIR`            | `$JOBS_DIR/logs`             |
    /// | `PROJECTS_DIR`        | `$JOBS_DIR/projects`         |
    /// | `BINARIES_DIR`        | `$JOBS_DIR/binaries`         |
    /// | `PLATFORMIO_CORE_DIR` | `$JOBS_DIR/platformio_cache` |
    /// | `APP_VERSION`         | crate version                |
    /// | `SUBSCRIBER_BUFFER`   | `256`                        |
    /// | `COMPILE_PROGRAM`     | `esphome`                    |
    /// | `UPLOAD_PROGRAM`      | `platformio`                 |
    /// | `SECRET_FILENAMES`    | `secrets.yaml,secrets.yml`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::rooted_at(lookup("JOBS_DIR").unwrap_or_else(|| "esphome_jobs".into()));

        if let Some(value) = lookup("MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = positive("MAX_CONCURRENT_JOBS", &value)?;
        }
        if let Some(value) = lookup("SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = positive("SUBSCRIBER_BUFFER", &value)?;
        }
        for (key, slot) in [
            ("LOGS_DIR", &mut config.logs_dir),
            ("PROJECTS_DIR", &mut config.projects_dir),
            ("BINARIES_DIR", &mut config.binaries_dir),
            ("PLATFORMIO_CORE_DIR", &mut config.platformio_core_dir),
        ] {
            if let Some(value) = lookup(key) {
                *slot = PathBuf::from(value);
            }
        }
        if let Some(value) = lookup("APP_VERSION") {
            config.app_version = value;
        }
        if let Some(value) = lookup("COMPILE_PROGRAM") {
            config.compile_program = ToolProgram::parse("COMPILE_PROGRAM", &value)?;
        }
        if let Some(value) = lookup("UPLOAD_PROGRAM") {
            config.upload_program = ToolProgram::parse("UPLOAD_PROGRAM", &value)?;
        }
        if let Some(value) = lookup("SECRET_FILENAMES") {
            config.secret_filenames = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(config)
    }

    /// Defaults with every directory under `jobs_dir`.
    pub fn rooted_at(jobs_dir: impl Into<PathBuf>) -> Self {
        let jobs_dir = jobs_dir.into();
        Self {
            max_concurrent_jobs: 2,
            logs_dir: jobs_dir.join("logs"),
            projects_dir: jobs_dir.join("projects"),
            binaries_dir: jobs_dir.join("binaries"),
            platformio_core_dir: jobs_dir.join("platformio_cache"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            subscriber_buffer: 256,
            compile_program: ToolProgram::new("esphome"),
            upload_program: ToolProgram::new("platformio"),
            secret_filenames: vec!["secrets.yaml".into(), "secrets.yml".into()],
            jobs_dir,
        }
    }

    /// Create every directory the worker writes into.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.jobs_dir,
            &self.logs_dir,
            &self.projects_dir,
            &self.binaries_dir,
            &self.platformio_core_dir,
        ] {
            if dir.is_dir() {
                continue;
            }
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            tracing::info!(path = %dir.display(), "Created directory");
        }
        Ok(())
    }

    pub fn is_secret_file(&self, filename: &str) -> bool {
        self.secret_filenames.iter().any(|s| s == filename)
    }

    pub fn transcript_path(&self, job_id: &esprelay_core::types::JobId) -> PathBuf {
        self.logs_dir.join(format!("{job_id}.log"))
    }
}

fn positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::NotPositive {
            key,
            value: value.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
