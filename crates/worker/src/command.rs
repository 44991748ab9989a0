//! External toolchain command lines.
//!
//! Upload jobs flash an existing project with the upload tool; everything
//! else compiles the entry YAML with the compile tool from inside the
//! project directory.

use std::io::{self, PipeReader};
use std::path::PathBuf;
use std::process::Stdio;

use esprelay_core::job::{Credential, Job, JobKind};
use tokio::process::{Child, Command};

use crate::config::{RelayConfig, ToolProgram};

pub const PLATFORMIO_CORE_DIR_ENV: &str = "PLATFORMIO_CORE_DIR";
pub const API_PASSWORD_ENV: &str = "ESPHOME_API_PASSWORD";

/// A fully resolved child invocation for one job.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub kind: JobKind,
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Plain environment additions. The credential is kept apart and only
    /// injected by [`to_command`](Self::to_command).
    pub env: Vec<(String, String)>,
    credential: Option<Credential>,
}

impl ToolCommand {
    pub fn for_job(config: &RelayConfig, job: &Job) -> Self {
        let kind = job.effective_kind();
        let (tool, args, current_dir) = match (kind, &job.upload_target) {
            (JobKind::Upload, Some(target)) => (
                &config.upload_program,
                vec![
                    "run".to_string(),
                    "--target".to_string(),
                    "upload".to_string(),
                    "--project-dir".to_string(),
                    job.working_directory.display().to_string(),
                    "--environment".to_string(),
                    job.device_name.clone(),
                    "--upload-port".to_string(),
                    target.clone(),
                ],
                None,
            ),
            _ => (
                &config.compile_program,
                vec!["compile".to_string(), job.entry_file.clone()],
                Some(job.working_directory.clone()),
            ),
        };

        Self::assemble(kind, tool, args, current_dir, config, job.upload_credential.clone())
    }

    fn assemble(
        kind: JobKind,
        tool: &ToolProgram,
        args: Vec<String>,
        current_dir: Option<PathBuf>,
        config: &RelayConfig,
        credential: Option<Credential>,
    ) -> Self {
        let env = vec![(
            PLATFORMIO_CORE_DIR_ENV.to_string(),
            config.platformio_core_dir.display().to_string(),
        )];

        Self {
            kind,
            program: tool.program.clone(),
            args: tool.leading_args.iter().cloned().chain(args).collect(),
            current_dir,
            env,
            credential,
        }
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// The command line as written to the transcript: any occurrence of the
    /// credential is masked.
    pub fn display(&self) -> String {
        let line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        match &self.credential {
            Some(credential) if !credential.expose().is_empty() => {
                line.replace(credential.expose(), Credential::REDACTED)
            }
            _ => line,
        }
    }

    /// A tokio command with arguments, environment and working directory
    /// set. Output streams are left to the caller. The child is killed if
    /// the handle is dropped.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(credential) = &self.credential {
            cmd.env(API_PASSWORD_ENV, credential.expose());
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Spawn with stdout and stderr writing into the same pipe, so output
    /// is read back in the order the tool wrote it. The reader hits EOF once
    /// the child and anything it spawned have closed their ends.
    pub fn spawn_merged(&self) -> io::Result<(Child, PipeReader)> {
        let (reader, writer) = io::pipe()?;
        let mut cmd = self.to_command();
        cmd.stdout(writer.try_clone()?).stderr(writer);
        let child = cmd.spawn()?;
        // `cmd` still holds our copies of the write end; drop them here.
        drop(cmd);
        Ok((child, reader))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use esprelay_core::types::JobId;

    use super::*;

    fn config() -> RelayConfig {
        RelayConfig::rooted_at("/jobs")
    }

    fn compile_job() -> Job {
        Job::compile(
            JobId::from("j1"),
            "/jobs/projects/kitchen",
            "kitchen.yaml",
            "kitchen",
            "/jobs/logs/j1.log",
        )
    }

    fn upload_job(credential: Option<&str>) -> Job {
        let mut original = compile_job();
        original.mark_running(chrono::Utc::now()).unwrap();
        original.succeed("j1-kitchen-firmware.bin").unwrap();
        Job::upload_from(
            JobId::from("u1"),
            &original,
            "192.168.1.50",
            credential.map(Credential::new),
            "/jobs/logs/u1.log",
        )
        .unwrap()
    }

    #[test]
    fn compile_runs_in_project_dir() {
        let cmd = ToolCommand::for_job(&config(), &compile_job());
        assert_eq!(cmd.kind, JobKind::Compile);
        assert_eq!(cmd.display(), "esphome compile kitchen.yaml");
        assert_eq!(cmd.current_dir, Some(PathBuf::from("/jobs/projects/kitchen")));
        assert_eq!(
            cmd.env,
            vec![(
                "PLATFORMIO_CORE_DIR".to_string(),
                "/jobs/platformio_cache".to_string()
            )]
        );
    }

    #[test]
    fn upload_targets_port() {
        let cmd = ToolCommand::for_job(&config(), &upload_job(None));
        assert_eq!(cmd.kind, JobKind::Upload);
        assert_eq!(
            cmd.display(),
            "platformio run --target upload --project-dir /jobs/projects/kitchen \
             --environment kitchen --upload-port 192.168.1.50"
        );
        assert!(cmd.current_dir.is_none());
        assert!(!cmd.has_credential());
    }

    #[test]
    fn credential_goes_to_env_never_to_display() {
        let cmd = ToolCommand::for_job(&config(), &upload_job(Some("hunter2")));
        assert!(cmd.has_credential());
        assert!(!cmd.display().contains("hunter2"));
        assert!(!format!("{cmd:?}").contains("hunter2"));

        let child = cmd.to_command();
        let password = child
            .as_std()
            .get_envs()
            .find(|(k, _)| *k == "ESPHOME_API_PASSWORD")
            .and_then(|(_, v)| v);
        assert_eq!(password, Some(std::ffi::OsStr::new("hunter2")));
    }

    #[test]
    fn credential_in_target_is_masked() {
        let mut job = upload_job(Some("secret.local"));
        job.upload_target = Some("secret.local".into());
        let cmd = ToolCommand::for_job(&config(), &job);
        assert!(cmd.display().ends_with("--upload-port ********"));
    }

    #[test]
    fn upload_without_target_compiles() {
        let mut job = upload_job(None);
        job.upload_target = None;
        let cmd = ToolCommand::for_job(&config(), &job);
        assert_eq!(cmd.kind, JobKind::Compile);
        assert_eq!(cmd.args, vec!["compile", "kitchen.yaml"]);
    }

    #[test]
    fn leading_args_come_first() {
        let mut config = config();
        config.compile_program = ToolProgram::parse("COMPILE_PROGRAM", "python -m esphome").unwrap();
        let cmd = ToolCommand::for_job(&config, &compile_job());
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["-m", "esphome", "compile", "kitchen.yaml"]);
    }
}
