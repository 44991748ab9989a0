//! Shared fixtures for worker integration tests.
//!
//! Fake toolchains are shell scripts run through `/bin/sh`, configured the
//! same way an operator would point `COMPILE_PROGRAM` at a wrapper.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use esprelay_core::event::LogEvent;
use esprelay_core::job::{Credential, Job};
use esprelay_core::types::JobId;
use esprelay_db::{JobStore, MemoryJobStore};
use esprelay_events::{EventBroadcaster, Subscription};
use esprelay_worker::config::ToolProgram;
use esprelay_worker::{ProcessRunner, RelayConfig};
use tempfile::TempDir;

/// Compile tool that prints a short build and leaves a firmware image in
/// the build directory of the device named after the entry YAML.
pub const COMPILE_OK: &str = r#"
dev=$(basename "$2" .yaml)
echo "INFO Reading configuration $2..."
echo "INFO Generating C++ code..."
echo "Compiling .pioenvs/$dev/src/main.cpp.o"
echo "Compiling .pioenvs/$dev/src/sensor.cpp.o"
echo "Archiving .pioenvs/$dev/libcore.a"
echo "Linking .pioenvs/$dev/firmware.elf"
echo "RAM:   [=         ]  10.2% (used 33412 bytes from 327680 bytes)"
mkdir -p ".esphome/build/$dev/.pioenvs/$dev"
printf 'fw' > ".esphome/build/$dev/.pioenvs/$dev/firmware.bin"
echo "INFO Successfully compiled program."
"#;

pub struct Harness {
    pub tmp: TempDir,
    pub config: Arc<RelayConfig>,
    pub store: Arc<dyn JobStore>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub runner: Arc<ProcessRunner>,
}

/// Write `body` as a shell script under `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn sh(key: &'static str, script: &Path) -> ToolProgram {
    ToolProgram::parse(key, &format!("/bin/sh {}", script.display())).unwrap()
}

impl Harness {
    /// A runner whose compile and upload tools are the given script bodies.
    pub fn new(compile: &str, upload: &str) -> Self {
        Self::with(|config, tmp| {
            config.compile_program = sh("COMPILE_PROGRAM", &write_script(tmp, "compile.sh", compile));
            config.upload_program = sh("UPLOAD_PROGRAM", &write_script(tmp, "upload.sh", upload));
        })
    }

    pub fn with(customize: impl FnOnce(&mut RelayConfig, &Path)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::rooted_at(tmp.path().join("jobs"));
        customize(&mut config, tmp.path());
        config.ensure_directories().unwrap();

        let config = Arc::new(config);
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let broadcaster = Arc::new(EventBroadcaster::default());
        let runner = Arc::new(ProcessRunner::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            Arc::clone(&config),
        ));
        Self {
            tmp,
            config,
            store,
            broadcaster,
            runner,
        }
    }

    /// Insert a pending compile job for a fresh project named `device`.
    pub async fn compile_job(&self, device: &str) -> Job {
        let project = self.config.projects_dir.join(device);
        std::fs::create_dir_all(&project).unwrap();
        let entry = format!("{device}.yaml");
        std::fs::write(project.join(&entry), format!("esphome:\n  name: {device}\n")).unwrap();

        let id = JobId::generate();
        let job = Job::compile(
            id.clone(),
            project,
            entry,
            device,
            self.config.transcript_path(&id),
        );
        self.store.insert(job.clone()).await.unwrap();
        job
    }

    /// Run a compile job for `device` to completion and insert a pending
    /// upload job derived from it.
    pub async fn upload_job(&self, device: &str, credential: Option<Credential>) -> Job {
        let compile = self.compile_job(device).await;
        self.runner.run(&compile.id).await.unwrap();
        let compiled = self.job(&compile.id).await;

        let id = JobId::generate();
        let job = Job::upload_from(
            id.clone(),
            &compiled,
            "kitchen.local",
            credential,
            self.config.transcript_path(&id),
        )
        .unwrap();
        self.store.insert(job.clone()).await.unwrap();
        job
    }

    pub async fn job(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap().unwrap()
    }

    pub fn transcript(&self, job: &Job) -> String {
        std::fs::read_to_string(&job.transcript_path).unwrap()
    }
}

/// Drain a subscription up to and including `Close`.
pub async fn drain(mut subscription: Subscription) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.recv().await {
        let close = event.is_close();
        events.push(event);
        if close {
            break;
        }
    }
    events
}

pub fn milestones(events: &[LogEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            LogEvent::Milestone { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect()
}
