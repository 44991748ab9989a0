use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use esprelay_core::event::LogEvent;
use esprelay_core::job::{Job, JobStatus};
use esprelay_db::{JobStore, MemoryJobStore};
use esprelay_events::{EventBroadcaster, LogStream};
use esprelay_worker::{Capacity, ProcessRunner, RelayConfig, Submission, TaskDispatcher, UploadedFile};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "esprelay_worker=debug,esprelay_events=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let configs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if configs.is_empty() {
        anyhow::bail!("usage: esprelay-worker <device.yaml>...");
    }

    let config = Arc::new(RelayConfig::from_env()?);
    config.ensure_directories()?;
    tracing::info!(
        jobs_dir = %config.jobs_dir.display(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        version = %config.app_version,
        "Worker starting",
    );

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let broadcaster = Arc::new(EventBroadcaster::new(config.subscriber_buffer));
    let runner = Arc::new(ProcessRunner::new(
        Arc::clone(&store),
        Arc::clone(&broadcaster),
        Arc::clone(&config),
    ));
    let dispatcher = TaskDispatcher::new(
        Arc::clone(&store),
        runner,
        Capacity::new(config.max_concurrent_jobs),
    );
    let submission = Submission::new(Arc::clone(&store), dispatcher.queue(), Arc::clone(&config));

    let cancel = CancellationToken::new();
    let dispatch = tokio::spawn(dispatcher.run(cancel.clone()));

    let mut followers = JoinSet::new();
    for path in &configs {
        let files = collect_files(&config, path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let job = submission.compile(files).await?;
        let stream = LogStream::open(store.as_ref(), &broadcaster, &job.id).await?;
        followers.spawn(follow(job, stream));
    }

    tokio::select! {
        _ = async {
            while let Some(joined) = followers.join_next().await {
                match joined {
                    Ok(()) => {}
                    Err(e) => tracing::error!(error = %e, "Follower task failed"),
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, waiting for running jobs");
        }
    }

    cancel.cancel();
    dispatch.await.context("Dispatcher task failed")?;

    let mut failed = 0usize;
    for job in store.list().await? {
        tracing::info!(
            job_id = %job.id,
            device = %job.device_name,
            status = %job.status,
            artifact = job.artifact_ref.as_deref().unwrap_or_default(),
            error = job.error_message.as_deref().unwrap_or_default(),
            "Job summary",
        );
        if job.status != JobStatus::Success {
            failed += 1;
        }
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The device YAML plus any secrets and headers sitting next to it.
async fn collect_files(config: &RelayConfig, path: &Path) -> anyhow::Result<Vec<UploadedFile>> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Config path has no file name")?;
    let mut files = vec![UploadedFile::new(name, tokio::fs::read(path).await?)];

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(sibling) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if config.is_secret_file(&sibling) || sibling.ends_with(".h") {
            files.push(UploadedFile::new(sibling, tokio::fs::read(entry.path()).await?));
        }
    }
    Ok(files)
}

async fn follow(job: Job, mut stream: LogStream) {
    let device = job.device_name;
    while let Some(event) = stream.next().await {
        match event {
            LogEvent::Milestone { name, id, .. } => {
                tracing::info!(job_id = %job.id, device = %device, step = %id, "{name}")
            }
            LogEvent::UpdateSummary { target_id, text } => {
                tracing::info!(job_id = %job.id, device = %device, step = %target_id, "{text}")
            }
            LogEvent::Progress { name, bar, percent } => {
                tracing::debug!(job_id = %job.id, device = %device, "{name} {bar} {percent}")
            }
            LogEvent::Log { line } => {
                tracing::debug!(job_id = %job.id, device = %device, "{line}")
            }
            LogEvent::Close => break,
        }
    }
}
