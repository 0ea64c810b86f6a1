mod archive;
mod backend;
mod config;
mod notify;
mod report;
mod scheduler;
mod server;
mod task;
mod tiered;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use archive::ZipArchiver;
use config::AgentConfig;
use notify::Notifier;
use server::TriggerState;
use task::BackupTask;
use tiered::TieredStorage;

const DEFAULT_CONFIG_PATH: &str = "backup-agent.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    info!("backup-agent starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AgentConfig::load(&PathBuf::from(&config_path))?;
    let agent_name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "backup-agent".to_string());
    info!(agent = %agent_name, config = %config_path, jobs = config.jobs.len(), "Configuration loaded");

    let (primary, secondary) = backend::from_config(&config.storage)?;
    let storage = Arc::new(TieredStorage::new(primary, secondary));
    let notifier = Arc::new(Notifier::from_config(&config)?);
    info!(channels = ?notifier.channel_names(), "Notification channels ready");
    let archiver = Arc::new(ZipArchiver::new());
    let staging_dir = config.staging_dir();

    let mut tasks = HashMap::new();
    for (id, job) in &config.jobs {
        let task = BackupTask::new(
            id,
            job.clone(),
            staging_dir.clone(),
            storage.clone(),
            notifier.clone(),
            archiver.clone(),
        )?;
        tasks.insert(id.clone(), Arc::new(task));
    }

    let mut handles = Vec::new();
    for task in tasks.values() {
        handles.extend(scheduler::spawn_job(task.clone(), notifier.clone())?);
    }

    let summary = config
        .jobs
        .iter()
        .map(|(id, job)| format!("{} ({})", id, job.source_path.display()))
        .collect::<Vec<_>>()
        .join(", ");
    notifier
        .notice_text(&agent_name, &format!("backup agent started, jobs: {}", summary))
        .await;

    let state = Arc::new(TriggerState { tasks });
    tokio::select! {
        result = server::serve(&config.listen_addr, state) => {
            if let Err(e) = result {
                error!(error = %format!("{:#}", e), "Trigger server stopped");
                return Err(e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    for handle in handles {
        handle.abort();
    }
    info!("backup-agent stopped");
    Ok(())
}
