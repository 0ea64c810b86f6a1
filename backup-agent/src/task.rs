//! One backup job: pre-command, archive, post-command, upload, prune, report.
//!
//! The job body runs on its own tokio task. A panic inside it is caught at
//! the join point and turned into a report entry, so the report is always
//! delivered and other jobs keep running.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context};
use chrono::{Duration, Local, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use backup_common::naming::NameCodec;
use backup_common::retention::retention_window;

use crate::archive::{ArchiveProducer, ProgressSink};
use crate::config::{validate_job, JobConfig};
use crate::notify::Notifier;
use crate::report::{format_bytes, JobReport};
use crate::tiered::{has_cooldown_error, has_hard_error, TieredStorage};

/// Lifetime of the download link included in the report.
pub const LINK_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Finished without a hard failure, but something needs attention.
    Degraded,
    Failed(String),
}

impl JobOutcome {
    fn degrade(&mut self) {
        if *self == JobOutcome::Succeeded {
            *self = JobOutcome::Degraded;
        }
    }
}

pub struct BackupTask {
    id: String,
    job: JobConfig,
    staging_dir: PathBuf,
    codec: NameCodec,
    retention: Duration,
    storage: Arc<TieredStorage>,
    notifier: Arc<Notifier>,
    archiver: Arc<dyn ArchiveProducer>,
}

impl BackupTask {
    pub fn new(
        id: &str,
        job: JobConfig,
        staging_dir: PathBuf,
        storage: Arc<TieredStorage>,
        notifier: Arc<Notifier>,
        archiver: Arc<dyn ArchiveProducer>,
    ) -> anyhow::Result<Self> {
        validate_job(id, &job)?;
        Ok(Self {
            id: id.to_string(),
            job,
            staging_dir,
            codec: NameCodec::new(),
            retention: retention_window(),
            storage,
            notifier,
            archiver,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    /// Run the job to completion and deliver its report exactly once.
    pub async fn run(self: &Arc<Self>) -> JobOutcome {
        let run_id = Uuid::new_v4();
        info!(job = %self.id, run = %run_id, source = %self.job.source_path.display(), "Backup run starting");

        let report = JobReport::new(&self.id);
        let body = {
            let task = Arc::clone(self);
            let report = report.clone();
            tokio::spawn(async move { task.execute(run_id, &report).await })
        };

        let outcome = match body.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                report.error("backup run panicked", &message);
                JobOutcome::Failed(format!("panic: {}", message))
            }
            Err(e) => {
                report.error("backup run aborted", &e);
                JobOutcome::Failed(e.to_string())
            }
        };

        if report.finish() {
            self.notifier.notice(&report).await;
        }
        info!(job = %self.id, run = %run_id, outcome = ?outcome, "Backup run finished");
        outcome
    }

    async fn execute(&self, run_id: Uuid, report: &JobReport) -> JobOutcome {
        let mut outcome = JobOutcome::Succeeded;
        let now = Local::now();

        if let Some(cmd) = &self.job.before_command {
            report.step_start("pre-command");
            if let Err(e) = run_command(cmd).await {
                let reason = format!("{:#}", e);
                report.step_failed("pre-command", &reason);
                return JobOutcome::Failed(format!("pre-command failed: {}", reason));
            }
            report.step_success("pre-command");
        }

        // Remote key is per day; the staging directory is per run, so
        // overlapping runs of this job never share a local file.
        let name = self.codec.archive_name(&self.id, &now);
        let staged = StagedArchive::new(self.staging_dir.join(run_id.to_string()), &name);

        report.step_start("archive");
        let progress: Arc<dyn ProgressSink> = Arc::new(report.clone());
        match self
            .archiver
            .produce(&self.job.source_path, staged.path(), progress)
            .await
        {
            Ok(summary) => {
                report.step_success("archive");
                report.info(format!(
                    "archive {} ready: {} files, {} compressed to {}",
                    summary.path.display(),
                    summary.files,
                    format_bytes(summary.source_bytes),
                    format_bytes(summary.archive_bytes)
                ));
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                report.step_failed("archive", &reason);
                return JobOutcome::Failed(format!("archive failed: {}", reason));
            }
        }

        // The archive is already complete, so a failing post-command does not
        // stop the upload.
        if let Some(cmd) = &self.job.after_command {
            report.step_start("post-command");
            match run_command(cmd).await {
                Ok(()) => report.step_success("post-command"),
                Err(e) => {
                    report.step_failed("post-command", &format!("{:#}", e));
                    outcome.degrade();
                }
            }
        }

        report.step_start("upload");
        let sink = {
            let report = report.clone();
            move |message: &str| report.info(message)
        };
        let result = self.storage.upload(&name, staged.path(), &sink).await;
        drop(staged);

        let hard = has_hard_error(&result);
        let cooldown = has_cooldown_error(&result);
        debug!(job = %self.id, hard, cooldown, "Upload finished");
        match result {
            Ok(uploaded) => {
                report.step_success("upload");
                report.info(format!("uploaded {} via {} backend", name, uploaded.backend));
                match self.storage.signed_temporary_link(&name, LINK_TTL).await {
                    Ok(link) => report.info(format!("download link (valid 24h): {}", link)),
                    Err(e) => {
                        report.warning(format!("failed to create download link: {:#}", e));
                        outcome.degrade();
                    }
                }
            }
            Err(e) if hard => {
                report.step_failed("upload", &e);
                return JobOutcome::Failed(format!("upload failed: {}", e));
            }
            Err(e) => {
                report.warning(format!("upload skipped: {}", e));
                outcome.degrade();
            }
        }

        if !self.prune(report).await {
            outcome.degrade();
        }
        outcome
    }

    /// Delete this job's archives that fell out of the retention window.
    /// Returns `false` if the deletion did not fully succeed.
    async fn prune(&self, report: &JobReport) -> bool {
        report.step_start("prune");
        let aged = self
            .storage
            .list_aged_objects(&self.id, Utc::now(), self.retention)
            .await;
        if aged.is_empty() {
            report.info("no aged objects to delete");
            report.step_success("prune");
            return true;
        }

        let keys: Vec<String> = aged.into_iter().map(|o| o.key).collect();
        report.info(format!("deleting {} aged objects", keys.len()));
        match self.storage.delete_objects(&keys).await {
            Ok(summary) => {
                report.info(format!("deleted {} objects", summary.deleted.len()));
                for (key, reason) in &summary.failed {
                    report.error(&format!("failed to delete {}", key), reason);
                }
                if summary.failed.is_empty() {
                    report.step_success("prune");
                    true
                } else {
                    report.step_failed("prune", &format!("{} objects not deleted", summary.failed.len()));
                    false
                }
            }
            Err(e) => {
                report.step_failed("prune", &format!("{:#}", e));
                false
            }
        }
    }
}

impl ProgressSink for JobReport {
    fn progress(&self, path: &str, processed: u64, total: u64, percent: f64) {
        JobReport::progress(self, path, processed, total, percent);
    }

    fn done(&self, total: u64) {
        self.info(format!("compression done: {}", format_bytes(total)));
    }
}

/// Per-run staging directory holding the local archive. The whole
/// directory is removed when the guard goes out of scope, including on early
/// return and panic.
struct StagedArchive {
    dir: PathBuf,
    path: PathBuf,
}

impl StagedArchive {
    fn new(dir: PathBuf, name: &str) -> Self {
        let path = dir.join(name);
        Self { dir, path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedArchive {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staged archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.dir.display(), error = %e, "Failed to remove staging directory"),
        }
    }
}

/// Run `cmd` through `sh -c`; a non-zero exit status is an error carrying
/// the command's stderr.
pub async fn run_command(cmd: &str) -> anyhow::Result<()> {
    debug!(command = %cmd, "Running command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .with_context(|| format!("Failed to spawn '{}'", cmd))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("'{}' exited with {}: {}", cmd, output.status, stderr.trim());
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
