//! Per-run job report.
//!
//! A `JobReport` collects typed entries while a job runs and is rendered once
//! at the end for the notification channels. Every entry is also mirrored to
//! `tracing` as it is recorded.
//!
//! The report is a cheap handle around shared state so that the progress
//! ticker and the job body (which runs on its own task) can append to it, and
//! so that it survives a panic in the job body.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

const RULE: &str = "========================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Start,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    Step { name: String, status: StepStatus },
    Progress { path: String, processed: u64, total: u64, percent: f64 },
    Info,
    /// Degraded but accepted (e.g. upload skipped by the fast-path cooldown).
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub at: DateTime<Local>,
    pub kind: EntryKind,
    pub message: String,
}

impl ReportEntry {
    fn is_error(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Error | EntryKind::Step { status: StepStatus::Failed, .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Ok,
    Degraded,
    Failed,
}

impl ReportStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReportStatus::Ok => "OK",
            ReportStatus::Degraded => "DEGRADED",
            ReportStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug)]
struct ReportState {
    job_id: String,
    started: DateTime<Local>,
    entries: Vec<ReportEntry>,
    finished: bool,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    inner: Arc<Mutex<ReportState>>,
}

impl JobReport {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self::starting_at(job_id, Local::now())
    }

    pub fn starting_at(job_id: impl Into<String>, started: DateTime<Local>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ReportState {
                job_id: job_id.into(),
                started,
                entries: Vec::new(),
                finished: false,
            })),
        }
    }

    /// A finished report holding a single informational line.
    pub fn single(job_id: impl Into<String>, text: impl Into<String>) -> Self {
        let report = Self::new(job_id);
        report.push(EntryKind::Info, text.into());
        report.state().finished = true;
        report
    }

    // A panic while the lock is held must not lose the report.
    fn state(&self) -> MutexGuard<'_, ReportState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, kind: EntryKind, message: String) {
        let mut state = self.state();
        if state.finished {
            warn!(job = %state.job_id, message = %message, "Entry recorded after report was finished");
        }
        state.entries.push(ReportEntry {
            at: Local::now(),
            kind,
            message,
        });
    }

    pub fn job_id(&self) -> String {
        self.state().job_id.clone()
    }

    pub fn step_start(&self, name: &str) {
        let job = self.job_id();
        info!(job = %job, step = %name, "Step started");
        self.push(
            EntryKind::Step { name: name.to_string(), status: StepStatus::Start },
            format!("[{}] {} started", job, name),
        );
    }

    pub fn step_success(&self, name: &str) {
        let job = self.job_id();
        info!(job = %job, step = %name, "Step succeeded");
        self.push(
            EntryKind::Step { name: name.to_string(), status: StepStatus::Success },
            format!("[{}] {} succeeded", job, name),
        );
    }

    pub fn step_failed(&self, name: &str, err: &dyn std::fmt::Display) {
        let job = self.job_id();
        error!(job = %job, step = %name, error = %err, "Step failed");
        self.push(
            EntryKind::Step { name: name.to_string(), status: StepStatus::Failed },
            format!("[{}] {} failed: {}", job, name, err),
        );
    }

    pub fn progress(&self, path: &str, processed: u64, total: u64, percent: f64) {
        let job = self.job_id();
        info!(job = %job, path = %path, processed, total, "Progress {:.1}%", percent);
        self.push(
            EntryKind::Progress { path: path.to_string(), processed, total, percent },
            format!(
                "progress: {} - {} / {} ({:.1}%)",
                path,
                format_bytes(processed),
                format_bytes(total),
                percent
            ),
        );
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(job = %self.job_id(), "{}", message);
        self.push(EntryKind::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(job = %self.job_id(), "{}", message);
        self.push(EntryKind::Warning, message);
    }

    pub fn error(&self, message: &str, err: &dyn std::fmt::Display) {
        error!(job = %self.job_id(), error = %err, "{}", message);
        self.push(EntryKind::Error, format!("{}: {}", message, err));
    }

    /// Close the report by appending the total duration. Returns `true` only
    /// for the first call, so the caller delivers it exactly once.
    pub fn finish(&self) -> bool {
        let (job, started) = {
            let state = self.state();
            if state.finished {
                return false;
            }
            (state.job_id.clone(), state.started)
        };
        let elapsed = Local::now() - started;
        self.info(format!("[{}] total duration: {}", job, format_duration(elapsed)));
        self.state().finished = true;
        true
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    pub fn entries(&self) -> Vec<ReportEntry> {
        self.state().entries.clone()
    }

    pub fn has_errors(&self) -> bool {
        self.state().entries.iter().any(ReportEntry::is_error)
    }

    pub fn status(&self) -> ReportStatus {
        if self.has_errors() {
            ReportStatus::Failed
        } else if self.state().entries.iter().any(|e| e.kind == EntryKind::Warning) {
            ReportStatus::Degraded
        } else {
            ReportStatus::Ok
        }
    }

    /// Plain-text rendering: header with status, summary, errors (if any)
    /// and the chronological details.
    pub fn render_plain(&self) -> String {
        let status = self.status();
        let state = self.state();
        let ended = state.entries.last().map(|e| e.at).unwrap_or(state.started);

        let mut out = format!(
            "{rule}\nBackup job: {job}\nStatus: {status}\n{rule}\n\n\
             Summary\n  Started: {started}\n  Finished: {finished}\n  Duration: {duration}\n\n",
            rule = RULE,
            job = state.job_id,
            status = status.label(),
            started = format_timestamp(&state.started),
            finished = format_timestamp(&ended),
            duration = format_duration(ended - state.started),
        );

        let errors: Vec<&ReportEntry> = state.entries.iter().filter(|e| e.is_error()).collect();
        if !errors.is_empty() {
            out.push_str("Errors\n");
            for entry in errors {
                if let EntryKind::Step { name, .. } = &entry.kind {
                    out.push_str(&format!("  Step: {}\n", name));
                }
                out.push_str(&format!(
                    "  Detail: {}\n  At: {}\n\n",
                    entry.message,
                    format_timestamp(&entry.at)
                ));
            }
        }

        out.push_str("Details\n");
        for entry in &state.entries {
            out.push_str(&format!(
                "{} {}\n",
                format_relative(&state.started, &entry.at),
                entry.message
            ));
        }
        out
    }

    /// Timestamped entry lines joined with `<br/>` for HTML mail.
    pub fn render_html(&self) -> String {
        self.entries()
            .iter()
            .map(|e| html_escape(&format!("{}: {}", format_timestamp(&e.at), e.message)))
            .collect::<Vec<_>>()
            .join("<br/>")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let units = ["KB", "MB", "GB", "TB", "PB", "EB"];
    let mut value = bytes as f64 / UNIT as f64;
    let mut idx = 0;
    while value >= UNIT as f64 && idx < units.len() - 1 {
        value /= UNIT as f64;
        idx += 1;
    }
    format!("{:.1} {}", value, units[idx])
}

pub fn format_duration(d: chrono::Duration) -> String {
    let total = d.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_timestamp(t: &DateTime<Local>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_relative(start: &DateTime<Local>, at: &DateTime<Local>) -> String {
    let total = (*at - *start).num_seconds().max(0);
    format!("[{:02}:{:02}:{:02}]", total / 3600, (total % 3600) / 60, total % 60)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
