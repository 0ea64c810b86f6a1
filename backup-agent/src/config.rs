use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7000";
pub const DEFAULT_BACKUP_SCHEDULE: &str = "0 25 0 * * *";
pub const DEFAULT_LIVENESS_SCHEDULE: &str = "0 0 0 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory archives are written to before upload.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub mail: Option<MailConfig>,
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    S3 {
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        /// Base URL of the bucket on the regular endpoint.
        #[serde(default)]
        endpoint: Option<String>,
        /// Base URL of the bucket on the accelerated endpoint.
        #[serde(default)]
        fast_endpoint: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key: Option<String>,
    },
    Directory {
        path: PathBuf,
        #[serde(default)]
        fast_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default = "default_true")]
    pub starttls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub source_path: PathBuf,
    #[serde(default)]
    pub before_command: Option<String>,
    #[serde(default)]
    pub after_command: Option<String>,
    #[serde(default = "default_backup_schedule")]
    pub schedule: String,
    #[serde(default = "default_liveness_schedule")]
    pub liveness: String,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_backup_schedule() -> String {
    DEFAULT_BACKUP_SCHEDULE.to_string()
}

fn default_liveness_schedule() -> String {
    DEFAULT_LIVENESS_SCHEDULE.to_string()
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.jobs.is_empty() {
            anyhow::bail!("at least one [jobs.<id>] entry is required");
        }
        for (id, job) in &self.jobs {
            validate_job(id, job)?;
        }
        match &self.storage {
            StorageConfig::S3 { bucket, endpoint, fast_endpoint, .. } => {
                if bucket.is_empty() {
                    anyhow::bail!("storage.bucket must not be empty");
                }
                for ep in [endpoint, fast_endpoint].into_iter().flatten() {
                    if !ep.starts_with("http://") && !ep.starts_with("https://") {
                        anyhow::bail!("storage endpoint must be an http(s) URL: {}", ep);
                    }
                }
            }
            StorageConfig::Directory { path, fast_path } => {
                if !path.is_absolute() {
                    anyhow::bail!("storage.path must be absolute: {}", path.display());
                }
                if let Some(p) = fast_path {
                    if !p.is_absolute() {
                        anyhow::bail!("storage.fast_path must be absolute: {}", p.display());
                    }
                }
            }
        }
        if let Some(mail) = &self.mail {
            if mail.smtp_host.is_empty() {
                anyhow::bail!("mail.smtp_host must not be empty");
            }
            if mail.from.is_empty() {
                anyhow::bail!("mail.from must not be empty");
            }
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("backup-agent"))
    }
}

/// Check one job entry. Identities double as object name prefixes, so they
/// are restricted to the characters the name codec can parse back.
pub fn validate_job(id: &str, job: &JobConfig) -> anyhow::Result<()> {
    if id.is_empty() {
        anyhow::bail!("job id must not be empty");
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("job id may only contain letters, digits and '_': {}", id);
    }
    if job.source_path.as_os_str().is_empty() {
        anyhow::bail!("jobs.{}.source_path must not be empty", id);
    }
    parse_schedule(&job.schedule)
        .map_err(|e| anyhow::anyhow!("jobs.{}.schedule: {}", id, e))?;
    parse_schedule(&job.liveness)
        .map_err(|e| anyhow::anyhow!("jobs.{}.liveness: {}", id, e))?;
    Ok(())
}

/// Parse a cron expression with a leading seconds field. `?` is accepted as
/// an alias for `*` in the day fields.
pub fn parse_schedule(expr: &str) -> anyhow::Result<cron::Schedule> {
    let normalized = expr.replace('?', "*");
    cron::Schedule::from_str(normalized.trim())
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", expr, e))
}
