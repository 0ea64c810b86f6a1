//! Notification fan-out.
//!
//! A finished `JobReport` is delivered to every configured channel that is
//! currently available. A failing channel is logged and skipped; it never
//! prevents delivery to the others or affects the job outcome.

pub mod mail;
pub mod telegram;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::report::JobReport;

use self::mail::MailChannel;
use self::telegram::TelegramChannel;

#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    async fn send(&self, report: &JobReport) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Notifier {
    channels: Vec<Box<dyn NotifyChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Box<dyn NotifyChannel>>) -> Self {
        Self { channels }
    }

    /// Build the channels named in the config. Missing sections simply mean
    /// no channel of that kind.
    pub fn from_config(config: &AgentConfig) -> anyhow::Result<Self> {
        let mut channels: Vec<Box<dyn NotifyChannel>> = Vec::new();
        if let Some(mail) = &config.mail {
            channels.push(Box::new(MailChannel::from_config(mail)?));
        }
        if let Some(tg) = &config.telegram {
            channels.push(Box::new(TelegramChannel::from_config(tg)?));
        }
        if channels.is_empty() {
            warn!("No notification channels configured, reports will only be logged");
        }
        Ok(Self::new(channels))
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Deliver `report` to every available channel. Returns the number of
    /// channels that accepted it.
    pub async fn notice(&self, report: &JobReport) -> usize {
        let job = report.job_id();
        let mut delivered = 0;
        for channel in &self.channels {
            if !channel.is_available() {
                debug!(job = %job, channel = %channel.name(), "Channel unavailable, skipping");
                continue;
            }
            match channel.send(report).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    job = %job,
                    channel = %channel.name(),
                    error = %format!("{:#}", e),
                    "Failed to send notification"
                ),
            }
        }
        info!(job = %job, delivered, "Report delivered");
        delivered
    }

    /// Deliver a one-line message outside of a job run.
    pub async fn notice_text(&self, id: &str, text: &str) -> usize {
        self.notice(&JobReport::single(id, text)).await
    }
}
