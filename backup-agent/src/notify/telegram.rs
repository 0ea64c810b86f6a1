//! Telegram Bot API channel.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::report::JobReport;

use super::NotifyChannel;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Bot API limit for `sendMessage` text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;
const TRUNCATED_MARKER: &str = "\n[truncated]";

pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str, api_base: Option<&str>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    pub fn from_config(config: &TelegramConfig) -> anyhow::Result<Self> {
        Self::new(&config.bot_token, &config.chat_id, config.api_base.as_deref())
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    pub async fn send_text(&self, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": truncate_message(text),
        });
        let resp = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .context("Telegram request failed")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let parsed: Option<ApiResponse> = serde_json::from_str(&text).ok();
        match parsed {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => {
                debug!(chat_id = %self.chat_id, "Telegram message sent");
                Ok(())
            }
            Some(ApiResponse { description: Some(desc), .. }) => {
                bail!("Telegram sendMessage failed ({}): {}", status, desc)
            }
            _ => bail!("Telegram sendMessage failed ({}): {}", status, text),
        }
    }
}

#[async_trait]
impl NotifyChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_available(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    async fn send(&self, report: &JobReport) -> anyhow::Result<()> {
        self.send_text(&report.render_plain()).await
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let keep = MAX_MESSAGE_CHARS - TRUNCATED_MARKER.chars().count();
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATED_MARKER);
    out
}
