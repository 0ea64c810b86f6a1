//! SMTP channel: one HTML email per report to each recipient.

use anyhow::Context;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::MailConfig;
use crate::report::JobReport;

use super::NotifyChannel;

pub struct MailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl MailChannel {
    pub fn from_config(config: &MailConfig) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .with_context(|| format!("Invalid mail.from address: {}", config.from))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("Invalid mail.to address: {}", addr))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .with_context(|| format!("Invalid SMTP relay: {}", config.smtp_host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        let builder = builder.port(config.port);
        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        info!(
            host = %config.smtp_host,
            port = config.port,
            starttls = config.starttls,
            recipients = to.len(),
            "Mail channel initialized"
        );
        Ok(Self {
            mailer: builder.build(),
            from,
            to,
        })
    }

    fn message_for(&self, to: &Mailbox, report: &JobReport) -> anyhow::Result<Message> {
        let subject = format!(
            "Backup notification: {} [{}]",
            report.job_id(),
            report.status().label()
        );
        Message::builder()
            .from(self.from.clone())
            .to(to.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(report.render_html())
            .context("Failed to build email")
    }
}

#[async_trait]
impl NotifyChannel for MailChannel {
    fn name(&self) -> &str {
        "mail"
    }

    fn is_available(&self) -> bool {
        !self.to.is_empty()
    }

    async fn send(&self, report: &JobReport) -> anyhow::Result<()> {
        for to in &self.to {
            let email = self.message_for(to, report)?;
            self.mailer
                .send(email)
                .await
                .with_context(|| format!("SMTP delivery to {} failed", to))?;
            debug!(to = %to, "Report email sent");
        }
        Ok(())
    }
}
