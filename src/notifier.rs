// src/notifier.rs
//
// Outbound email capability. Alert logic only sees the EmailSender trait;
// the SMTP mechanics (STARTTLS, credentials, recipients) live here.

use anyhow::{bail, Context, Result};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{info, warn};

use crate::config::EmailConfig;

pub trait EmailSender: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn send(&self, subject: &str, body: &str) -> Result<()>;
}

/// Plain-text SMTP over STARTTLS, one connection per message. Alert volume
/// is cooldown-limited to a handful of mails a day, so pooling buys nothing.
pub struct SmtpMailer {
    enabled: bool,
    smtp_host: String,
    smtp_port: u16,
    from_address: String,
    password: String,
    to_addresses: Vec<String>,
}

impl SmtpMailer {
    pub fn from_config(config: &EmailConfig) -> Self {
        let to_addresses: Vec<String> = config
            .to_addresses
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if config.enabled {
            info!(
                "Email alerts enabled: {}:{} → {} recipient(s)",
                config.smtp_host,
                config.smtp_port,
                to_addresses.len()
            );
        } else {
            warn!("Email alerts disabled");
        }
        Self {
            enabled: config.enabled,
            smtp_host: config.smtp_host.clone(),
            smtp_port: config.smtp_port,
            from_address: config.from_address.clone(),
            password: config.password.clone(),
            to_addresses,
        }
    }
}

impl EmailSender for SmtpMailer {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn send(&self, subject: &str, body: &str) -> Result<()> {
        if self.from_address.is_empty() || self.to_addresses.is_empty() {
            bail!("email credentials not configured (from_address / to_addresses)");
        }

        let from: Mailbox = self
            .from_address
            .parse()
            .with_context(|| format!("invalid from_address {:?}", self.from_address))?;
        let mut builder = Message::builder().from(from).subject(subject);
        for to in &self.to_addresses {
            let mailbox: Mailbox = to
                .parse()
                .with_context(|| format!("invalid recipient {to:?}"))?;
            builder = builder.to(mailbox);
        }
        let email = builder.body(body.to_string())?;

        let mailer = SmtpTransport::starttls_relay(&self.smtp_host)
            .context("building SMTP transport")?
            .port(self.smtp_port)
            .credentials(Credentials::new(
                self.from_address.clone(),
                self.password.clone(),
            ))
            .build();

        mailer.send(&email).context("SMTP send failed")?;
        info!("📧 Alert email sent to {} recipient(s)", self.to_addresses.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_list_parsing() {
        let config = EmailConfig {
            enabled: true,
            to_addresses: "ops@example.com, site-lead@example.com ,,".to_string(),
            ..Default::default()
        };
        let mailer = SmtpMailer::from_config(&config);
        assert_eq!(
            mailer.to_addresses,
            vec!["ops@example.com", "site-lead@example.com"]
        );
        assert!(mailer.is_enabled());
    }

    #[test]
    fn test_send_without_credentials_errors() {
        let mailer = SmtpMailer::from_config(&EmailConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(mailer.send("subject", "body").is_err());
    }
}
