use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_SCHEDULE: &str = "0 9 * * *";
pub const DEFAULT_FROM: &str = "noreply@niftylearning.com";
pub const DEFAULT_SEND_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SmtpConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("SMTP_PORT") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("SMTP_PORT is not a valid port: {value}"))?,
            Err(_) => 587,
        };

        Ok(Self {
            host: env_or("SMTP_HOST", "smtp.ethereal.email"),
            port,
            username: std::env::var("SMTP_USERNAME")
                .context("SMTP_USERNAME must be set to send notifications")?,
            password: std::env::var("SMTP_PASSWORD")
                .context("SMTP_PASSWORD must be set to send notifications")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub from: String,
    pub send_delay: Duration,
    pub schedule: String,
}

impl NotifyConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let delay_ms = match std::env::var("NOTIFY_SEND_DELAY_MS") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("NOTIFY_SEND_DELAY_MS is not a number: {value}"))?,
            Err(_) => DEFAULT_SEND_DELAY_MS,
        };

        Ok(Self {
            from: env_or("MAIL_FROM", DEFAULT_FROM),
            send_delay: Duration::from_millis(delay_ms),
            schedule: env_or("NOTIFY_SCHEDULE", DEFAULT_SCHEDULE),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}
