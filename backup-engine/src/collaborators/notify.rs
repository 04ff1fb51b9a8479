//! Delivery of end-of-run reports.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::backup::{Initiator, Notifier};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

fn status(success: bool) -> &'static str {
    if success {
        "backup_succeeded"
    } else {
        "backup_failed"
    }
}

/// Writes the report to the process log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, initiator: &Initiator, success: bool, logs: &[String]) -> anyhow::Result<()> {
        if success {
            info!(user = %initiator.username, lines = logs.len(), "Backup succeeded");
        } else {
            warn!(user = %initiator.username, "Backup failed:\n{}", logs.join("\n"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    site: &'a str,
    status: &'static str,
    user_id: i64,
    username: &'a str,
    logs: &'a [String],
}

/// POSTs the report as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    site: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, site: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
            site: site.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, initiator: &Initiator, success: bool, logs: &[String]) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            site: &self.site,
            status: status(success),
            user_id: initiator.id,
            username: &initiator.username,
            logs,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.url))?;

        let code = response.status();
        if !code.is_success() {
            anyhow::bail!("webhook responded with {}", code);
        }
        info!(site = %self.site, "Backup report delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let logs = vec!["[2024-01-01T00:00:00Z] Backup failed!".to_string()];
        let payload = WebhookPayload {
            site: "default",
            status: status(false),
            user_id: 3,
            username: "admin",
            logs: &logs,
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "backup_failed");
        assert_eq!(json["user_id"], 3);
        assert_eq!(json["logs"][0], logs[0]);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_an_error() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", "default").unwrap();
        let result = notifier
            .notify(&Initiator::system(), false, &["line".to_string()])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier
            .notify(&Initiator::system(), true, &[])
            .await
            .unwrap();
    }
}
