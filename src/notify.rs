//! Best-effort notifications sent after a successful backup.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

/// Upper bound for a single webhook delivery.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

#[derive(Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to a Slack incoming webhook.
pub struct SlackNotifier {
    client: Client,
    webhook: String,
}

// The webhook URL is a bearer credential.
impl std::fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackNotifier").finish_non_exhaustive()
    }
}

impl SlackNotifier {
    pub fn new(webhook: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .context("building HTTP client for slack notifications")?;
        Ok(Self {
            client,
            webhook: webhook.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        // reqwest errors embed the URL; strip it so the token stays out of logs.
        let response = self
            .client
            .post(&self.webhook)
            .json(&SlackPayload { text: message })
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("posting slack notification: {}", e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unreadable body>"));
            bail!("slack notification failed: HTTP {status}: {body}");
        }
        Ok(())
    }
}
