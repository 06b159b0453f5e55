//! Webhook detection sink: JSON POST per detection.

use super::{DetectionEvent, Sink};
use crate::config::WebhookConfig;
use anyhow::{Context, Result};
use std::time::Duration;

/// Header carrying the per-endpoint shared secret.
const SECRET_HEADER: &str = "X-Webhook-Secret";

pub struct WebhookSink {
    client: reqwest::blocking::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookSink {
    pub fn new(cfg: &WebhookConfig) -> Result<WebhookSink> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("building webhook http client")?;
        Ok(WebhookSink { client, url: cfg.url.clone(), secret: cfg.secret.clone() })
    }
}

impl Sink for WebhookSink {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn deliver(&mut self, event: &DetectionEvent) -> Result<()> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }
        let response = request.send().with_context(|| format!("posting to {}", self.url))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "{} returned {status}", self.url);
        Ok(())
    }
}
