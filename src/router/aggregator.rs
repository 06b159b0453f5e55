//! External aggregator upload sink.
//!
//! Multipart POST per detection: a JSON metadata part plus, when configured
//! and available, the encoded clip. The detection id doubles as the
//! idempotency key so aggregator-side retries never double-count.

use super::{DetectionEvent, Sink};
use crate::config::AggregatorConfig;
use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use std::time::Duration;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct AggregatorSink {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
    include_clip: bool,
}

impl AggregatorSink {
    pub fn new(cfg: &AggregatorConfig) -> Result<AggregatorSink> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building aggregator http client")?;
        Ok(AggregatorSink {
            client,
            url: cfg.url.clone(),
            token: cfg.token.clone(),
            include_clip: cfg.include_clip,
        })
    }
}

impl Sink for AggregatorSink {
    fn kind(&self) -> &'static str {
        "aggregator"
    }

    fn deliver(&mut self, event: &DetectionEvent) -> Result<()> {
        let metadata = serde_json::to_string(event).context("encoding metadata part")?;
        let mut form = Form::new().part(
            "metadata",
            Part::text(metadata).mime_str("application/json").context("metadata mime")?,
        );
        if self.include_clip {
            if let Some(path) = event.detection.clip.path() {
                form = form
                    .file("clip", path)
                    .with_context(|| format!("attaching clip {}", path.display()))?;
            }
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(id) = event.id {
            request = request.header(IDEMPOTENCY_HEADER, id.to_string());
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().with_context(|| format!("uploading to {}", self.url))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "{} returned {status}", self.url);
        Ok(())
    }
}
