// ABOUTME: Webhook sink: POSTs serialized change batches to an HTTP endpoint
// ABOUTME: Batch identity travels in the X-Batch-Name header

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::tracker::{RowChange, TrackedEntity};

use super::{batch_name, Sink};

/// POSTs each batch as a JSON array.
///
/// The receiver sees at-least-once semantics: a failed POST is retried with
/// the identical batch on the next poll pass, so endpoints should deduplicate
/// by change version.
pub struct WebhookSink {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl WebhookSink {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    async fn deliver(&self, entity: &TrackedEntity, batch: &[RowChange]) -> Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("X-Entity", entity.id.qualified_name())
            .json(&batch);

        if let Some(name) = batch_name(entity, batch, "json") {
            request = request.header("X-Batch-Name", name);
        }

        if let Some(ref key) = self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to POST batch for {}", entity.id))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Webhook rejected batch for {} with status {}: {}",
                entity.id,
                status,
                body
            );
        }

        Ok(())
    }
}
