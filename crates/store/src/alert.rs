//! HTTP adapter for the tertiary alert tier. Strictly best effort; the
//! store never lets a sink failure ripple back to callers.

use std::time::Duration;

use async_trait::async_trait;

use pulse_core::config::AlertConfig;
use pulse_core::event::SystemEvent;
use pulse_core::ports::AlertSink;

pub struct HttpAlertSink {
    client: reqwest::Client,
    endpoint: String,
    project_key: String,
}

impl HttpAlertSink {
    /// Returns `None` when no endpoint is configured; the store treats
    /// an absent sink as a skipped tier.
    pub fn from_config(config: &AlertConfig) -> anyhow::Result<Option<Self>> {
        let Some(endpoint) = config.endpoint.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Some(Self {
            client,
            endpoint,
            project_key: config.project_key.clone(),
        }))
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn forward(&self, event: &SystemEvent) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .header("X-Project-Key", &self.project_key)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
