//! HTTP adapter for the secondary mirror tier: a small resource API
//! holding recent high-severity events for the workflow runtime's UI.

use std::time::Duration;

use async_trait::async_trait;

use pulse_core::config::MirrorConfig;
use pulse_core::ports::{MirrorResource, MirrorStore};

pub struct HttpMirrorStore {
    client: reqwest::Client,
    config: MirrorConfig,
}

impl HttpMirrorStore {
    pub fn new(config: MirrorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl MirrorStore for HttpMirrorStore {
    async fn push(&self, resource: MirrorResource) -> anyhow::Result<()> {
        self.client
            .post(self.url("/resources"))
            .json(&resource)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_by_type(
        &self,
        resource_type: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MirrorResource>> {
        let limit = limit.to_string();
        let response = self
            .client
            .get(self.url("/resources"))
            .query(&[("type", resource_type), ("limit", limit.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .delete(self.url(&format!("/resources/{id}")))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
