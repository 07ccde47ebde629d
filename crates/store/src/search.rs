//! HTTP adapter for the primary search tier (Typesense-compatible API).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use pulse_core::config::SearchConfig;
use pulse_core::event::{EventDocument, SystemEvent};
use pulse_core::ports::{ImportSummary, SearchIndex};

const API_KEY_HEADER: &str = "X-TYPESENSE-API-KEY";

pub struct HttpSearchIndex {
    client: reqwest::Client,
    config: SearchConfig,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    document: EventDocument,
}

#[derive(Deserialize)]
struct ImportLine {
    success: bool,
}

impl HttpSearchIndex {
    pub fn new(config: SearchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn query(&self, filter_by: &str, limit: usize) -> anyhow::Result<Vec<SystemEvent>> {
        let per_page = limit.to_string();
        let response = self
            .client
            .get(self.url(&format!(
                "/collections/{}/documents/search",
                self.config.collection
            )))
            .header(API_KEY_HEADER, &self.config.api_key)
            .query(&[
                ("q", "*"),
                ("query_by", "search_text"),
                ("filter_by", filter_by),
                ("sort_by", "timestamp:desc"),
                ("per_page", per_page.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: SearchResponse = response.json().await?;
        // Documents are untrusted once they leave the index; invalid
        // rows are skipped rather than failing the whole read.
        Ok(body
            .hits
            .into_iter()
            .filter_map(|hit| hit.document.to_event().ok())
            .filter(|event| event.validate().is_ok())
            .collect())
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn ensure_collection(&self) -> anyhow::Result<()> {
        let schema = serde_json::json!({
            "name": self.config.collection,
            "fields": [
                { "name": "id", "type": "string" },
                { "name": "timestamp", "type": "int64", "sort": true },
                { "name": "date", "type": "string", "facet": true },
                { "name": "level", "type": "string", "facet": true },
                { "name": "source", "type": "string", "facet": true },
                { "name": "component", "type": "string", "facet": true },
                { "name": "action", "type": "string", "facet": true },
                { "name": "success", "type": "bool", "facet": true },
                { "name": "duration_ms", "type": "int64", "optional": true },
                { "name": "error", "type": "string", "optional": true },
                { "name": "search_text", "type": "string" },
                { "name": "metadata_json", "type": "string", "index": false, "optional": true },
                { "name": "metadata_keys", "type": "string[]", "facet": true, "optional": true }
            ],
            "default_sorting_field": "timestamp"
        });

        let response = self
            .client
            .post(self.url("/collections"))
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&schema)
            .send()
            .await?;

        // 409 means the collection already exists; that is the steady
        // state after the first process ever to run.
        if response.status() == StatusCode::CONFLICT {
            debug!(collection = %self.config.collection, "collection already exists");
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn upsert(&self, doc: EventDocument) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!(
                "/collections/{}/documents",
                self.config.collection
            )))
            .header(API_KEY_HEADER, &self.config.api_key)
            .query(&[("action", "upsert")])
            .json(&doc)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn import_batch(&self, docs: Vec<EventDocument>) -> anyhow::Result<ImportSummary> {
        if docs.is_empty() {
            return Ok(ImportSummary::default());
        }

        let mut body = String::new();
        for doc in &docs {
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }

        let response = self
            .client
            .post(self.url(&format!(
                "/collections/{}/documents/import",
                self.config.collection
            )))
            .header(API_KEY_HEADER, &self.config.api_key)
            .query(&[("action", "upsert")])
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        // The import endpoint answers with one JSON object per line in
        // input order.
        let text = response.text().await?;
        let mut summary = ImportSummary::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ImportLine>(line) {
                Ok(ImportLine { success: true }) => summary.succeeded += 1,
                _ => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    async fn search_failures(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<SystemEvent>> {
        self.query(&format!("success:=false && timestamp:>={since_ms}"), limit)
            .await
    }

    async fn recent_for_component(
        &self,
        component: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<SystemEvent>> {
        self.query(&format!("component:={component}"), limit).await
    }
}
