//! The LLM fallback classifier port and its HTTP adapter (OpenAI-style
//! chat completions endpoint). The engine races every call against its
//! own timeout; the adapter's native timeout is a backstop only.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use pulse_core::config::TriageConfig;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Returns the raw model response text for one batched prompt.
    async fn classify(&self, prompt: &str) -> anyhow::Result<String>;
}

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpClassifier {
    pub fn new(config: &TriageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.llm_endpoint.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, prompt: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response: ChatResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("classifier returned no choices"))
    }
}

/// Scripted classifier for tests: replays queued replies in order, or
/// fails/hangs on demand.
#[derive(Default)]
pub struct FixedClassifier {
    replies: Mutex<Vec<Reply>>,
    calls: Mutex<Vec<String>>,
}

enum Reply {
    Text(String),
    Error(String),
    Hang,
}

impl FixedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, text: &str) {
        self.replies.lock().push(Reply::Text(text.to_string()));
    }

    pub fn push_error(&self, message: &str) {
        self.replies.lock().push(Reply::Error(message.to_string()));
    }

    /// Next call never resolves (exercises the timeout race).
    pub fn push_hang(&self) {
        self.replies.lock().push(Reply::Hang);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, prompt: &str) -> anyhow::Result<String> {
        self.calls.lock().push(prompt.to_string());
        let reply = {
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                Reply::Error("no scripted reply".to_string())
            } else {
                replies.remove(0)
            }
        };
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Error(message) => Err(anyhow::anyhow!(message)),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
