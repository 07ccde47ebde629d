//! Handler registry with alias-tolerant name resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use pulse_core::event::SystemEvent;

/// Outcome contract every handler shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub fixed: bool,
    pub detail: String,
}

impl Remediation {
    pub fn fixed(detail: impl Into<String>) -> Self {
        Self {
            fixed: true,
            detail: detail.into(),
        }
    }

    pub fn unfixed(detail: impl Into<String>) -> Self {
        Self {
            fixed: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait RemediationHandler: Send + Sync {
    /// Canonical handler name; external aliases resolve through
    /// [`normalize`].
    fn name(&self) -> &'static str;

    /// Handlers may error internally; the registry converts errors and
    /// panics to `{ fixed: false }` before anything reaches a caller.
    async fn run(&self, event: &SystemEvent) -> anyhow::Result<Remediation>;
}

/// Collapse case, hyphens, and underscores so `autoCommitAndRetry`,
/// `auto-commit-and-retry`, and `AUTO_COMMIT_AND_RETRY` all hit the
/// same handler.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RemediationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn RemediationHandler>) {
        self.handlers.insert(normalize(handler.name()), handler);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn RemediationHandler>> {
        self.handlers.get(&normalize(name)).cloned()
    }

    /// Dispatch by external name. Unknown names, handler errors, and
    /// handler panics all come back as `{ fixed: false }`.
    pub async fn run(&self, name: &str, event: &SystemEvent) -> Remediation {
        let Some(handler) = self.resolve(name) else {
            warn!(handler = %name, "unknown remediation handler");
            return Remediation::unfixed(format!("unknown handler `{name}`"));
        };

        let canonical = handler.name();
        let owned = event.clone();
        // Spawned so a panicking handler surfaces as a JoinError
        // instead of unwinding through the worker.
        let outcome = tokio::spawn(async move { handler.run(&owned).await }).await;

        let remediation = match outcome {
            Ok(Ok(remediation)) => remediation,
            Ok(Err(e)) => Remediation::unfixed(e.to_string()),
            Err(join) => Remediation::unfixed(format!("handler panicked: {join}")),
        };
        if remediation.fixed {
            metrics::counter!("remediation.fixed").increment(1);
        } else {
            metrics::counter!("remediation.unfixed").increment(1);
        }
        info!(
            handler = canonical,
            fixed = remediation.fixed,
            detail = %remediation.detail,
            "remediation handler finished"
        );
        remediation
    }
}

/// Acknowledges known-benign tier-1 conditions without acting.
pub struct IgnoreHandler;

#[async_trait]
impl RemediationHandler for IgnoreHandler {
    fn name(&self) -> &'static str {
        "ignore"
    }

    async fn run(&self, _event: &SystemEvent) -> anyhow::Result<Remediation> {
        Ok(Remediation::fixed("acknowledged known-benign condition"))
    }
}
