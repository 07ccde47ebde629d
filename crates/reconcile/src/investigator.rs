//! Reachability investigator: sweeps recently-failed workflow runs for
//! the unreachable-worker signature and kicks the worker when found.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pulse_core::config::InvestigatorConfig;
use pulse_core::envelope::{flow_trace_key, HealCompletion, HealRequest, HealStatus};
use pulse_core::event::{EventInput, SystemEvent};
use pulse_core::ports::SharedState;
use pulse_remediation::HandlerRegistry;
use pulse_store::TieredEventStore;

use crate::audit::emit_audit;
use crate::bridge::HEAL_EVENT;

pub const DOMAIN: &str = "worker_reachability";

const RESTART_HANDLER: &str = "restart_worker";

/// The failure text the workflow runtime produces when the worker's
/// serve endpoint is down.
const UNREACHABLE_SIGNATURE: &str =
    r"(?i)unable to reach sdk url|econnrefused|connect etimedout|fetch failed";

const LOOKBACK_CLAMP_MINS: (i64, i64) = (5, 180);
const MAX_RUNS_CLAMP: (usize, usize) = (5, 120);

/// One failed run as reported by the workflow runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRun {
    pub id: String,
    pub function_id: String,
    pub ended_at_ms: i64,
}

/// Run-history query port (workflow runtime collaborator).
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn recent_failed_runs(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<FailedRun>>;

    async fn run_output(&self, run_id: &str) -> anyhow::Result<String>;
}

pub fn is_unreachable_failure(output: &str) -> bool {
    Regex::new(UNREACHABLE_SIGNATURE)
        .map(|signature| signature.is_match(output))
        .unwrap_or(false)
}

/// One investigation pass, serialized into the audit event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvestigationSummary {
    pub candidates: usize,
    pub skipped_legacy: usize,
    pub skipped_inspected: usize,
    pub inspected: usize,
    pub matched: Vec<String>,
    pub restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_detail: Option<String>,
}

pub struct Investigator {
    config: InvestigatorConfig,
    history: Arc<dyn RunHistory>,
    state: Arc<dyn SharedState>,
    registry: Arc<HandlerRegistry>,
    store: Arc<TieredEventStore>,
}

impl Investigator {
    pub fn new(
        config: InvestigatorConfig,
        history: Arc<dyn RunHistory>,
        state: Arc<dyn SharedState>,
        registry: Arc<HandlerRegistry>,
        store: Arc<TieredEventStore>,
    ) -> Self {
        Self {
            config,
            history,
            state,
            registry,
            store,
        }
    }

    pub async fn run_scheduled(&self) -> InvestigationSummary {
        self.investigate(None).await.0
    }

    pub async fn handle_request(&self, request: &HealRequest) -> HealCompletion {
        match self.investigate(Some(request)).await.1 {
            Some(completion) => completion,
            None => HealCompletion::noop(DOMAIN),
        }
    }

    async fn investigate(
        &self,
        request: Option<&HealRequest>,
    ) -> (InvestigationSummary, Option<HealCompletion>) {
        let dry_run = request.map_or(false, |r| r.dry_run);
        let lookback_mins = self
            .config
            .lookback_mins
            .clamp(LOOKBACK_CLAMP_MINS.0, LOOKBACK_CLAMP_MINS.1);
        let max_runs = self.config.max_runs.clamp(MAX_RUNS_CLAMP.0, MAX_RUNS_CLAMP.1);
        let since_ms = Utc::now().timestamp_millis() - lookback_mins * 60_000;

        let runs = match self.history.recent_failed_runs(since_ms, max_runs).await {
            Ok(runs) => runs,
            Err(e) => {
                // Unreadable history is ambiguous state: noop. The
                // skipped pass still leaves an audit trail.
                warn!(error = %e, "run history unavailable, skipping pass");
                self.emit_skipped_audit(&e).await;
                return (
                    InvestigationSummary::default(),
                    request.map(|_| HealCompletion::noop(DOMAIN)),
                );
            }
        };

        let mut summary = InvestigationSummary {
            candidates: runs.len(),
            ..Default::default()
        };
        let inspected_ttl_secs = self.config.inspected_ttl_hours * 3600;

        for run in &runs {
            if summary.inspected >= self.config.inspect_budget {
                break;
            }
            if self.config.legacy_function_ids.contains(&run.function_id) {
                summary.skipped_legacy += 1;
                continue;
            }
            let marker = format!("investigator:checked:{}", run.id);
            match self.state.claim(&marker, inspected_ttl_secs).await {
                Ok(true) => {}
                Ok(false) => {
                    summary.skipped_inspected += 1;
                    continue;
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "inspected marker unavailable, skipping run");
                    continue;
                }
            }

            summary.inspected += 1;
            match self.history.run_output(&run.id).await {
                Ok(output) if is_unreachable_failure(&output) => {
                    summary.matched.push(run.id.clone());
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "could not fetch run output");
                }
            }
        }

        if !summary.matched.is_empty() && !dry_run {
            let remediation = self
                .registry
                .run(RESTART_HANDLER, &self.detection_event(&summary))
                .await;
            summary.restarted = remediation.fixed;
            summary.restart_detail = Some(remediation.detail);
        }
        if !summary.matched.is_empty() {
            metrics::counter!("investigator.unreachable_detected").increment(1);
        }
        info!(
            inspected = summary.inspected,
            matched = summary.matched.len(),
            restarted = summary.restarted,
            "reachability sweep complete"
        );

        self.emit_pass_audit(&summary, request).await;

        let completion = request.map(|req| {
            let status = if summary.restarted {
                HealStatus::Remediated
            } else if !summary.matched.is_empty() {
                HealStatus::Detected
            } else {
                HealStatus::Noop
            };
            let mut context = BTreeMap::new();
            context.insert(
                "candidates".to_string(),
                serde_json::json!(summary.candidates),
            );
            context.insert("dry_run".to_string(), serde_json::json!(req.dry_run));
            HealCompletion {
                domain: DOMAIN.to_string(),
                status,
                detected: !summary.matched.is_empty(),
                inspected: summary.inspected,
                remediation_detail: summary.restart_detail.clone(),
                sample_run_ids: summary.matched.clone(),
                context,
            }
        });

        (summary, completion)
    }

    fn detection_event(&self, summary: &InvestigationSummary) -> SystemEvent {
        SystemEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            level: pulse_core::Level::Error,
            source: "pulse".to_string(),
            component: "runtime".to_string(),
            action: "invoke".to_string(),
            success: false,
            duration_ms: None,
            error: Some(format!(
                "unreachable endpoint signature in {} run(s)",
                summary.matched.len()
            )),
            metadata: BTreeMap::new(),
        }
    }

    async fn emit_skipped_audit(&self, error: &anyhow::Error) {
        let audit = SystemEvent::build(EventInput {
            level: "warn".to_string(),
            source: "pulse".to_string(),
            component: "investigator".to_string(),
            action: "reachability_checked".to_string(),
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        });
        match audit {
            Ok(audit) => emit_audit(&self.store, self.state.as_ref(), &audit).await,
            Err(e) => warn!(error = %e, "could not build investigator audit event"),
        }
    }

    async fn emit_pass_audit(
        &self,
        summary: &InvestigationSummary,
        request: Option<&HealRequest>,
    ) {
        let level = if summary.matched.is_empty() {
            "info"
        } else {
            "warn"
        };
        let mut metadata: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(summary) {
            metadata.extend(fields);
        }
        if let Some(req) = request {
            metadata.insert(
                "flow_trace_key".to_string(),
                serde_json::json!(flow_trace_key(
                    HEAL_EVENT,
                    &req.source_function,
                    &req.target_component,
                    &req.domain,
                    "",
                    req.attempt,
                )),
            );
        }

        let audit = SystemEvent::build(EventInput {
            level: level.to_string(),
            source: "pulse".to_string(),
            component: "investigator".to_string(),
            action: "reachability_checked".to_string(),
            success: true,
            metadata: Some(metadata),
            ..Default::default()
        });
        match audit {
            Ok(audit) => emit_audit(&self.store, self.state.as_ref(), &audit).await,
            Err(e) => warn!(error = %e, "could not build investigator audit event"),
        }
    }
}

// ─── HTTP adapter ───────────────────────────────────────────────────────

pub struct HttpRunHistory {
    client: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    #[serde(default)]
    data: Vec<RunRow>,
}

#[derive(Deserialize)]
struct RunRow {
    run_id: String,
    #[serde(default)]
    function_id: String,
    #[serde(default)]
    ended_at: Option<String>,
}

impl HttpRunHistory {
    pub fn new(config: &InvestigatorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base: config.runtime_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RunHistory for HttpRunHistory {
    async fn recent_failed_runs(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<FailedRun>> {
        let since = chrono::DateTime::from_timestamp_millis(since_ms)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let limit = limit.to_string();
        let response: RunsResponse = self
            .client
            .get(format!("{}/v1/runs", self.base))
            .query(&[
                ("status", "Failed"),
                ("received_after", since.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .data
            .into_iter()
            .map(|row| FailedRun {
                ended_at_ms: row
                    .ended_at
                    .as_deref()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or_default(),
                id: row.run_id,
                function_id: row.function_id,
            })
            .collect())
    }

    async fn run_output(&self, run_id: &str) -> anyhow::Result<String> {
        let body: serde_json::Value = self
            .client
            .get(format!("{}/v1/runs/{run_id}", self.base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        // The interesting text lives in data.output; fall back to the
        // whole body when the shape shifts.
        let output = body
            .pointer("/data/output")
            .cloned()
            .unwrap_or(body);
        Ok(output.to_string())
    }
}

/// Scripted run history for tests.
#[derive(Default)]
pub struct MemoryRunHistory {
    runs: Mutex<Vec<FailedRun>>,
    outputs: Mutex<HashMap<String, String>>,
    last_query: Mutex<Option<(i64, usize)>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_run(&self, id: &str, function_id: &str, output: &str) {
        self.runs.lock().push(FailedRun {
            id: id.to_string(),
            function_id: function_id.to_string(),
            ended_at_ms: Utc::now().timestamp_millis(),
        });
        self.outputs
            .lock()
            .insert(id.to_string(), output.to_string());
    }

    pub fn last_query(&self) -> Option<(i64, usize)> {
        *self.last_query.lock()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn recent_failed_runs(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<FailedRun>> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("run history unavailable (injected)");
        }
        *self.last_query.lock() = Some((since_ms, limit));
        Ok(self.runs.lock().iter().take(limit).cloned().collect())
    }

    async fn run_output(&self, run_id: &str) -> anyhow::Result<String> {
        self.outputs
            .lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no output for run {run_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pulse_core::config::{MirrorConfig, ObservabilityConfig};
    use pulse_core::ports::{MemoryMirrorStore, MemorySearchIndex, MemorySharedState, SearchIndex};
    use pulse_remediation::{Remediation, RemediationHandler};

    const UNREACHABLE_OUTPUT: &str =
        r#"{"error": "Unable to reach SDK URL: http://localhost:3000/api/inngest"}"#;

    struct CountingRestart {
        calls: AtomicUsize,
        fixed: bool,
    }

    #[async_trait]
    impl RemediationHandler for CountingRestart {
        fn name(&self) -> &'static str {
            "restart_worker"
        }

        async fn run(&self, _event: &SystemEvent) -> anyhow::Result<Remediation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.fixed {
                Remediation::fixed("kicked")
            } else {
                Remediation::unfixed("kick failed")
            })
        }
    }

    struct Harness {
        investigator: Investigator,
        history: Arc<MemoryRunHistory>,
        state: Arc<MemorySharedState>,
        restart: Arc<CountingRestart>,
        audit_index: Arc<MemorySearchIndex>,
    }

    fn harness(config: InvestigatorConfig, restart_fixed: bool) -> Harness {
        let history = Arc::new(MemoryRunHistory::new());
        let state = Arc::new(MemorySharedState::new());
        let audit_index = Arc::new(MemorySearchIndex::new());
        let restart = Arc::new(CountingRestart {
            calls: AtomicUsize::new(0),
            fixed: restart_fixed,
        });
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::clone(&restart) as Arc<dyn RemediationHandler>);
        let store = Arc::new(TieredEventStore::new(
            ObservabilityConfig::default(),
            MirrorConfig::default(),
            Arc::clone(&audit_index) as Arc<dyn SearchIndex>,
            Arc::new(MemoryMirrorStore::new()),
            None,
        ));
        let investigator = Investigator::new(
            config,
            Arc::clone(&history) as Arc<dyn RunHistory>,
            Arc::clone(&state) as Arc<dyn SharedState>,
            Arc::new(registry),
            store,
        );
        Harness {
            investigator,
            history,
            state,
            restart,
            audit_index,
        }
    }

    fn request(dry_run: bool) -> HealRequest {
        HealRequest {
            domain: DOMAIN.to_string(),
            reason: "scheduled".to_string(),
            requested_by: "triage".to_string(),
            attempt: 1,
            retry_policy: None,
            dry_run,
            source_function: "triage.scan".to_string(),
            target_component: "worker".to_string(),
        }
    }

    #[test]
    fn test_unreachable_signature() {
        assert!(is_unreachable_failure(UNREACHABLE_OUTPUT));
        assert!(is_unreachable_failure("connect ECONNREFUSED 127.0.0.1:3000"));
        assert!(is_unreachable_failure("TypeError: fetch failed"));
        assert!(!is_unreachable_failure("assertion failed in step"));
        assert!(!is_unreachable_failure(""));
    }

    #[tokio::test]
    async fn test_match_restarts_and_remediates() {
        let h = harness(InvestigatorConfig::default(), true);
        h.history.seed_run("run-1", "fn-a", UNREACHABLE_OUTPUT);

        let completion = h.investigator.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Remediated);
        assert!(completion.detected);
        assert_eq!(completion.sample_run_ids, vec!["run-1".to_string()]);
        assert_eq!(h.restart.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.audit_index.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_detects_without_restart() {
        let h = harness(InvestigatorConfig::default(), true);
        h.history.seed_run("run-1", "fn-a", UNREACHABLE_OUTPUT);

        let completion = h.investigator.handle_request(&request(true)).await;
        assert_eq!(completion.status, HealStatus::Detected);
        assert_eq!(h.restart.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_restart_is_detected_not_remediated() {
        let h = harness(InvestigatorConfig::default(), false);
        h.history.seed_run("run-1", "fn-a", UNREACHABLE_OUTPUT);

        let completion = h.investigator.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Detected);
        assert_eq!(
            completion.remediation_detail.as_deref(),
            Some("kick failed")
        );
    }

    #[tokio::test]
    async fn test_clean_runs_are_noop() {
        let h = harness(InvestigatorConfig::default(), true);
        h.history.seed_run("run-1", "fn-a", "assertion failed");

        let completion = h.investigator.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Noop);
        assert!(!completion.detected);
        assert_eq!(completion.inspected, 1);
    }

    #[tokio::test]
    async fn test_inspected_markers_skip_on_second_pass() {
        let h = harness(InvestigatorConfig::default(), true);
        h.history.seed_run("run-1", "fn-a", UNREACHABLE_OUTPUT);

        h.investigator.run_scheduled().await;
        let second = h.investigator.run_scheduled().await;
        assert_eq!(second.inspected, 0);
        assert_eq!(second.skipped_inspected, 1);
        // Restart not repeated for an already-inspected run.
        assert_eq!(h.restart.calls.load(Ordering::SeqCst), 1);
        assert!(h.state.has_claim("investigator:checked:run-1"));
    }

    #[tokio::test]
    async fn test_legacy_functions_excluded() {
        let h = harness(
            InvestigatorConfig {
                legacy_function_ids: vec!["fn-legacy".to_string()],
                ..Default::default()
            },
            true,
        );
        h.history.seed_run("run-1", "fn-legacy", UNREACHABLE_OUTPUT);

        let summary = h.investigator.run_scheduled().await;
        assert_eq!(summary.skipped_legacy, 1);
        assert_eq!(summary.inspected, 0);
        assert_eq!(h.restart.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_budget_bounds_inspections() {
        let h = harness(
            InvestigatorConfig {
                inspect_budget: 3,
                ..Default::default()
            },
            true,
        );
        for i in 0..10 {
            h.history.seed_run(&format!("run-{i}"), "fn-a", "benign failure");
        }

        let summary = h.investigator.run_scheduled().await;
        assert_eq!(summary.candidates, 10);
        assert_eq!(summary.inspected, 3);
    }

    #[tokio::test]
    async fn test_lookback_and_limit_clamped() {
        let h = harness(
            InvestigatorConfig {
                lookback_mins: 100_000,
                max_runs: 5_000,
                ..Default::default()
            },
            true,
        );
        h.investigator.run_scheduled().await;
        let (since_ms, limit) = h.history.last_query().unwrap();
        assert_eq!(limit, 120);
        let lookback_ms = Utc::now().timestamp_millis() - since_ms;
        // 180 minutes, give or take scheduling slack.
        assert!(lookback_ms <= 181 * 60_000);
        assert!(lookback_ms >= 179 * 60_000);
    }

    #[tokio::test]
    async fn test_unreadable_history_is_noop() {
        let h = harness(InvestigatorConfig::default(), true);
        h.history.set_failing(true);

        let completion = h.investigator.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Noop);
        assert_eq!(completion.inspected, 0);
        // The skipped pass still leaves an audit trail.
        assert_eq!(h.audit_index.len(), 1);
        let audits = h
            .audit_index
            .recent_for_component("investigator", 10)
            .await
            .unwrap();
        assert!(!audits[0].success);
    }
}
