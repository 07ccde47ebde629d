//! The triage engine: deterministic pattern phase, in-batch escalation,
//! dedup-gated audit emission, and the LLM fallback for unmatched
//! failures.
//!
//! The engine never raises past the classifier boundary. Every internal
//! failure mode degrades to tier 2 with an explanatory reasoning string
//! and is itself recorded as a warn-level audit event.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use pulse_core::config::TriageConfig;
use pulse_core::event::{dedup_key, EventInput, SystemEvent};
use pulse_core::ports::{SearchIndex, SharedState};
use pulse_store::TieredEventStore;

use crate::classifier::Classifier;
use crate::parse::parse_verdicts;
use crate::patterns::{escalate, select_pattern, TriagePattern};

/// Per-scan classification result for one event.
#[derive(Debug, Clone)]
pub struct ClassifiedEvent {
    pub event: SystemEvent,
    pub tier: u8,
    pub reasoning: String,
    /// Matched pattern name, if the deterministic phase hit.
    pub pattern: Option<&'static str>,
    pub handler: Option<&'static str>,
    pub dedup_key: String,
    pub occurrences: u64,
    pub llm_candidate: bool,
    /// Advisory new-pattern suggestion from the LLM; never auto-applied.
    pub proposed_pattern: Option<serde_json::Value>,
}

/// Output buckets of one scan pass. `unmatched_tier2` holds events no
/// pattern matched that ended at tier 2 (LLM verdict or degradation);
/// candidates the LLM moved to tier 1 or 3 land in those buckets.
#[derive(Debug, Default)]
pub struct TriageReport {
    pub tier1: Vec<ClassifiedEvent>,
    pub tier2: Vec<ClassifiedEvent>,
    pub tier3: Vec<ClassifiedEvent>,
    pub unmatched_tier2: Vec<ClassifiedEvent>,
    /// Classified audit events actually emitted (dedup gate passed).
    pub audited: usize,
}

impl TriageReport {
    pub fn total(&self) -> usize {
        self.tier1.len() + self.tier2.len() + self.tier3.len() + self.unmatched_tier2.len()
    }
}

pub struct TriageEngine {
    config: TriageConfig,
    patterns: Vec<TriagePattern>,
    search: Arc<dyn SearchIndex>,
    state: Arc<dyn SharedState>,
    classifier: Arc<dyn Classifier>,
    store: Arc<TieredEventStore>,
}

impl TriageEngine {
    pub fn new(
        config: TriageConfig,
        patterns: Vec<TriagePattern>,
        search: Arc<dyn SearchIndex>,
        state: Arc<dyn SharedState>,
        classifier: Arc<dyn Classifier>,
        store: Arc<TieredEventStore>,
    ) -> Self {
        Self {
            config,
            patterns,
            search,
            state,
            classifier,
            store,
        }
    }

    /// One scan pass over the failure lookback window. Infallible by
    /// contract; degraded passes surface through the report and the
    /// audit trail.
    pub async fn scan(&self) -> TriageReport {
        let since_ms = Utc::now().timestamp_millis() - self.config.lookback_mins * 60_000;
        let events = match self
            .search
            .search_failures(since_ms, self.config.batch_limit)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "triage scan could not read failures, skipping pass");
                return TriageReport::default();
            }
        };
        metrics::counter!("triage.scanned").increment(events.len() as u64);

        // In-batch occurrence counts per failure signature.
        let mut counts: HashMap<String, u64> = HashMap::new();
        for event in &events {
            *counts.entry(signature(event)).or_default() += 1;
        }

        // Deterministic phase.
        let mut classified: Vec<ClassifiedEvent> = events
            .into_iter()
            .map(|event| {
                let key = signature(&event);
                let occurrences = counts.get(&key).copied().unwrap_or(1);
                match select_pattern(&self.patterns, &event) {
                    Some(pattern) => {
                        let mut tier = pattern.tier;
                        if pattern.escalate_after.map_or(false, |n| occurrences >= n) {
                            tier = escalate(tier);
                        }
                        ClassifiedEvent {
                            reasoning: format!("matched pattern `{}`", pattern.name),
                            tier,
                            pattern: Some(pattern.name),
                            handler: pattern.handler,
                            dedup_key: key,
                            occurrences,
                            llm_candidate: false,
                            proposed_pattern: None,
                            event,
                        }
                    }
                    None => ClassifiedEvent {
                        reasoning: "no pattern matched".to_string(),
                        tier: 2,
                        pattern: None,
                        handler: None,
                        dedup_key: key,
                        occurrences,
                        llm_candidate: true,
                        proposed_pattern: None,
                        event,
                    },
                }
            })
            .collect();

        // LLM fallback phase for everything the table missed.
        let candidates: Vec<usize> = classified
            .iter()
            .enumerate()
            .filter(|(_, c)| c.llm_candidate)
            .map(|(i, _)| i)
            .collect();
        if !candidates.is_empty() {
            self.classify_candidates(&mut classified, &candidates).await;
        }

        // Dedup gate and audit emission, after tiers are final.
        let mut audited = 0;
        for item in &classified {
            let dedup_hours = item
                .pattern
                .and_then(|name| self.patterns.iter().find(|p| p.name == name))
                .map(|p| p.dedup_hours)
                .unwrap_or(self.config.default_dedup_hours);
            let claim_key = format!("triage:classified:{}", item.dedup_key);
            match self.state.claim(&claim_key, dedup_hours * 3600).await {
                Ok(true) => {
                    self.emit_classified_audit(item, dedup_hours).await;
                    audited += 1;
                }
                Ok(false) => {
                    metrics::counter!("triage.deduped").increment(1);
                }
                Err(e) => {
                    warn!(key = %claim_key, error = %e, "dedup claim failed, skipping audit");
                }
            }
        }

        let mut report = TriageReport {
            audited,
            ..Default::default()
        };
        for item in classified {
            match (item.tier, item.llm_candidate) {
                (2, true) => report.unmatched_tier2.push(item),
                (1, _) => report.tier1.push(item),
                (3, _) => report.tier3.push(item),
                _ => report.tier2.push(item),
            }
        }
        info!(
            tier1 = report.tier1.len(),
            tier2 = report.tier2.len(),
            tier3 = report.tier3.len(),
            unmatched = report.unmatched_tier2.len(),
            audited = report.audited,
            "triage scan complete"
        );
        report
    }

    async fn classify_candidates(&self, classified: &mut [ClassifiedEvent], candidates: &[usize]) {
        let prompt = self.build_prompt(classified, candidates).await;
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.config.llm_timeout_secs),
            self.classifier.classify(&prompt),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(raw)) => match parse_verdicts(&raw) {
                Some(verdicts) if verdicts.len() == candidates.len() => {
                    for (index, verdict) in candidates.iter().zip(verdicts) {
                        let item = &mut classified[*index];
                        item.tier = verdict.tier;
                        item.reasoning = verdict.reasoning;
                        item.proposed_pattern = verdict.proposed_pattern;
                    }
                    return;
                }
                Some(verdicts) => format!(
                    "verdict count mismatch: expected {}, got {}",
                    candidates.len(),
                    verdicts.len()
                ),
                None => "unparseable classifier response".to_string(),
            },
            Ok(Err(e)) => format!("classifier call failed: {e}"),
            Err(_) => format!(
                "classifier timed out after {}s",
                self.config.llm_timeout_secs
            ),
        };

        metrics::counter!("triage.llm_degraded").increment(1);
        warn!(reason = %failure, candidates = candidates.len(), "llm classification degraded to tier 2");
        for index in candidates {
            let item = &mut classified[*index];
            item.tier = 2;
            item.reasoning = format!("llm classification unavailable ({failure}), defaulted to tier 2");
        }
        self.emit_failure_audit(&failure, candidates.len()).await;
    }

    async fn build_prompt(&self, classified: &[ClassifiedEvent], candidates: &[usize]) -> String {
        let mut prompt = String::from(
            "Classify each failure below into tier 1 (known benign), 2 (needs attention), \
             or 3 (critical). Respond with ONLY a JSON array, one object per failure in \
             order: {\"tier\": n, \"reasoning\": \"...\", \"proposed_pattern\": null}.\n",
        );
        for (position, index) in candidates.iter().enumerate() {
            let event = &classified[*index].event;
            let _ = write!(
                prompt,
                "\n{}. component={} action={} level={} error={}\n",
                position + 1,
                event.component,
                event.action,
                event.level,
                event.error.as_deref().unwrap_or_default()
            );
            let context = self
                .search
                .recent_for_component(&event.component, self.config.context_events)
                .await
                .unwrap_or_default();
            for ctx in context {
                let _ = write!(
                    prompt,
                    "   recent: action={} success={} error={}\n",
                    ctx.action,
                    ctx.success,
                    ctx.error.as_deref().unwrap_or("-")
                );
            }
        }
        prompt
    }

    async fn emit_classified_audit(&self, item: &ClassifiedEvent, dedup_hours: u64) {
        let level = match item.tier {
            1 => "info",
            3 => "error",
            _ => "warn",
        };
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("dedup_key".to_string(), serde_json::json!(item.dedup_key));
        metadata.insert("tier".to_string(), serde_json::json!(item.tier));
        metadata.insert("dedup_hours".to_string(), serde_json::json!(dedup_hours));
        metadata.insert(
            "occurrences".to_string(),
            serde_json::json!(item.occurrences),
        );
        metadata.insert(
            "pattern_matched".to_string(),
            serde_json::json!(item.pattern.is_some()),
        );
        if let Some(pattern) = item.pattern {
            metadata.insert("pattern".to_string(), serde_json::json!(pattern));
        }
        if let Some(handler) = item.handler {
            metadata.insert("handler".to_string(), serde_json::json!(handler));
        }
        metadata.insert(
            "llm_candidate".to_string(),
            serde_json::json!(item.llm_candidate),
        );
        if let Some(proposed) = &item.proposed_pattern {
            metadata.insert("proposed_pattern".to_string(), proposed.clone());
        }
        metadata.insert("reasoning".to_string(), serde_json::json!(item.reasoning));
        metadata.insert(
            "origin_event_id".to_string(),
            serde_json::json!(item.event.id),
        );
        metadata.insert(
            "origin_source".to_string(),
            serde_json::json!(item.event.source),
        );
        metadata.insert(
            "origin_component".to_string(),
            serde_json::json!(item.event.component),
        );
        metadata.insert(
            "origin_action".to_string(),
            serde_json::json!(item.event.action),
        );

        let audit = SystemEvent::build(EventInput {
            level: level.to_string(),
            source: "pulse".to_string(),
            component: "triage".to_string(),
            action: "failure_classified".to_string(),
            success: true,
            metadata: Some(metadata),
            ..Default::default()
        });
        match audit {
            Ok(audit) => {
                metrics::counter!("triage.classified").increment(1);
                self.store.store(&audit).await;
            }
            Err(e) => warn!(error = %e, "could not build classified audit event"),
        }
    }

    async fn emit_failure_audit(&self, reason: &str, candidates: usize) {
        let audit = SystemEvent::build(EventInput {
            level: "warn".to_string(),
            source: "pulse".to_string(),
            component: "triage".to_string(),
            action: "llm_classification_failed".to_string(),
            success: false,
            error: Some(reason.to_string()),
            metadata: Some(
                [("candidates".to_string(), serde_json::json!(candidates))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        });
        if let Ok(audit) = audit {
            self.store.store(&audit).await;
        }
    }
}

fn signature(event: &SystemEvent) -> String {
    dedup_key(
        &event.component,
        &event.action,
        event.error.as_deref().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::config::{MirrorConfig, ObservabilityConfig};
    use pulse_core::ports::{MemoryMirrorStore, MemorySearchIndex, MemorySharedState};
    use pulse_core::EventDocument;

    use crate::classifier::FixedClassifier;
    use crate::patterns::default_patterns;

    struct Harness {
        engine: TriageEngine,
        scan_index: Arc<MemorySearchIndex>,
        audit_index: Arc<MemorySearchIndex>,
        state: Arc<MemorySharedState>,
        classifier: Arc<FixedClassifier>,
    }

    fn harness(config: TriageConfig) -> Harness {
        let scan_index = Arc::new(MemorySearchIndex::new());
        let audit_index = Arc::new(MemorySearchIndex::new());
        let state = Arc::new(MemorySharedState::new());
        let classifier = Arc::new(FixedClassifier::new());
        let store = Arc::new(TieredEventStore::new(
            ObservabilityConfig::default(),
            MirrorConfig::default(),
            Arc::clone(&audit_index) as Arc<dyn SearchIndex>,
            Arc::new(MemoryMirrorStore::new()),
            None,
        ));
        let engine = TriageEngine::new(
            config,
            default_patterns(),
            Arc::clone(&scan_index) as Arc<dyn SearchIndex>,
            Arc::clone(&state) as Arc<dyn SharedState>,
            Arc::clone(&classifier) as Arc<dyn Classifier>,
            store,
        );
        Harness {
            engine,
            scan_index,
            audit_index,
            state,
            classifier,
        }
    }

    async fn seed_failure(
        index: &MemorySearchIndex,
        id: &str,
        component: &str,
        action: &str,
        error: &str,
        ts: i64,
    ) {
        let event = SystemEvent::build(EventInput {
            id: Some(id.to_string()),
            timestamp: Some(ts),
            level: "error".to_string(),
            source: "worker".to_string(),
            component: component.to_string(),
            action: action.to_string(),
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        })
        .unwrap();
        index.upsert(EventDocument::from_event(&event)).await.unwrap();
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn test_pattern_match_lands_in_tier_bucket() {
        let h = harness(TriageConfig::default());
        seed_failure(
            &h.scan_index,
            "e1",
            "runtime",
            "invoke",
            "Unable to reach SDK URL",
            now_ms(),
        )
        .await;

        let report = h.engine.scan().await;
        assert_eq!(report.tier3.len(), 1);
        assert_eq!(report.total(), 1);
        assert_eq!(report.tier3[0].pattern, Some("worker-unreachable"));
        assert_eq!(report.tier3[0].handler, Some("restart_worker"));
        assert_eq!(report.audited, 1);
        // LLM never consulted for matched events.
        assert_eq!(h.classifier.call_count(), 0);
        // One classified audit landed in the store.
        assert_eq!(h.audit_index.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_signature_audits_once_but_counts_occurrences() {
        let h = harness(TriageConfig::default());
        for i in 0..3 {
            seed_failure(
                &h.scan_index,
                &format!("e{i}"),
                "runtime",
                "invoke",
                "Unable to reach SDK URL",
                now_ms() - i,
            )
            .await;
        }

        let report = h.engine.scan().await;
        assert_eq!(report.tier3.len(), 3);
        assert_eq!(report.audited, 1);
        assert_eq!(h.audit_index.len(), 1);
        assert!(report.tier3.iter().all(|c| c.occurrences == 3));
        // Claim persists so the next scan stays silent too.
        let again = h.engine.scan().await;
        assert_eq!(again.audited, 0);
    }

    #[tokio::test]
    async fn test_escalation_bumps_one_step_at_threshold() {
        let h = harness(TriageConfig::default());
        // search-index-timeout declares tier 2, escalate_after 5.
        for i in 0..5 {
            seed_failure(
                &h.scan_index,
                &format!("t{i}"),
                "search",
                "query",
                "request timed out",
                now_ms() - i,
            )
            .await;
        }

        let report = h.engine.scan().await;
        assert_eq!(report.tier3.len(), 5);
        assert!(report.tier2.is_empty());
    }

    #[tokio::test]
    async fn test_below_threshold_keeps_declared_tier() {
        let h = harness(TriageConfig::default());
        for i in 0..4 {
            seed_failure(
                &h.scan_index,
                &format!("t{i}"),
                "search",
                "query",
                "request timed out",
                now_ms() - i,
            )
            .await;
        }
        let report = h.engine.scan().await;
        assert_eq!(report.tier2.len(), 4);
        assert!(report.tier3.is_empty());
    }

    #[tokio::test]
    async fn test_llm_verdicts_applied_in_order() {
        let h = harness(TriageConfig::default());
        // Newest first in scan order.
        seed_failure(&h.scan_index, "a", "novel_a", "op", "weird a", now_ms()).await;
        seed_failure(&h.scan_index, "b", "novel_b", "op", "weird b", now_ms() - 1000).await;
        h.classifier.push_reply(
            r#"[{"tier": 1, "reasoning": "benign", "proposed_pattern": null},
                {"tier": 3, "reasoning": "critical", "proposed_pattern": {"component": "novel_b"}}]"#,
        );

        let report = h.engine.scan().await;
        assert_eq!(report.tier1.len(), 1);
        assert_eq!(report.tier3.len(), 1);
        assert!(report.unmatched_tier2.is_empty());
        assert_eq!(report.tier1[0].event.id, "a");
        assert_eq!(report.tier3[0].event.id, "b");
        assert!(report.tier3[0].proposed_pattern.is_some());
        assert_eq!(h.classifier.call_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_error_degrades_batch_to_tier2() {
        let h = harness(TriageConfig::default());
        seed_failure(&h.scan_index, "a", "novel", "op", "weird", now_ms()).await;
        h.classifier.push_error("upstream 500");

        let report = h.engine.scan().await;
        assert_eq!(report.unmatched_tier2.len(), 1);
        assert!(report.unmatched_tier2[0]
            .reasoning
            .contains("llm classification unavailable"));
        // Classified audit plus the warn-level failure audit.
        assert_eq!(h.audit_index.len(), 2);
    }

    #[tokio::test]
    async fn test_llm_timeout_treated_as_failure() {
        let h = harness(TriageConfig {
            llm_timeout_secs: 0,
            ..Default::default()
        });
        seed_failure(&h.scan_index, "a", "novel", "op", "weird", now_ms()).await;
        h.classifier.push_hang();

        let report = h.engine.scan().await;
        assert_eq!(report.unmatched_tier2.len(), 1);
        assert!(report.unmatched_tier2[0].reasoning.contains("timed out"));
    }

    #[tokio::test]
    async fn test_verdict_count_mismatch_degrades() {
        let h = harness(TriageConfig::default());
        seed_failure(&h.scan_index, "a", "novel_a", "op", "weird a", now_ms()).await;
        seed_failure(&h.scan_index, "b", "novel_b", "op", "weird b", now_ms() - 1000).await;
        h.classifier
            .push_reply(r#"[{"tier": 1, "reasoning": "only one"}]"#);

        let report = h.engine.scan().await;
        assert_eq!(report.unmatched_tier2.len(), 2);
        assert!(report.unmatched_tier2[0].reasoning.contains("mismatch"));
    }

    #[tokio::test]
    async fn test_search_failure_yields_empty_report() {
        let h = harness(TriageConfig::default());
        h.scan_index.set_failing(true);
        let report = h.engine.scan().await;
        assert_eq!(report.total(), 0);
        assert_eq!(report.audited, 0);
    }

    #[tokio::test]
    async fn test_context_included_in_prompt() {
        let h = harness(TriageConfig::default());
        seed_failure(&h.scan_index, "a", "novel", "op", "weird", now_ms()).await;
        // A recent success for the same component becomes context.
        let ok = SystemEvent::build(EventInput {
            id: Some("ctx".to_string()),
            timestamp: Some(now_ms() - 500),
            level: "info".to_string(),
            source: "worker".to_string(),
            component: "novel".to_string(),
            action: "op".to_string(),
            success: true,
            ..Default::default()
        })
        .unwrap();
        h.scan_index
            .upsert(EventDocument::from_event(&ok))
            .await
            .unwrap();
        h.classifier
            .push_reply(r#"[{"tier": 2, "reasoning": "x"}]"#);

        h.engine.scan().await;
        let prompts = h.classifier.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("component=novel"));
        assert!(prompts[0].contains("recent:"));
    }

    #[tokio::test]
    async fn test_dedup_claim_key_shape() {
        let h = harness(TriageConfig::default());
        seed_failure(
            &h.scan_index,
            "e1",
            "runtime",
            "invoke",
            "Unable to reach SDK URL",
            now_ms(),
        )
        .await;
        h.engine.scan().await;
        let key = dedup_key("runtime", "invoke", "Unable to reach SDK URL");
        assert!(h.state.has_claim(&format!("triage:classified:{key}")));
    }
}
