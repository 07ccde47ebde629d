//! Bridge health reconciler: a cheap summary every pass, destructive
//! cleanup at most once per cooldown window.
//!
//! The reconciler only deletes entries it has independently verified
//! are stale or orphaned; live entries are never mutated. Ambiguous
//! state (shared-state reads failing) is a noop, never grounds for
//! cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use pulse_core::config::BridgeConfig;
use pulse_core::envelope::{flow_trace_key, HealCompletion, HealRequest, HealStatus};
use pulse_core::event::{EventInput, SystemEvent};
use pulse_core::ports::SharedState;
use pulse_store::TieredEventStore;

use crate::audit::emit_audit;

pub const DOMAIN: &str = "bridge";
pub const HEAL_EVENT: &str = "system.heal.requested";

const SESSIONS_KEY: &str = "bridge:sessions";
const INBOUND_KEY: &str = "bridge:inbound";
const STREAM_KEY: &str = "bridge:stream";
const STREAM_GROUP: &str = "bridge-workers";
const PRIORITY_KEY: &str = "bridge:priority";
const CLEANUP_CLAIM: &str = "bridge:cleanup:cooldown";

/// Share of a sampled inbound queue that must fail envelope validation
/// before the queue is purged wholesale.
const PURGE_MAJORITY_PERCENT: usize = 80;

/// One pass's view of the bridge, serialized into the audit event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeHealthSummary {
    pub sessions: u64,
    pub queue_depth: u64,
    pub stream_depth: u64,
    pub pending: usize,
    pub stale_pending: usize,
    pub priority_orphans: usize,
    pub degraded: bool,
    /// Short tags for downstream pattern matching, not prose.
    pub reasons: Vec<&'static str>,
    pub cleanup_performed: bool,
    pub stream_trimmed: u64,
    pub orphans_removed: u64,
    pub inbound_purged: bool,
}

pub struct BridgeReconciler {
    config: BridgeConfig,
    state: Arc<dyn SharedState>,
    store: Arc<TieredEventStore>,
}

impl BridgeReconciler {
    pub fn new(
        config: BridgeConfig,
        state: Arc<dyn SharedState>,
        store: Arc<TieredEventStore>,
    ) -> Self {
        Self {
            config,
            state,
            store,
        }
    }

    /// Cron entry point. No completion is emitted.
    pub async fn run_scheduled(&self) -> BridgeHealthSummary {
        self.reconcile(None).await.0
    }

    /// Protocol entry point: same pass, plus a completion envelope.
    pub async fn handle_request(&self, request: &HealRequest) -> HealCompletion {
        match self.reconcile(Some(request)).await.1 {
            Some(completion) => completion,
            None => HealCompletion::noop(DOMAIN),
        }
    }

    async fn reconcile(
        &self,
        request: Option<&HealRequest>,
    ) -> (BridgeHealthSummary, Option<HealCompletion>) {
        let dry_run = request.map_or(false, |r| r.dry_run);

        let mut summary = match self.summarize().await {
            Ok(summary) => summary,
            Err(e) => {
                // Undeterminable state is noop, not grounds for action.
                // The store may still be reachable, so the skipped pass
                // leaves an audit trail.
                warn!(error = %e, "bridge state unreadable, skipping pass");
                self.emit_skipped_audit(&e).await;
                return (
                    BridgeHealthSummary::default(),
                    request.map(|_| HealCompletion::noop(DOMAIN)),
                );
            }
        };

        if summary.degraded && !dry_run {
            let cooldown_secs = self.config.cleanup_cooldown_mins * 60;
            match self.state.claim(CLEANUP_CLAIM, cooldown_secs).await {
                Ok(true) => {
                    if let Err(e) = self.cleanup(&mut summary).await {
                        warn!(error = %e, "bridge cleanup aborted");
                    }
                }
                Ok(false) => {
                    info!("bridge cleanup skipped, cooldown active");
                }
                Err(e) => {
                    warn!(error = %e, "cleanup cooldown claim unavailable");
                }
            }
        }

        self.emit_pass_audit(&summary, request).await;

        let completion = request.map(|req| {
            let status = if summary.cleanup_performed {
                HealStatus::Remediated
            } else if summary.degraded {
                HealStatus::Detected
            } else {
                HealStatus::Noop
            };
            let mut context = BTreeMap::new();
            context.insert("reasons".to_string(), serde_json::json!(summary.reasons));
            context.insert("sessions".to_string(), serde_json::json!(summary.sessions));
            context.insert(
                "queue_depth".to_string(),
                serde_json::json!(summary.queue_depth),
            );
            context.insert(
                "stream_depth".to_string(),
                serde_json::json!(summary.stream_depth),
            );
            context.insert("dry_run".to_string(), serde_json::json!(req.dry_run));
            HealCompletion {
                domain: DOMAIN.to_string(),
                status,
                detected: summary.degraded,
                inspected: summary.pending,
                remediation_detail: summary.cleanup_performed.then(|| {
                    format!(
                        "trimmed {} stream entries, removed {} orphans, purged inbound: {}",
                        summary.stream_trimmed, summary.orphans_removed, summary.inbound_purged
                    )
                }),
                sample_run_ids: Vec::new(),
                context,
            }
        });

        (summary, completion)
    }

    async fn summarize(&self) -> anyhow::Result<BridgeHealthSummary> {
        let sessions = self.state.set_size(SESSIONS_KEY).await?;
        let queue_depth = self.state.list_len(INBOUND_KEY).await?;
        let stream_depth = self.state.stream_len(STREAM_KEY).await?;
        let pending = self.state.pending(STREAM_KEY, STREAM_GROUP).await?;

        let stale_cutoff_ms = self.config.stale_pending_mins * 60_000;
        let stale_pending = pending
            .iter()
            .filter(|p| p.idle_ms > stale_cutoff_ms)
            .count();

        // Orphan detection is a read; removal is cleanup-gated.
        let mut priority_orphans = 0;
        for member in self.state.zset_members(PRIORITY_KEY).await? {
            let hit = self
                .state
                .stream_range(STREAM_KEY, &member, &member, 1)
                .await?;
            if hit.is_empty() {
                priority_orphans += 1;
            }
        }

        let mut reasons = Vec::new();
        if sessions == 0 {
            reasons.push("no_active_sessions");
        }
        if queue_depth > self.config.queue_threshold {
            reasons.push("queue_depth");
        }
        if stream_depth > self.config.stream_threshold {
            reasons.push("stream_depth");
        }
        if pending.len() as u64 > self.config.pending_threshold {
            reasons.push("pending_depth");
        }
        if stale_pending > 0 {
            reasons.push("stale_pending");
        }
        if priority_orphans > 0 {
            reasons.push("priority_orphans");
        }

        Ok(BridgeHealthSummary {
            sessions,
            queue_depth,
            stream_depth,
            pending: pending.len(),
            stale_pending,
            priority_orphans,
            degraded: !reasons.is_empty(),
            reasons,
            ..Default::default()
        })
    }

    // `cleanup_performed` is set only after a destructive action has
    // actually succeeded; an aborted or empty pass reports detected,
    // not remediated.
    async fn cleanup(&self, summary: &mut BridgeHealthSummary) -> anyhow::Result<()> {
        // Trim old unclaimed stream entries. Claimed (pending) entries
        // belong to a consumer and are left alone.
        let cutoff_ms = Utc::now().timestamp_millis() - self.config.trim_age_hours * 3_600_000;
        let old = self
            .state
            .stream_range(STREAM_KEY, "-", &format!("{cutoff_ms}-999999"), 500)
            .await?;
        let claimed: Vec<String> = self
            .state
            .pending(STREAM_KEY, STREAM_GROUP)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let trim_ids: Vec<String> = old
            .into_iter()
            .map(|e| e.id)
            .filter(|id| !claimed.contains(id))
            .collect();
        if !trim_ids.is_empty() {
            summary.stream_trimmed = self.state.stream_delete(STREAM_KEY, &trim_ids).await?;
            summary.cleanup_performed = true;
        }

        // Remove priority-index orphans found during the summary read,
        // re-verified here against the live stream.
        let mut orphans = Vec::new();
        for member in self.state.zset_members(PRIORITY_KEY).await? {
            let hit = self
                .state
                .stream_range(STREAM_KEY, &member, &member, 1)
                .await?;
            if hit.is_empty() {
                orphans.push(member);
            }
        }
        if !orphans.is_empty() {
            summary.orphans_removed = self.state.zset_remove(PRIORITY_KEY, &orphans).await?;
            summary.cleanup_performed = true;
        }

        // Purge the inbound queue only when a sampled large majority
        // fails envelope validation.
        let sample = self
            .state
            .list_sample(INBOUND_KEY, self.config.queue_sample_size)
            .await?;
        if !sample.is_empty() {
            let invalid = sample
                .iter()
                .filter(|raw| !is_valid_envelope(raw))
                .count();
            if invalid * 100 >= sample.len() * PURGE_MAJORITY_PERCENT {
                self.state.delete(INBOUND_KEY).await?;
                summary.inbound_purged = true;
                summary.cleanup_performed = true;
            }
        }

        metrics::counter!("bridge.cleanups").increment(1);
        Ok(())
    }

    async fn emit_skipped_audit(&self, error: &anyhow::Error) {
        let audit = SystemEvent::build(EventInput {
            level: "warn".to_string(),
            source: "pulse".to_string(),
            component: "bridge".to_string(),
            action: "health_reconciled".to_string(),
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        });
        match audit {
            Ok(audit) => emit_audit(&self.store, self.state.as_ref(), &audit).await,
            Err(e) => warn!(error = %e, "could not build bridge audit event"),
        }
    }

    async fn emit_pass_audit(&self, summary: &BridgeHealthSummary, request: Option<&HealRequest>) {
        let level = if summary.degraded { "warn" } else { "info" };
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
            component: "bridge".to_string(),
            action: "health_reconciled".to_string(),
            success: true,
            metadata: Some(metadata),
            ..Default::default()
        });
        match audit {
            Ok(audit) => emit_audit(&self.store, self.state.as_ref(), &audit).await,
            Err(e) => warn!(error = %e, "could not build bridge audit event"),
        }
    }
}

fn is_valid_envelope(raw: &str) -> bool {
    SystemEvent::from_json(raw).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::config::{MirrorConfig, ObservabilityConfig};
    use pulse_core::ports::{
        MemoryMirrorStore, MemorySearchIndex, MemorySharedState, PendingEntry, SearchIndex,
    };

    struct Harness {
        reconciler: BridgeReconciler,
        state: Arc<MemorySharedState>,
        audit_index: Arc<MemorySearchIndex>,
    }

    fn harness(config: BridgeConfig) -> Harness {
        let state = Arc::new(MemorySharedState::new());
        let audit_index = Arc::new(MemorySearchIndex::new());
        let store = Arc::new(TieredEventStore::new(
            ObservabilityConfig::default(),
            MirrorConfig::default(),
            Arc::clone(&audit_index) as Arc<dyn SearchIndex>,
            Arc::new(MemoryMirrorStore::new()),
            None,
        ));
        let reconciler = BridgeReconciler::new(
            config,
            Arc::clone(&state) as Arc<dyn SharedState>,
            store,
        );
        Harness {
            reconciler,
            state,
            audit_index,
        }
    }

    fn request(dry_run: bool) -> HealRequest {
        HealRequest {
            domain: DOMAIN.to_string(),
            reason: "manual".to_string(),
            requested_by: "triage".to_string(),
            attempt: 1,
            retry_policy: None,
            dry_run,
            source_function: "triage.scan".to_string(),
            target_component: "bridge".to_string(),
        }
    }

    fn valid_payload() -> String {
        let event = SystemEvent::build(EventInput {
            level: "info".to_string(),
            source: "bridge".to_string(),
            component: "session".to_string(),
            action: "message".to_string(),
            success: true,
            ..Default::default()
        })
        .unwrap();
        serde_json::to_string(&event).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_pass_is_noop() {
        let h = harness(BridgeConfig::default());
        h.state.seed_set(SESSIONS_KEY, &["session-1"]);

        let completion = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Noop);
        assert!(!completion.detected);
        // Audit emitted every pass, healthy included.
        assert_eq!(h.audit_index.len(), 1);
        // No cooldown consumed on a healthy pass.
        assert!(!h.state.has_claim(CLEANUP_CLAIM));
    }

    #[tokio::test]
    async fn test_no_sessions_is_degraded() {
        let h = harness(BridgeConfig::default());
        let summary = h.reconciler.run_scheduled().await;
        assert!(summary.degraded);
        assert_eq!(summary.reasons, vec!["no_active_sessions"]);
    }

    #[tokio::test]
    async fn test_stale_pending_detected() {
        let h = harness(BridgeConfig::default());
        h.state.seed_set(SESSIONS_KEY, &["session-1"]);
        h.state.seed_stream(STREAM_KEY, &[("1700000000000-1", "x")]);
        h.state.seed_pending(
            STREAM_KEY,
            STREAM_GROUP,
            vec![PendingEntry {
                id: "1700000000000-1".to_string(),
                consumer: "worker-a".to_string(),
                idle_ms: 16 * 60_000,
            }],
        );

        let summary = h.reconciler.run_scheduled().await;
        assert!(summary.degraded);
        assert!(summary.reasons.contains(&"stale_pending"));
        assert_eq!(summary.stale_pending, 1);
    }

    #[tokio::test]
    async fn test_dry_run_detects_without_cleanup() {
        let h = harness(BridgeConfig::default());
        // No sessions: degraded.
        let completion = h.reconciler.handle_request(&request(true)).await;
        assert_eq!(completion.status, HealStatus::Detected);
        assert!(completion.detected);
        assert!(!h.state.has_claim(CLEANUP_CLAIM));
    }

    #[tokio::test]
    async fn test_cleanup_trims_orphans_and_old_entries() {
        let h = harness(BridgeConfig::default());
        // Degraded (no sessions); one ancient unclaimed entry, one
        // ancient claimed entry, one orphaned priority member.
        h.state.seed_stream(
            STREAM_KEY,
            &[("1600000000000-1", "old"), ("1600000000000-2", "claimed")],
        );
        h.state.seed_pending(
            STREAM_KEY,
            STREAM_GROUP,
            vec![PendingEntry {
                id: "1600000000000-2".to_string(),
                consumer: "worker-a".to_string(),
                idle_ms: 1000,
            }],
        );
        h.state.seed_zset(PRIORITY_KEY, &["0000000000000-9"]);

        let completion = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Remediated);
        // Unclaimed old entry trimmed, claimed one kept.
        assert_eq!(
            h.state.stream_ids(STREAM_KEY),
            vec!["1600000000000-2".to_string()]
        );
        // Orphan removed.
        assert!(h
            .state
            .zset_members(PRIORITY_KEY)
            .await
            .unwrap()
            .is_empty());
        assert!(h.state.has_claim(CLEANUP_CLAIM));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_second_cleanup() {
        let h = harness(BridgeConfig::default());
        h.state.seed_zset(PRIORITY_KEY, &["0000000000000-9"]);

        let first = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(first.status, HealStatus::Remediated);

        // Still degraded (no sessions), but the claim is held.
        let second = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(second.status, HealStatus::Detected);
    }

    #[tokio::test]
    async fn test_inbound_purged_when_sample_mostly_invalid() {
        let h = harness(BridgeConfig::default());
        let garbage: Vec<String> = (0..5).map(|i| format!("not-json-{i}")).collect();
        let entries: Vec<&str> = garbage.iter().map(String::as_str).collect();
        h.state.seed_list(INBOUND_KEY, &entries);

        let completion = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Remediated);
        assert_eq!(h.state.list_len(INBOUND_KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inbound_kept_when_sample_mostly_valid() {
        let h = harness(BridgeConfig::default());
        let valid = valid_payload();
        let entries: Vec<&str> = vec![&valid, &valid, &valid, &valid, "garbage"];
        h.state.seed_list(INBOUND_KEY, &entries);

        let completion = h.reconciler.handle_request(&request(false)).await;
        // Degraded by no_active_sessions; the cleanup pass ran but the
        // queue survives and nothing was removed, so nothing was
        // remediated.
        assert_eq!(completion.status, HealStatus::Detected);
        assert_eq!(h.state.list_len(INBOUND_KEY).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_to_remove_reports_detected() {
        let h = harness(BridgeConfig::default());
        // Degraded (no sessions) but every key is empty: the cleanup
        // pass performs no destructive action.
        let completion = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Detected);
        assert!(completion.detected);
        // The cooldown was still consumed by the attempt.
        assert!(h.state.has_claim(CLEANUP_CLAIM));
    }

    #[tokio::test]
    async fn test_unreadable_state_still_audited() {
        let h = harness(BridgeConfig::default());
        h.state.set_failing(true);

        let completion = h.reconciler.handle_request(&request(false)).await;
        assert_eq!(completion.status, HealStatus::Noop);
        // The skipped pass is visible in the primary index.
        assert_eq!(h.audit_index.len(), 1);
        let audits = h.audit_index.recent_for_component("bridge", 10).await.unwrap();
        assert!(!audits[0].success);
    }

    #[tokio::test]
    async fn test_queue_threshold_reason() {
        let h = harness(BridgeConfig {
            queue_threshold: 3,
            ..Default::default()
        });
        h.state.seed_set(SESSIONS_KEY, &["s"]);
        let valid = valid_payload();
        let entries: Vec<&str> = std::iter::repeat(valid.as_str()).take(4).collect();
        h.state.seed_list(INBOUND_KEY, &entries);

        let summary = h.reconciler.run_scheduled().await;
        assert!(summary.degraded);
        assert_eq!(summary.reasons, vec!["queue_depth"]);
    }

    #[tokio::test]
    async fn test_every_pass_emits_audit() {
        let h = harness(BridgeConfig::default());
        h.state.seed_set(SESSIONS_KEY, &["s"]);
        h.reconciler.run_scheduled().await;
        h.reconciler.run_scheduled().await;
        assert_eq!(h.audit_index.len(), 2);
    }
}
