//! The tiered event store: one `store` call fans an event out to the
//! primary search index, the high-severity mirror, and the external
//! alert sink. Each tier is attempted independently; one tier failing
//! never blocks another, and the caller always gets a receipt back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use pulse_core::config::{MirrorConfig, ObservabilityConfig};
use pulse_core::event::{EventDocument, SystemEvent};
use pulse_core::ports::{AlertSink, MirrorResource, MirrorStore, SearchIndex};

use crate::guard::{Admission, DebugBudget};

/// Drop reason when observability is globally disabled.
pub const REASON_DISABLED: &str = "disabled";
/// Drop reason when the debug budget rejects an event.
pub const REASON_DEBUG_GUARD: &str = "debug_backpressure_guard";

/// Per-tier result inside a [`StoreReceipt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    Written,
    Skipped(&'static str),
    Failed(String),
}

impl TierOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, TierOutcome::Written)
    }
}

/// Structured outcome of one `store` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub dropped: bool,
    pub drop_reason: Option<&'static str>,
    pub primary: TierOutcome,
    pub mirror: TierOutcome,
    pub alert: TierOutcome,
}

impl StoreReceipt {
    fn dropped(reason: &'static str) -> Self {
        Self {
            dropped: true,
            drop_reason: Some(reason),
            primary: TierOutcome::Skipped(reason),
            mirror: TierOutcome::Skipped(reason),
            alert: TierOutcome::Skipped(reason),
        }
    }
}

/// Process-scoped tiered store. Mutable state (debug budget, memoized
/// collection readiness, prune clock) is explicit and resets on
/// restart; tests construct their own instance with fake ports.
pub struct TieredEventStore {
    observability: ObservabilityConfig,
    mirror_config: MirrorConfig,
    guard: DebugBudget,
    search: Arc<dyn SearchIndex>,
    mirror: Arc<dyn MirrorStore>,
    alert: Option<Arc<dyn AlertSink>>,
    /// Collection creation is lazy and at-most-once per process; racing
    /// callers share the in-flight initialization.
    ready: OnceCell<()>,
    last_prune: Mutex<Option<Instant>>,
}

impl TieredEventStore {
    pub fn new(
        observability: ObservabilityConfig,
        mirror_config: MirrorConfig,
        search: Arc<dyn SearchIndex>,
        mirror: Arc<dyn MirrorStore>,
        alert: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        let guard = DebugBudget::new(
            observability.debug_window_cap,
            Duration::from_secs(observability.debug_window_secs),
            observability.drop_log_interval,
        );
        Self {
            observability,
            mirror_config,
            guard,
            search,
            mirror,
            alert,
            ready: OnceCell::new(),
            last_prune: Mutex::new(None),
        }
    }

    /// Persist one event across all tiers. Never returns an error: the
    /// receipt carries per-tier outcomes and the caller's own flow is
    /// unaffected by storage failures.
    pub async fn store(&self, event: &SystemEvent) -> StoreReceipt {
        if !self.observability.enabled {
            return StoreReceipt::dropped(REASON_DISABLED);
        }

        if event.level == pulse_core::Level::Debug {
            if let Admission::Dropped { dropped_in_window } = self.guard.admit(&event.budget_key())
            {
                if self.guard.should_log_drop(dropped_in_window) {
                    warn!(
                        key = %event.budget_key(),
                        dropped_in_window,
                        "debug event dropped by backpressure guard"
                    );
                }
                return StoreReceipt::dropped(REASON_DEBUG_GUARD);
            }
        }

        let primary = self.write_primary(event).await;
        let mirror = self.write_mirror(event).await;
        let alert = self.forward_alert(event).await;

        metrics::counter!("store.events").increment(1);
        StoreReceipt {
            dropped: false,
            drop_reason: None,
            primary,
            mirror,
            alert,
        }
    }

    async fn write_primary(&self, event: &SystemEvent) -> TierOutcome {
        let ready = self
            .ready
            .get_or_try_init(|| async { self.search.ensure_collection().await })
            .await;
        if let Err(e) = ready {
            metrics::counter!("store.primary_errors").increment(1);
            return TierOutcome::Failed(format!("collection init: {e}"));
        }

        match self.search.upsert(EventDocument::from_event(event)).await {
            Ok(()) => TierOutcome::Written,
            Err(e) => {
                metrics::counter!("store.primary_errors").increment(1);
                warn!(event_id = %event.id, error = %e, "primary tier write failed");
                TierOutcome::Failed(e.to_string())
            }
        }
    }

    async fn write_mirror(&self, event: &SystemEvent) -> TierOutcome {
        if !event.level.is_high_severity() {
            return TierOutcome::Skipped("low_severity");
        }

        let cutoff_ms =
            Utc::now().timestamp_millis() - self.mirror_config.recency_window_mins * 60_000;
        if event.timestamp < cutoff_ms {
            return TierOutcome::Skipped("stale");
        }

        let resource = MirrorResource {
            id: event.id.clone(),
            resource_type: self.mirror_config.resource_type.clone(),
            created_at_ms: event.timestamp,
            fields: [
                ("level".to_string(), serde_json::json!(event.level.as_str())),
                ("source".to_string(), serde_json::json!(event.source)),
                ("component".to_string(), serde_json::json!(event.component)),
                ("action".to_string(), serde_json::json!(event.action)),
                ("error".to_string(), serde_json::json!(event.error)),
            ]
            .into_iter()
            .collect(),
            search_text: Some(format!(
                "{} {} {}",
                event.component,
                event.action,
                event.error.as_deref().unwrap_or_default()
            )),
        };

        let outcome = match self.mirror.push(resource).await {
            Ok(()) => TierOutcome::Written,
            Err(e) => {
                metrics::counter!("store.mirror_errors").increment(1);
                warn!(event_id = %event.id, error = %e, "mirror tier write failed");
                TierOutcome::Failed(e.to_string())
            }
        };

        self.maybe_prune_mirror(cutoff_ms).await;
        outcome
    }

    /// Rolling-window prune, rate limited to once per configured
    /// interval process-wide so hot paths never pay for it repeatedly.
    async fn maybe_prune_mirror(&self, cutoff_ms: i64) {
        {
            let mut last = self.last_prune.lock();
            let interval = Duration::from_secs(self.mirror_config.prune_interval_mins * 60);
            if last.map_or(false, |at| at.elapsed() < interval) {
                return;
            }
            *last = Some(Instant::now());
        }

        let listed = self
            .mirror
            .list_by_type(&self.mirror_config.resource_type, 200)
            .await;
        let resources = match listed {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "mirror prune listing failed");
                return;
            }
        };

        let mut removed = 0_u64;
        for resource in resources {
            if resource.created_at_ms < cutoff_ms {
                if self.mirror.remove(&resource.id).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            metrics::counter!("store.mirror_pruned").increment(removed);
            debug!(removed, "pruned stale mirror resources");
        }
    }

    async fn forward_alert(&self, event: &SystemEvent) -> TierOutcome {
        if !event.level.is_high_severity() {
            return TierOutcome::Skipped("low_severity");
        }
        let Some(sink) = &self.alert else {
            return TierOutcome::Skipped("unconfigured");
        };

        match sink.forward(event).await {
            Ok(()) => TierOutcome::Written,
            Err(e) => {
                metrics::counter!("store.alert_errors").increment(1);
                debug!(event_id = %event.id, error = %e, "alert forward failed");
                TierOutcome::Failed(e.to_string())
            }
        }
    }

    /// The search port this store writes through (read side for triage).
    pub fn search_index(&self) -> Arc<dyn SearchIndex> {
        Arc::clone(&self.search)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::event::EventInput;
    use pulse_core::ports::{MemoryAlertSink, MemoryMirrorStore, MemorySearchIndex};

    fn event(level: &str, success: bool) -> SystemEvent {
        SystemEvent::build(EventInput {
            level: level.to_string(),
            source: "worker".to_string(),
            component: "gateway".to_string(),
            action: "dispatch".to_string(),
            success,
            error: (!success).then(|| "boom".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    struct Harness {
        store: TieredEventStore,
        search: Arc<MemorySearchIndex>,
        mirror: Arc<MemoryMirrorStore>,
        alert: Arc<MemoryAlertSink>,
    }

    fn harness(observability: ObservabilityConfig) -> Harness {
        let search = Arc::new(MemorySearchIndex::new());
        let mirror = Arc::new(MemoryMirrorStore::new());
        let alert = Arc::new(MemoryAlertSink::new());
        let store = TieredEventStore::new(
            observability,
            MirrorConfig::default(),
            Arc::clone(&search) as Arc<dyn SearchIndex>,
            Arc::clone(&mirror) as Arc<dyn MirrorStore>,
            Some(Arc::clone(&alert) as Arc<dyn AlertSink>),
        );
        Harness {
            store,
            search,
            mirror,
            alert,
        }
    }

    #[tokio::test]
    async fn test_disabled_gate_is_side_effect_free() {
        let h = harness(ObservabilityConfig {
            enabled: false,
            ..Default::default()
        });
        let receipt = h.store.store(&event("error", false)).await;
        assert!(receipt.dropped);
        assert_eq!(receipt.drop_reason, Some(REASON_DISABLED));
        assert_eq!(h.search.len(), 0);
        assert_eq!(h.mirror.len(), 0);
        assert_eq!(h.alert.count(), 0);
        assert_eq!(h.search.collection_inits(), 0);
    }

    #[tokio::test]
    async fn test_all_tiers_for_high_severity() {
        let h = harness(ObservabilityConfig::default());
        let receipt = h.store.store(&event("error", false)).await;
        assert!(!receipt.dropped);
        assert!(receipt.primary.is_written());
        assert!(receipt.mirror.is_written());
        assert!(receipt.alert.is_written());
        assert_eq!(h.mirror.len(), 1);
        assert_eq!(h.alert.count(), 1);
    }

    #[tokio::test]
    async fn test_info_skips_mirror_and_alert() {
        let h = harness(ObservabilityConfig::default());
        let receipt = h.store.store(&event("info", true)).await;
        assert!(receipt.primary.is_written());
        assert_eq!(receipt.mirror, TierOutcome::Skipped("low_severity"));
        assert_eq!(receipt.alert, TierOutcome::Skipped("low_severity"));
    }

    #[tokio::test]
    async fn test_stale_high_severity_skips_mirror() {
        let h = harness(ObservabilityConfig::default());
        let mut old = event("error", false);
        old.timestamp = Utc::now().timestamp_millis() - 2 * 60 * 60 * 1000;
        let receipt = h.store.store(&old).await;
        assert_eq!(receipt.mirror, TierOutcome::Skipped("stale"));
        // Alert tier is recency-agnostic.
        assert!(receipt.alert.is_written());
    }

    #[tokio::test]
    async fn test_primary_failure_never_blocks_other_tiers() {
        let h = harness(ObservabilityConfig::default());
        h.search.set_failing(true);
        let receipt = h.store.store(&event("error", false)).await;
        assert!(matches!(receipt.primary, TierOutcome::Failed(_)));
        assert!(receipt.mirror.is_written());
        assert!(receipt.alert.is_written());
    }

    #[tokio::test]
    async fn test_alert_failure_never_fails_store_call() {
        let h = harness(ObservabilityConfig::default());
        h.alert.set_failing(true);
        let receipt = h.store.store(&event("fatal", false)).await;
        assert!(receipt.primary.is_written());
        assert!(matches!(receipt.alert, TierOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_storing_same_id_twice_yields_one_document() {
        let h = harness(ObservabilityConfig::default());
        let e = event("warn", true);
        h.store.store(&e).await;
        h.store.store(&e).await;
        assert_eq!(h.search.len(), 1);
    }

    #[tokio::test]
    async fn test_collection_init_is_memoized() {
        let h = harness(ObservabilityConfig::default());
        for _ in 0..5 {
            h.store.store(&event("info", true)).await;
        }
        assert_eq!(h.search.collection_inits(), 1);
    }

    #[tokio::test]
    async fn test_debug_backpressure_guard_scenario() {
        // 15 debug events under one key with cap 12: 1-12 stored,
        // 13-15 dropped with the guard reason.
        let h = harness(ObservabilityConfig {
            debug_window_cap: 12,
            ..Default::default()
        });
        let mut stored = 0;
        let mut dropped = 0;
        for i in 0..15 {
            let mut e = event("debug", true);
            e.id = format!("dbg-{i}");
            let receipt = h.store.store(&e).await;
            if receipt.dropped {
                assert_eq!(receipt.drop_reason, Some(REASON_DEBUG_GUARD));
                dropped += 1;
            } else {
                stored += 1;
            }
        }
        assert_eq!(stored, 12);
        assert_eq!(dropped, 3);
        assert_eq!(h.search.len(), 12);
    }

    #[tokio::test]
    async fn test_unconfigured_alert_sink_is_skipped() {
        let search = Arc::new(MemorySearchIndex::new());
        let mirror = Arc::new(MemoryMirrorStore::new());
        let store = TieredEventStore::new(
            ObservabilityConfig::default(),
            MirrorConfig::default(),
            search,
            mirror,
            None,
        );
        let receipt = store.store(&event("error", false)).await;
        assert_eq!(receipt.alert, TierOutcome::Skipped("unconfigured"));
    }
}
