//! Audit emission shared by the workers, with bounded self-reporting:
//! a worker whose own audit writes are failing escalates that fact at
//! most once per cooldown instead of looping on itself.

use tracing::{error, warn};

use pulse_core::event::SystemEvent;
use pulse_core::ports::SharedState;
use pulse_store::{TierOutcome, TieredEventStore};

const AUDIT_FAILURE_CLAIM: &str = "pulse:audit:failure";
const AUDIT_FAILURE_COOLDOWN_SECS: u64 = 30 * 60;

/// Store one worker audit event; if the primary write fails, escalate
/// through the log exactly once per cooldown window.
pub async fn emit_audit(store: &TieredEventStore, state: &dyn SharedState, event: &SystemEvent) {
    let receipt = store.store(event).await;
    let TierOutcome::Failed(reason) = &receipt.primary else {
        return;
    };

    metrics::counter!("reconcile.audit_failures").increment(1);
    match state
        .claim(AUDIT_FAILURE_CLAIM, AUDIT_FAILURE_COOLDOWN_SECS)
        .await
    {
        Ok(true) => {
            error!(error = %reason, "worker audit writes are failing");
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "audit-failure cooldown claim unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pulse_core::config::{MirrorConfig, ObservabilityConfig};
    use pulse_core::event::EventInput;
    use pulse_core::ports::{MemoryMirrorStore, MemorySearchIndex, MemorySharedState};

    fn store(index: Arc<MemorySearchIndex>) -> TieredEventStore {
        TieredEventStore::new(
            ObservabilityConfig::default(),
            MirrorConfig::default(),
            index,
            Arc::new(MemoryMirrorStore::new()),
            None,
        )
    }

    fn event() -> SystemEvent {
        SystemEvent::build(EventInput {
            level: "info".to_string(),
            source: "pulse".to_string(),
            component: "bridge".to_string(),
            action: "health_reconciled".to_string(),
            success: true,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_healthy_write_takes_no_claim() {
        let index = Arc::new(MemorySearchIndex::new());
        let store = store(Arc::clone(&index));
        let state = MemorySharedState::new();
        emit_audit(&store, &state, &event()).await;
        assert_eq!(index.len(), 1);
        assert!(!state.has_claim(AUDIT_FAILURE_CLAIM));
    }

    #[tokio::test]
    async fn test_failing_writes_claim_once_per_cooldown() {
        let index = Arc::new(MemorySearchIndex::new());
        index.set_failing(true);
        let store = store(Arc::clone(&index));
        let state = MemorySharedState::new();

        emit_audit(&store, &state, &event()).await;
        assert!(state.has_claim(AUDIT_FAILURE_CLAIM));
        // Second failure within the window does not re-claim.
        emit_audit(&store, &state, &event()).await;
        assert!(state.has_claim(AUDIT_FAILURE_CLAIM));
    }
}
