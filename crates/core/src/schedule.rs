//! Declarative bindings for the external durable workflow runtime.
//!
//! Pulse declares triggers, concurrency ceilings, throttles, and retry
//! budgets per entry point; the host scheduler enforces them. Nothing
//! here implements scheduling.

use serde::Serialize;

/// Trigger for one scheduled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fire on a named platform event.
    Event(String),
    /// Fire on a cron expression.
    Cron(String),
}

/// At most `limit` concurrent invocations sharing `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrencyLimit {
    pub limit: u32,
    pub key: String,
}

/// At most `limit` invocations per `period_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Throttle {
    pub limit: u32,
    pub period_secs: u64,
}

/// Everything the host scheduler needs to register one function.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionSpec {
    pub id: &'static str,
    pub triggers: Vec<Trigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    pub retries: u32,
}

/// Triage scan: cron-driven, serialized globally.
pub fn triage_scan_spec() -> FunctionSpec {
    FunctionSpec {
        id: "pulse.triage.scan",
        triggers: vec![Trigger::Cron("*/10 * * * *".to_string())],
        concurrency: Some(ConcurrencyLimit {
            limit: 1,
            key: "triage".to_string(),
        }),
        throttle: None,
        retries: 2,
    }
}

/// Bridge reconciler: cron plus on-demand heal requests; at most one
/// pass in flight per domain.
pub fn bridge_reconcile_spec() -> FunctionSpec {
    FunctionSpec {
        id: "pulse.bridge.reconcile",
        triggers: vec![
            Trigger::Cron("*/5 * * * *".to_string()),
            Trigger::Event("system.heal.requested".to_string()),
        ],
        concurrency: Some(ConcurrencyLimit {
            limit: 1,
            key: "event.data.domain".to_string(),
        }),
        throttle: Some(Throttle {
            limit: 6,
            period_secs: 300,
        }),
        retries: 1,
    }
}

/// Reachability investigator: cron plus on-demand.
pub fn investigator_spec() -> FunctionSpec {
    FunctionSpec {
        id: "pulse.investigator.sweep",
        triggers: vec![
            Trigger::Cron("*/15 * * * *".to_string()),
            Trigger::Event("system.heal.requested".to_string()),
        ],
        concurrency: Some(ConcurrencyLimit {
            limit: 1,
            key: "investigator".to_string(),
        }),
        throttle: Some(Throttle {
            limit: 4,
            period_secs: 600,
        }),
        retries: 1,
    }
}
