//! Self-healing reconciliation workers: the bridge health reconciler
//! repairs drift in shared queue/stream state, and the reachability
//! investigator detects the unreachable-worker failure mode in recent
//! run history and restarts the worker.

pub mod audit;
pub mod bridge;
pub mod investigator;

pub use bridge::{BridgeHealthSummary, BridgeReconciler};
pub use investigator::{
    is_unreachable_failure, FailedRun, HttpRunHistory, Investigator, InvestigationSummary,
    MemoryRunHistory, RunHistory,
};
