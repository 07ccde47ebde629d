//! The self-healing request/completion envelope shared by the
//! reconciliation workers, plus the deterministic flow-trace key used to
//! correlate causally-related audit events without a central trace store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A request asking a worker to inspect (and possibly repair) a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealRequest {
    pub domain: String,
    pub reason: String,
    pub requested_by: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    pub source_function: String,
    pub target_component: String,
}

/// Outcome of one self-healing pass. The nuance of each variant is
/// intentionally domain-specific (bridge reconciler vs. investigator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealStatus {
    Noop,
    Detected,
    Remediated,
    Invalid,
    Scheduled,
    Exhausted,
    Escalated,
    Blocked,
}

/// The completion paired with a [`HealRequest`]. Neither side is stored
/// beyond the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealCompletion {
    pub domain: String,
    pub status: HealStatus,
    pub detected: bool,
    pub inspected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_run_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl HealCompletion {
    pub fn noop(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            status: HealStatus::Noop,
            detected: false,
            inspected: 0,
            remediation_detail: None,
            sample_run_ids: Vec::new(),
            context: BTreeMap::new(),
        }
    }
}

/// Deterministic correlation key for one logical healing flow: sha256
/// over (event name, source function, target component, domain, target
/// event, attempt), truncated to 16 hex chars. Two workers computing the
/// key for the same flow always agree.
pub fn flow_trace_key(
    event_name: &str,
    source_function: &str,
    target_component: &str,
    domain: &str,
    target_event: &str,
    attempt: u32,
) -> String {
    let mut hasher = Sha256::new();
    for part in [event_name, source_function, target_component, domain, target_event] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.update(attempt.to_le_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
