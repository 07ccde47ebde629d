//! Static triage pattern table and the deterministic selection rules.
//!
//! Patterns are code-defined configuration, not persisted state. The
//! table is small and reviewed by hand; a new failure mode earns a row
//! here only after the LLM phase has proposed it and a human agreed.

use regex::Regex;

use pulse_core::event::{Level, SystemEvent};

/// A deterministic match predicate with its triage consequences.
#[derive(Debug, Clone)]
pub struct TriagePattern {
    pub name: &'static str,
    pub component: Option<&'static str>,
    pub action: Option<&'static str>,
    pub error_regex: Option<Regex>,
    pub level: Option<Level>,
    /// 1 = known benign, 2 = needs attention, 3 = critical.
    pub tier: u8,
    /// Remediation handler name, resolved by the registry.
    pub handler: Option<&'static str>,
    /// Dedup window for the classified audit event.
    pub dedup_hours: u64,
    /// Occurrences within one batch that trigger a one-step tier bump.
    pub escalate_after: Option<u64>,
}

impl TriagePattern {
    pub fn matches(&self, event: &SystemEvent) -> bool {
        if let Some(component) = self.component {
            if event.component != component {
                return false;
            }
        }
        if let Some(action) = self.action {
            if event.action != action {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        if let Some(regex) = &self.error_regex {
            match &event.error {
                Some(error) if regex.is_match(error) => {}
                _ => return false,
            }
        }
        true
    }

    /// Count of populated match fields. Higher wins at selection time.
    pub fn specificity(&self) -> u32 {
        u32::from(self.component.is_some())
            + u32::from(self.action.is_some())
            + u32::from(self.error_regex.is_some())
            + u32::from(self.level.is_some())
    }
}

/// Pick the matching pattern with the highest specificity; a
/// specificity tie goes to the higher declared tier, never to table
/// order.
pub fn select_pattern<'a>(
    patterns: &'a [TriagePattern],
    event: &SystemEvent,
) -> Option<&'a TriagePattern> {
    patterns
        .iter()
        .filter(|p| p.matches(event))
        .max_by_key(|p| (p.specificity(), p.tier))
}

/// One escalation step. Tier 3 is terminal; escalation never skips or
/// decreases.
pub fn escalate(tier: u8) -> u8 {
    match tier {
        1 => 2,
        _ => 3,
    }
}

fn rx(pattern: &'static str) -> Option<Regex> {
    // Table literals only; the table test asserts each one compiles.
    Regex::new(pattern).ok()
}

/// The built-in pattern table.
pub fn default_patterns() -> Vec<TriagePattern> {
    vec![
        TriagePattern {
            name: "bridge-session-close",
            component: Some("bridge"),
            action: Some("session_close"),
            error_regex: None,
            level: Some(Level::Warn),
            tier: 1,
            handler: Some("ignore"),
            dedup_hours: 12,
            escalate_after: None,
        },
        TriagePattern {
            name: "worker-unreachable",
            component: None,
            action: None,
            error_regex: rx(r"(?i)unable to reach sdk url|econnrefused|connect ETIMEDOUT"),
            level: None,
            tier: 3,
            handler: Some("restart_worker"),
            dedup_hours: 1,
            escalate_after: None,
        },
        TriagePattern {
            name: "repo-sync-dirty-tree",
            component: Some("repo_sync"),
            action: None,
            error_regex: rx(r"(?i)uncommitted changes|working tree dirty"),
            level: None,
            tier: 2,
            handler: Some("auto_commit_and_retry"),
            dedup_hours: 4,
            escalate_after: None,
        },
        TriagePattern {
            name: "search-index-timeout",
            component: Some("search"),
            action: None,
            error_regex: rx(r"(?i)timed? ?out"),
            level: None,
            tier: 2,
            handler: None,
            dedup_hours: 2,
            escalate_after: Some(5),
        },
        TriagePattern {
            name: "shared-state-connection",
            component: None,
            action: None,
            error_regex: rx(r"(?i)connection reset|broken pipe|redis"),
            level: Some(Level::Error),
            tier: 2,
            handler: None,
            dedup_hours: 2,
            escalate_after: Some(3),
        },
    ]
}
