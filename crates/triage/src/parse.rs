//! Tolerant parsing of LLM verdict payloads. Strategies are pure
//! functions tried in a fixed order; the first that yields a valid
//! verdict array wins.

use serde::Deserialize;

/// One classification verdict, in candidate order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmVerdict {
    pub tier: u8,
    pub reasoning: String,
    /// Advisory suggestion for a new table row; never auto-applied.
    #[serde(default)]
    pub proposed_pattern: Option<serde_json::Value>,
}

fn from_json(raw: &str) -> Option<Vec<LlmVerdict>> {
    let verdicts: Vec<LlmVerdict> = serde_json::from_str(raw.trim()).ok()?;
    if verdicts.iter().all(|v| (1..=3).contains(&v.tier)) {
        Some(verdicts)
    } else {
        None
    }
}

/// Strategy 1: the whole payload is the JSON array.
pub fn parse_direct(raw: &str) -> Option<Vec<LlmVerdict>> {
    from_json(raw)
}

/// Strategy 2: the array lives inside the first fenced code block,
/// with or without a language tag.
pub fn parse_fenced(raw: &str) -> Option<Vec<LlmVerdict>> {
    let open = raw.find("```")?;
    let after_fence = &raw[open + 3..];
    // Skip the rest of the fence line (language tag, if any).
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    from_json(&body[..close])
}

/// Strategy 3: slice from the first `[` to the last `]` and hope the
/// surrounding prose was the only problem.
pub fn parse_bracket_slice(raw: &str) -> Option<Vec<LlmVerdict>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    from_json(&raw[start..=end])
}

/// Run the strategies in order; `None` means the payload is unusable.
pub fn parse_verdicts(raw: &str) -> Option<Vec<LlmVerdict>> {
    parse_direct(raw)
        .or_else(|| parse_fenced(raw))
        .or_else(|| parse_bracket_slice(raw))
}
