//! Two-phase failure triage: a deterministic pattern table with
//! escalation and dedup, then an LLM fallback for anything the table
//! does not recognize. The engine degrades instead of raising; its only
//! outputs are a [`TriageReport`] and audit events.

pub mod classifier;
pub mod engine;
pub mod parse;
pub mod patterns;

pub use classifier::{Classifier, FixedClassifier, HttpClassifier};
pub use engine::{ClassifiedEvent, TriageEngine, TriageReport};
pub use parse::{parse_verdicts, LlmVerdict};
pub use patterns::{default_patterns, select_pattern, TriagePattern};
