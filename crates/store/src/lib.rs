//! Tiered event persistence: the debug backpressure guard, the
//! three-tier store with independent failure isolation, and the
//! production adapters (search index, mirror store, alert sink, Redis
//! shared state) behind the `pulse-core` ports.

pub mod alert;
pub mod guard;
pub mod mirror;
pub mod redis_state;
pub mod search;
pub mod tiered;

pub use alert::HttpAlertSink;
pub use guard::{Admission, DebugBudget};
pub use mirror::HttpMirrorStore;
pub use redis_state::RedisSharedState;
pub use search::HttpSearchIndex;
pub use tiered::{StoreReceipt, TierOutcome, TieredEventStore};
