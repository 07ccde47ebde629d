//! Remediation handlers and the registry that dispatches them.
//!
//! Handlers never throw to callers: the registry converts every error
//! and panic into `{ fixed: false, detail }` so a broken handler can
//! degrade a heal but never crash a worker.

pub mod git;
pub mod process;
pub mod registry;

pub use git::AutoCommitHandler;
pub use process::RestartWorkerHandler;
pub use registry::{HandlerRegistry, IgnoreHandler, Remediation, RemediationHandler};
