//! Tracing bootstrap for hosts embedding Pulse. There is no binary in
//! this workspace; the scheduler process calls this once at startup.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a JSON-formatted subscriber honoring `RUST_LOG`, defaulting
/// to `info`. Safe to call once per process; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init();
}
