//! Fixed-window backpressure counters for debug-level events.
//!
//! Each `source:component:action` key gets up to `cap` accepted events
//! per window; once the window's elapsed time exceeds the period the
//! counter resets fully. This is a fixed window, not a sliding log: a
//! burst straddling a boundary may admit up to 2x cap across roughly
//! two periods. That relaxation is deliberate and documented; do not
//! swap in a sliding window here.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Dropped; carries the running drop count for this key's window.
    Dropped { dropped_in_window: u64 },
}

#[derive(Debug)]
struct Window {
    started: Instant,
    accepted: u32,
    dropped: u64,
}

/// Per-key debug budget. Process-scoped; counters reset on restart.
pub struct DebugBudget {
    cap: u32,
    period: Duration,
    log_interval: u64,
    windows: DashMap<String, Window>,
}

impl DebugBudget {
    pub fn new(cap: u32, period: Duration, log_interval: u64) -> Self {
        Self {
            cap,
            period,
            log_interval: log_interval.max(1),
            windows: DashMap::new(),
        }
    }

    /// Admit or drop one debug event for `key`.
    pub fn admit(&self, key: &str) -> Admission {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            started: Instant::now(),
            accepted: 0,
            dropped: 0,
        });

        if entry.started.elapsed() >= self.period {
            entry.started = Instant::now();
            entry.accepted = 0;
            entry.dropped = 0;
        }

        if entry.accepted < self.cap {
            entry.accepted += 1;
            Admission::Accepted
        } else {
            entry.dropped += 1;
            metrics::counter!("store.debug_dropped").increment(1);
            Admission::Dropped {
                dropped_in_window: entry.dropped,
            }
        }
    }

    /// Log only the first drop and every Nth thereafter per key, to
    /// keep a storm of drops from becoming a storm of logs.
    pub fn should_log_drop(&self, dropped_in_window: u64) -> bool {
        dropped_in_window == 1 || dropped_in_window % self.log_interval == 0
    }
}
