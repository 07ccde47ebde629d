//! Port traits for everything Pulse talks to, plus in-memory fakes.
//!
//! Production binds the adapters in `pulse-store`; tests bind the
//! `Memory*` implementations below. Components accept `Arc<dyn ...>` so
//! the wiring stays swappable.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::{EventDocument, SystemEvent};

/// Per-record outcome counts from a bulk import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Primary tier: full-text/vector search index keyed by event id.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Idempotent collection/schema creation.
    async fn ensure_collection(&self) -> anyhow::Result<()>;

    /// Id-keyed upsert; re-delivery of the same id is a no-op overwrite.
    async fn upsert(&self, doc: EventDocument) -> anyhow::Result<()>;

    /// Bulk import returning per-record success/error counts.
    async fn import_batch(&self, docs: Vec<EventDocument>) -> anyhow::Result<ImportSummary>;

    /// Failed events (success=false) with timestamp >= `since_ms`,
    /// newest first.
    async fn search_failures(&self, since_ms: i64, limit: usize)
        -> anyhow::Result<Vec<SystemEvent>>;

    /// Recent events for one component, newest first.
    async fn recent_for_component(
        &self,
        component: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<SystemEvent>>;
}

/// A resource mirrored into the secondary store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorResource {
    pub id: String,
    pub resource_type: String,
    pub created_at_ms: i64,
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_text: Option<String>,
}

/// Secondary tier: small rolling mirror of recent high-severity events.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Upsert by id.
    async fn push(&self, resource: MirrorResource) -> anyhow::Result<()>;

    async fn list_by_type(
        &self,
        resource_type: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MirrorResource>>;

    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}

/// Tertiary tier: best-effort external alert forwarding.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn forward(&self, event: &SystemEvent) -> anyhow::Result<()>;
}

/// One entry read out of a shared stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// A stream message delivered to a consumer group but not yet acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
}

/// Cooldown/shared-state store: atomic set-if-not-exists with TTL plus
/// the set/sorted-set/list/stream primitives the reconciler reads.
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Atomically create `key` with a TTL if absent. Returns true when
    /// this caller won the claim. Claims expire naturally and are never
    /// explicitly deleted.
    async fn claim(&self, key: &str, ttl_secs: u64) -> anyhow::Result<bool>;

    async fn set_size(&self, key: &str) -> anyhow::Result<u64>;

    async fn zset_members(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn zset_remove(&self, key: &str, members: &[String]) -> anyhow::Result<u64>;

    async fn list_len(&self, key: &str) -> anyhow::Result<u64>;

    /// First `count` entries of a list, head first.
    async fn list_sample(&self, key: &str, count: usize) -> anyhow::Result<Vec<String>>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    async fn stream_append(&self, key: &str, payload: &str) -> anyhow::Result<String>;

    async fn stream_len(&self, key: &str) -> anyhow::Result<u64>;

    /// Range query by entry id (inclusive), capped at `count`.
    async fn stream_range(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamEntry>>;

    async fn stream_delete(&self, key: &str, ids: &[String]) -> anyhow::Result<u64>;

    /// Consumer-group pending listing (unacked deliveries).
    async fn pending(&self, key: &str, group: &str) -> anyhow::Result<Vec<PendingEntry>>;
}

// ─── In-memory fakes ────────────────────────────────────────────────────

/// Search index fake: a document map with the same visible semantics as
/// the production adapter, plus a failure toggle for isolation tests.
#[derive(Default)]
pub struct MemorySearchIndex {
    docs: Mutex<HashMap<String, EventDocument>>,
    collection_inits: AtomicU64,
    failing: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn document(&self, id: &str) -> Option<EventDocument> {
        self.docs.lock().get(id).cloned()
    }

    /// Times `ensure_collection` actually ran (memoization checks).
    pub fn collection_inits(&self) -> u64 {
        self.collection_inits.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("search index unavailable (injected)");
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn ensure_collection(&self) -> anyhow::Result<()> {
        self.check()?;
        self.collection_inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, doc: EventDocument) -> anyhow::Result<()> {
        self.check()?;
        self.docs.lock().insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn import_batch(&self, docs: Vec<EventDocument>) -> anyhow::Result<ImportSummary> {
        self.check()?;
        let mut summary = ImportSummary::default();
        let mut map = self.docs.lock();
        for doc in docs {
            if doc.id.is_empty() {
                summary.failed += 1;
                continue;
            }
            map.insert(doc.id.clone(), doc);
            summary.succeeded += 1;
        }
        Ok(summary)
    }

    async fn search_failures(
        &self,
        since_ms: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<SystemEvent>> {
        self.check()?;
        let mut events: Vec<SystemEvent> = self
            .docs
            .lock()
            .values()
            .filter(|d| !d.success && d.timestamp >= since_ms)
            .filter_map(|d| d.to_event().ok())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }

    async fn recent_for_component(
        &self,
        component: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<SystemEvent>> {
        self.check()?;
        let mut events: Vec<SystemEvent> = self
            .docs
            .lock()
            .values()
            .filter(|d| d.component == component)
            .filter_map(|d| d.to_event().ok())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }
}

/// Mirror store fake.
#[derive(Default)]
pub struct MemoryMirrorStore {
    resources: Mutex<HashMap<String, MirrorResource>>,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.lock().contains_key(id)
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn push(&self, resource: MirrorResource) -> anyhow::Result<()> {
        self.resources.lock().insert(resource.id.clone(), resource);
        Ok(())
    }

    async fn list_by_type(
        &self,
        resource_type: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<MirrorResource>> {
        let mut out: Vec<MirrorResource> = self
            .resources
            .lock()
            .values()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        out.truncate(limit);
        Ok(out)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.resources.lock().remove(id);
        Ok(())
    }
}

/// Alert sink fake that captures forwarded events, with a failure toggle
/// so tests can prove tier isolation.
#[derive(Default)]
pub struct MemoryAlertSink {
    forwarded: Mutex<Vec<SystemEvent>>,
    failing: AtomicBool,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> Vec<SystemEvent> {
        self.forwarded.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.forwarded.lock().len()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn forward(&self, event: &SystemEvent) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("alert sink unavailable (injected)");
        }
        self.forwarded.lock().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct SharedStateInner {
    claims: HashMap<String, Instant>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<String>>,
    lists: HashMap<String, VecDeque<String>>,
    streams: HashMap<String, Vec<StreamEntry>>,
    pending: HashMap<String, Vec<PendingEntry>>,
    stream_seq: u64,
}

/// TTL-aware shared-state fake. Seed helpers let tests stage queue,
/// stream, and pending shapes directly.
#[derive(Default)]
pub struct MemorySharedState {
    inner: Mutex<SharedStateInner>,
    failing: AtomicBool,
}

impl MemorySharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_set(&self, key: &str, members: &[&str]) {
        let mut inner = self.inner.lock();
        let set = inner.sets.entry(key.to_string()).or_default();
        for m in members {
            set.insert((*m).to_string());
        }
    }

    pub fn seed_zset(&self, key: &str, members: &[&str]) {
        let mut inner = self.inner.lock();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        for m in members {
            zset.push((*m).to_string());
        }
    }

    pub fn seed_list(&self, key: &str, entries: &[&str]) {
        let mut inner = self.inner.lock();
        let list = inner.lists.entry(key.to_string()).or_default();
        for e in entries {
            list.push_back((*e).to_string());
        }
    }

    /// Stage stream entries with explicit ids (tests that care about
    /// entry age encode it in the id's millisecond prefix).
    pub fn seed_stream(&self, key: &str, entries: &[(&str, &str)]) {
        let mut inner = self.inner.lock();
        let stream = inner.streams.entry(key.to_string()).or_default();
        for (id, payload) in entries {
            stream.push(StreamEntry {
                id: (*id).to_string(),
                payload: (*payload).to_string(),
            });
        }
    }

    pub fn seed_pending(&self, key: &str, group: &str, entries: Vec<PendingEntry>) {
        self.inner
            .lock()
            .pending
            .insert(format!("{key}:{group}"), entries);
    }

    /// Expire an existing claim immediately (as if its TTL elapsed).
    pub fn expire_claim(&self, key: &str) {
        if let Some(deadline) = self.inner.lock().claims.get_mut(key) {
            *deadline = Instant::now() - Duration::from_secs(1);
        }
    }

    pub fn has_claim(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .claims
            .get(key)
            .map(|deadline| *deadline > Instant::now())
            .unwrap_or(false)
    }

    pub fn stream_ids(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .streams
            .get(key)
            .map(|entries| entries.iter().map(|e| e.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("shared state unavailable (injected)");
        }
        Ok(())
    }
}

#[async_trait]
impl SharedState for MemorySharedState {
    async fn claim(&self, key: &str, ttl_secs: u64) -> anyhow::Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.claims.get(key) {
            Some(deadline) if *deadline > now => Ok(false),
            _ => {
                inner
                    .claims
                    .insert(key.to_string(), now + Duration::from_secs(ttl_secs));
                Ok(true)
            }
        }
    }

    async fn set_size(&self, key: &str) -> anyhow::Result<u64> {
        self.check()?;
        Ok(self.inner.lock().sets.get(key).map_or(0, |s| s.len() as u64))
    }

    async fn zset_members(&self, key: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        Ok(self.inner.lock().zsets.get(key).cloned().unwrap_or_default())
    }

    async fn zset_remove(&self, key: &str, members: &[String]) -> anyhow::Result<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|m| !members.contains(m));
        Ok((before - zset.len()) as u64)
    }

    async fn list_len(&self, key: &str) -> anyhow::Result<u64> {
        self.check()?;
        Ok(self.inner.lock().lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn list_sample(&self, key: &str, count: usize) -> anyhow::Result<Vec<String>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.lists.remove(key);
        inner.sets.remove(key);
        inner.zsets.remove(key);
        inner.streams.remove(key);
        Ok(())
    }

    async fn stream_append(&self, key: &str, payload: &str) -> anyhow::Result<String> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.stream_seq += 1;
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), inner.stream_seq);
        inner
            .streams
            .entry(key.to_string())
            .or_default()
            .push(StreamEntry {
                id: id.clone(),
                payload: payload.to_string(),
            });
        Ok(id)
    }

    async fn stream_len(&self, key: &str) -> anyhow::Result<u64> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .streams
            .get(key)
            .map_or(0, |s| s.len() as u64))
    }

    async fn stream_range(
        &self,
        key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> anyhow::Result<Vec<StreamEntry>> {
        self.check()?;
        let inner = self.inner.lock();
        let Some(entries) = inner.streams.get(key) else {
            return Ok(Vec::new());
        };
        let ok = |id: &str| {
            (start == "-" || id >= start) && (end == "+" || id <= end)
        };
        Ok(entries
            .iter()
            .filter(|e| ok(&e.id))
            .take(count)
            .cloned()
            .collect())
    }

    async fn stream_delete(&self, key: &str, ids: &[String]) -> anyhow::Result<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let Some(entries) = inner.streams.get_mut(key) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id));
        Ok((before - entries.len()) as u64)
    }

    async fn pending(&self, key: &str, group: &str) -> anyhow::Result<Vec<PendingEntry>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .pending
            .get(&format!("{key}:{group}"))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventInput, SystemEvent};

    fn failed_event(id: &str, component: &str) -> SystemEvent {
        SystemEvent::build(EventInput {
            id: Some(id.to_string()),
            level: "error".to_string(),
            source: "worker".to_string(),
            component: component.to_string(),
            action: "run".to_string(),
            success: false,
            error: Some("boom".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_memory_index_upsert_is_idempotent() {
        let index = MemorySearchIndex::new();
        let event = failed_event("evt-1", "gateway");
        index.upsert(EventDocument::from_event(&event)).await.unwrap();
        index.upsert(EventDocument::from_event(&event)).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_index_failure_search() {
        let index = MemorySearchIndex::new();
        index
            .upsert(EventDocument::from_event(&failed_event("evt-1", "gateway")))
            .await
            .unwrap();
        let found = index.search_failures(0, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "evt-1");
        assert!(found[0].validate().is_ok());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let state = MemorySharedState::new();
        assert!(state.claim("cooldown:x", 60).await.unwrap());
        assert!(!state.claim("cooldown:x", 60).await.unwrap());
        state.expire_claim("cooldown:x");
        assert!(state.claim("cooldown:x", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_append_range_delete() {
        let state = MemorySharedState::new();
        let a = state.stream_append("s", "one").await.unwrap();
        let b = state.stream_append("s", "two").await.unwrap();
        assert_eq!(state.stream_len("s").await.unwrap(), 2);

        let hit = state.stream_range("s", &a, &a, 10).await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].payload, "one");

        state.stream_delete("s", &[b]).await.unwrap();
        assert_eq!(state.stream_len("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_import_batch_counts_per_record() {
        let index = MemorySearchIndex::new();
        let good = EventDocument::from_event(&failed_event("evt-1", "gateway"));
        let mut bad = good.clone();
        bad.id = String::new();
        let summary = index.import_batch(vec![good, bad]).await.unwrap();
        assert_eq!(summary, ImportSummary { succeeded: 1, failed: 1 });
    }
}
