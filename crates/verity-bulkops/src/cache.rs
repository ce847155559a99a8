//! Response cache keyed by resource kind.
//!
//! Per kind the cache holds:
//! - the last `Get(kind)` snapshot and when it was fetched,
//! - `recent`, the writes still trusted, each with its expiry and the object
//!   the controller echoed for it. An echoed object is forgotten together
//!   with its marker.
//!
//! A generation counter is bumped whenever the snapshot is invalidated so
//! that a fetch started before a write cannot install stale data afterwards.

use crate::clock::Clock;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Objects of one kind as returned by `Get(kind)`.
pub type ObjectMap = BTreeMap<String, Value>;

/// A cached `Get(kind)` result.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub fetched_at: Instant,
    pub objects: Arc<ObjectMap>,
}

#[derive(Debug, Default)]
struct KindCache {
    snapshot: Option<Snapshot>,
    generation: u64,
    recent: HashMap<String, Recent>,
}

#[derive(Debug)]
struct Recent {
    expires_at: Instant,
    object: Option<Value>,
}

impl KindCache {
    fn prune(&mut self, now: Instant) {
        self.recent.retain(|_, r| r.expires_at > now);
    }

    fn live(&self, name: &str, now: Instant) -> Option<&Recent> {
        self.recent.get(name).filter(|r| r.expires_at > now)
    }
}

/// Shared response cache.
#[derive(Debug)]
pub struct ResponseCache {
    kinds: DashMap<String, KindCache>,
    clock: Arc<dyn Clock>,
    recent_ops_ttl: Duration,
}

impl ResponseCache {
    pub fn new(clock: Arc<dyn Clock>, recent_ops_ttl: Duration) -> Self {
        Self {
            kinds: DashMap::new(),
            clock,
            recent_ops_ttl,
        }
    }

    /// Records a successful upsert, keeping the echoed object when present.
    ///
    /// A write without an echo drops whatever was cached before, since it no
    /// longer reflects the controller.
    pub fn record_write(&self, kind: &str, name: &str, object: Option<Value>) {
        let expires_at = self.clock.now() + self.recent_ops_ttl;
        self.kinds
            .entry(kind.to_string())
            .or_default()
            .recent
            .insert(name.to_string(), Recent { expires_at, object });
    }

    /// Records a successful delete.
    pub fn record_delete(&self, kind: &str, name: &str) {
        self.record_write(kind, name, None);
    }

    /// Drops expired write markers and their objects across all kinds.
    pub fn prune_expired(&self) {
        let now = self.clock.now();
        for mut entry in self.kinds.iter_mut() {
            entry.prune(now);
        }
    }

    /// Drops the snapshot of a kind; write markers are kept.
    pub fn invalidate(&self, kind: &str) {
        let mut entry = self.kinds.entry(kind.to_string()).or_default();
        entry.snapshot = None;
        entry.generation += 1;
        debug!(kind = %kind, generation = entry.generation, "Invalidated snapshot");
    }

    /// Returns true if any write marker of the kind is still live.
    pub fn has_recent(&self, kind: &str) -> bool {
        let now = self.clock.now();
        match self.kinds.get_mut(kind) {
            Some(mut entry) => {
                entry.prune(now);
                !entry.recent.is_empty()
            }
            None => false,
        }
    }

    /// Returns true if the named object was written within the TTL.
    pub fn is_recent(&self, kind: &str, name: &str) -> bool {
        let now = self.clock.now();
        self.kinds
            .get(kind)
            .is_some_and(|e| e.live(name, now).is_some())
    }

    /// Object echoed by the last successful write of `(kind, name)`, while
    /// that write is still within the TTL.
    pub fn written_object(&self, kind: &str, name: &str) -> Option<Value> {
        let now = self.clock.now();
        self.kinds
            .get(kind)
            .and_then(|e| e.live(name, now).and_then(|r| r.object.clone()))
    }

    /// Snapshot of the kind if it is younger than `max_age`.
    pub fn fresh_snapshot(&self, kind: &str, max_age: Duration) -> Option<Snapshot> {
        let now = self.clock.now();
        self.kinds
            .get(kind)
            .and_then(|e| e.snapshot.clone())
            .filter(|s| now.duration_since(s.fetched_at) < max_age)
    }

    /// Current snapshot generation of a kind.
    pub fn generation(&self, kind: &str) -> u64 {
        self.kinds.get(kind).map(|e| e.generation).unwrap_or(0)
    }

    /// Installs a fetched snapshot unless the kind was invalidated since the
    /// fetch started.
    pub fn install_snapshot(&self, kind: &str, generation: u64, objects: Arc<ObjectMap>) -> bool {
        let fetched_at = self.clock.now();
        let mut entry = self.kinds.entry(kind.to_string()).or_default();
        if entry.generation != generation {
            debug!(kind = %kind, "Discarding snapshot fetched before invalidation");
            return false;
        }
        entry.snapshot = Some(Snapshot {
            fetched_at,
            objects,
        });
        true
    }

    /// Number of live write markers of a kind.
    pub fn recent_count(&self, kind: &str) -> usize {
        let now = self.clock.now();
        self.kinds
            .get(kind)
            .map(|e| e.recent.values().filter(|r| r.expires_at > now).count())
            .unwrap_or(0)
    }
}
