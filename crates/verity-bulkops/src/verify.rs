//! Read-after-write verification.
//!
//! A read either trusts the write path (something is queued, in flight or
//! recently applied for the kind) or looks the object up in a `Get(kind)`
//! snapshot. Snapshots younger than the snapshot TTL are reused; otherwise a
//! single `Get` is issued per kind and every concurrent reader awaits it.

use crate::cache::{ObjectMap, ResponseCache};
use crate::dag::KindSpec;
use crate::error::{BulkError, Result};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{Transport, TransportError};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of a verification read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The write path is authoritative; carries the object echoed by the last
    /// write, if any.
    TrustWrite(Option<Value>),
    /// The object as currently stored by the controller.
    Fresh(Value),
}

type FetchResult = std::result::Result<Arc<ObjectMap>, TransportError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Coalesces snapshot reads per kind.
pub struct SnapshotReader {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    policy: RetryPolicy,
    snapshot_ttl: Duration,
    /// kind -> (cache generation the fetch started at, fetch)
    in_flight: Mutex<HashMap<String, (u64, SharedFetch)>>,
}

impl SnapshotReader {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        policy: RetryPolicy,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            transport,
            cache,
            policy,
            snapshot_ttl,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the objects of a kind, from a fresh snapshot or a coalesced
    /// `Get`.
    pub async fn snapshot(&self, kind: &Arc<KindSpec>) -> Result<Arc<ObjectMap>> {
        if let Some(snapshot) = self.cache.fresh_snapshot(&kind.name, self.snapshot_ttl) {
            debug!(kind = %kind.name, "Serving read from cached snapshot");
            return Ok(snapshot.objects);
        }

        let fetch = self.join_or_start(kind);
        let result = fetch.clone().await;

        // The first reader back removes the finished fetch; a newer fetch
        // started after an invalidation is left alone.
        {
            let mut in_flight = self.in_flight.lock();
            let finished = in_flight
                .get(&kind.name)
                .is_some_and(|(_, f)| f.peek().is_some());
            if finished {
                in_flight.remove(&kind.name);
            }
        }

        result.map_err(|e| e.to_bulk_error(&kind.name))
    }

    /// Number of `Get` calls currently shared by readers.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn join_or_start(&self, kind: &Arc<KindSpec>) -> SharedFetch {
        let mut in_flight = self.in_flight.lock();
        let generation = self.cache.generation(&kind.name);
        if let Some((started_at, fetch)) = in_flight.get(&kind.name) {
            if *started_at == generation {
                debug!(kind = %kind.name, "Joining in-flight snapshot read");
                return fetch.clone();
            }
        }

        let transport = self.transport.clone();
        let cache = self.cache.clone();
        let policy = self.policy.clone();
        let kind = kind.clone();
        let name = kind.name.clone();
        let fetch = async move {
            let t = transport.as_ref();
            let k = kind.as_ref();
            let what = format!("GET {}", k.name);
            let result: FetchResult = with_retry(&policy, t, &what, move || t.get(k))
                .await
                .map(Arc::new);
            if let Ok(objects) = &result {
                cache.install_snapshot(&k.name, generation, objects.clone());
            }
            result
        }
        .boxed()
        .shared();

        in_flight.insert(name, (generation, fetch.clone()));
        fetch
    }
}

/// Finds `name` among the objects of a kind.
///
/// An object whose own `name` field matches wins over the map key, since the
/// controller may key objects under a sanitized form of the name.
pub fn find_object<'a>(objects: &'a ObjectMap, name: &str) -> Option<&'a Value> {
    objects
        .values()
        .find(|object| object.get("name").and_then(Value::as_str) == Some(name))
        .or_else(|| objects.get(name))
}

/// Resolves a read against a snapshot.
pub fn lookup(kind: &str, objects: &ObjectMap, name: &str) -> Result<ReadOutcome> {
    find_object(objects, name)
        .cloned()
        .map(ReadOutcome::Fresh)
        .ok_or_else(|| BulkError::not_found(kind, name))
}
