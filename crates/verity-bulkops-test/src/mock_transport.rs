//! In-memory controller for tests
//!
//! Keeps a per-kind object store, applies writes the way the controller does
//! (PUT replaces, PATCH overlays, DELETE removes) and records every call with
//! its start and end so tests can check ordering. Replies can be scripted per
//! `(method, kind)`; scripted replies are returned as-is and leave the store
//! untouched.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use verity_bulkops::{
    BulkResponse, ErrInfo, ItemResult, KindSpec, ObjectMap, Payload, Transport, TransportError,
};

/// Transport method of a recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMethod {
    Put,
    Patch,
    Delete,
    Get,
    Auth,
}

impl CallMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallMethod::Put => "PUT",
            CallMethod::Patch => "PATCH",
            CallMethod::Delete => "DELETE",
            CallMethod::Get => "GET",
            CallMethod::Auth => "AUTH",
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, CallMethod::Put | CallMethod::Patch | CallMethod::Delete)
    }
}

/// One transport call as the controller saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: CallMethod,
    /// Empty for authentication
    pub kind: String,
    /// Item names in request order
    pub names: Vec<String>,
    /// Request payloads in request order (writes only)
    pub payloads: Vec<Value>,
}

impl fmt::Display for RecordedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.as_str(), self.kind)?;
        if !self.names.is_empty() {
            write!(f, " [{}]", self.names.join(","))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

/// Reply of a scripted bulk call.
pub type Reply = Result<BulkResponse, TransportError>;

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    /// (phase, call index) in the order they happened
    events: Vec<(Phase, usize)>,
    store: BTreeMap<String, ObjectMap>,
    scripted: HashMap<(CallMethod, String), VecDeque<Reply>>,
    get_failures: HashMap<String, VecDeque<TransportError>>,
    rejections: HashMap<(String, String), String>,
    /// Fields the controller fills in on stored objects but does not echo
    generated: HashMap<String, Map<String, Value>>,
    running: usize,
    max_running: usize,
}

/// Scripted, recording [`Transport`].
pub struct MockTransport {
    state: Mutex<State>,
    latency: Duration,
    echo: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Echoing controller with no latency.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            echo: true,
        }
    }

    /// Every call takes this long (tokio time).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Successful writes return no objects.
    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Queues a reply for the next `(method, kind)` call.
    pub fn script(&self, method: CallMethod, kind: &str, reply: Reply) {
        self.state
            .lock()
            .scripted
            .entry((method, kind.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Fails the next `Get` of a kind.
    pub fn fail_next_get(&self, kind: &str, error: TransportError) {
        self.state
            .lock()
            .get_failures
            .entry(kind.to_string())
            .or_default()
            .push_back(error);
    }

    /// Rejects every write of `(kind, name)` with a per-item error.
    pub fn reject(&self, kind: &str, name: &str, message: &str) {
        self.state
            .lock()
            .rejections
            .insert((kind.to_string(), name.to_string()), message.to_string());
    }

    /// Adds a controller-generated field to every object written to a kind.
    pub fn generate_field(&self, kind: &str, field: &str, value: Value) {
        self.state
            .lock()
            .generated
            .entry(kind.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Puts an object into the store without recording a call.
    pub fn seed(&self, kind: &str, name: &str, object: Value) {
        self.state
            .lock()
            .store
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), object);
    }

    /// Stored object.
    pub fn object(&self, kind: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .store
            .get(kind)
            .and_then(|objects| objects.get(name).cloned())
    }

    /// Every recorded call.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Recorded writes rendered as `METHOD kind [names]`.
    pub fn write_log(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method.is_write())
            .map(ToString::to_string)
            .collect()
    }

    /// Number of recorded calls of a method, for any kind.
    pub fn count(&self, method: CallMethod) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Start/end events in the order they happened.
    pub fn events(&self) -> Vec<(Phase, usize)> {
        self.state.lock().events.clone()
    }

    /// Highest number of calls that were running at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.state.lock().max_running
    }

    /// Forgets recorded calls; the store is kept.
    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.events.clear();
    }

    fn begin(&self, method: CallMethod, kind: &str, items: &[(String, Option<Value>)]) -> usize {
        let mut state = self.state.lock();
        let index = state.calls.len();
        state.calls.push(RecordedCall {
            method,
            kind: kind.to_string(),
            names: items.iter().map(|(n, _)| n.clone()).collect(),
            payloads: items.iter().filter_map(|(_, p)| p.clone()).collect(),
        });
        state.events.push((Phase::Start, index));
        state.running += 1;
        state.max_running = state.max_running.max(state.running);
        index
    }

    fn end(&self, index: usize) {
        let mut state = self.state.lock();
        state.events.push((Phase::End, index));
        state.running -= 1;
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn apply_writes(&self, method: CallMethod, kind: &str, items: &[(String, Payload)]) -> Reply {
        let mut state = self.state.lock();
        if let Some(reply) = pop_script(&mut state, method, kind) {
            return reply;
        }

        let generated = state.generated.get(kind).cloned().unwrap_or_default();
        let mut response = BulkResponse::new();
        for (name, payload) in items {
            if let Some(message) = state.rejections.get(&(kind.to_string(), name.clone())) {
                response.insert(name.clone(), ItemResult::Err(ErrInfo::new(message.clone())));
                continue;
            }
            let objects = state.store.entry(kind.to_string()).or_default();
            let mut object = match (method, objects.remove(name)) {
                (CallMethod::Patch, Some(Value::Object(existing))) => existing,
                _ => Map::new(),
            };
            object.insert("name".into(), Value::String(name.clone()));
            for (field, value) in payload.iter() {
                object.insert(field.to_string(), value.clone());
            }
            let echoed = Value::Object(object.clone());
            for (field, value) in &generated {
                object.insert(field.clone(), value.clone());
            }
            objects.insert(name.clone(), Value::Object(object));
            if self.echo {
                response.insert(name.clone(), ItemResult::Ok(Some(echoed)));
            }
        }
        Ok(response)
    }
}

fn pop_script(state: &mut State, method: CallMethod, kind: &str) -> Option<Reply> {
    state
        .scripted
        .get_mut(&(method, kind.to_string()))
        .and_then(VecDeque::pop_front)
}

fn write_items(items: &[(String, Payload)]) -> Vec<(String, Option<Value>)> {
    items
        .iter()
        .map(|(n, p)| (n.clone(), Some(p.to_json())))
        .collect()
}

#[async_trait]
impl Transport for MockTransport {
    async fn put_bulk(&self, kind: &KindSpec, items: &[(String, Payload)]) -> Reply {
        let call = self.begin(CallMethod::Put, &kind.name, &write_items(items));
        self.delay().await;
        let reply = self.apply_writes(CallMethod::Put, &kind.name, items);
        self.end(call);
        reply
    }

    async fn patch_bulk(&self, kind: &KindSpec, items: &[(String, Payload)]) -> Reply {
        let call = self.begin(CallMethod::Patch, &kind.name, &write_items(items));
        self.delay().await;
        let reply = self.apply_writes(CallMethod::Patch, &kind.name, items);
        self.end(call);
        reply
    }

    async fn delete_bulk(&self, kind: &KindSpec, names: &[String]) -> Reply {
        let items: Vec<_> = names.iter().map(|n| (n.clone(), None)).collect();
        let call = self.begin(CallMethod::Delete, &kind.name, &items);
        self.delay().await;
        let reply = {
            let mut state = self.state.lock();
            match pop_script(&mut state, CallMethod::Delete, &kind.name) {
                Some(reply) => reply,
                None => {
                    if let Some(objects) = state.store.get_mut(&kind.name) {
                        for name in names {
                            objects.remove(name);
                        }
                    }
                    Ok(BulkResponse::new())
                }
            }
        };
        self.end(call);
        reply
    }

    async fn get(&self, kind: &KindSpec) -> Result<ObjectMap, TransportError> {
        let call = self.begin(CallMethod::Get, &kind.name, &[]);
        self.delay().await;
        let reply = {
            let mut state = self.state.lock();
            match state
                .get_failures
                .get_mut(&kind.name)
                .and_then(VecDeque::pop_front)
            {
                Some(error) => Err(error),
                None => Ok(state.store.get(&kind.name).cloned().unwrap_or_default()),
            }
        };
        self.end(call);
        reply
    }

    async fn authenticate(&self) -> Result<(), TransportError> {
        let call = self.begin(CallMethod::Auth, "", &[]);
        self.end(call);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use verity_bulkops::{DependencyDag, Mode};

    fn kind(name: &str) -> KindSpec {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        (**dag.kind(name).unwrap()).clone()
    }

    #[tokio::test]
    async fn test_put_patch_delete_apply_to_store() {
        let mock = MockTransport::new();
        let badge = kind("badge");

        let reply = mock
            .put_bulk(&badge, &[("B".into(), Payload::new().with("color", 1).with("enable", true))])
            .await
            .unwrap();
        assert_eq!(
            reply.get("B"),
            Some(&ItemResult::Ok(Some(json!({"name": "B", "color": 1, "enable": true}))))
        );

        mock.patch_bulk(&badge, &[("B".into(), Payload::new().with("color", 2))])
            .await
            .unwrap();
        assert_eq!(
            mock.object("badge", "B"),
            Some(json!({"name": "B", "color": 2, "enable": true}))
        );

        mock.delete_bulk(&badge, &["B".into()]).await.unwrap();
        assert_eq!(mock.object("badge", "B"), None);
        assert_eq!(
            mock.write_log(),
            vec!["PUT badge [B]", "PATCH badge [B]", "DELETE badge [B]"]
        );
    }

    #[tokio::test]
    async fn test_rejections_and_generated_fields() {
        let mock = MockTransport::new();
        let tenant = kind("tenant");
        mock.reject("tenant", "bad", "invalid vrf");
        mock.generate_field("tenant", "vni", json!(10001));

        let reply = mock
            .put_bulk(
                &tenant,
                &[("bad".into(), Payload::new()), ("good".into(), Payload::new())],
            )
            .await
            .unwrap();
        assert_eq!(
            reply.get("bad"),
            Some(&ItemResult::Err(ErrInfo::new("invalid vrf")))
        );
        // Generated fields are stored but not echoed.
        assert_eq!(reply.get("good"), Some(&ItemResult::Ok(Some(json!({"name": "good"})))));
        assert_eq!(mock.object("tenant", "good"), Some(json!({"name": "good", "vni": 10001})));
        assert_eq!(mock.object("tenant", "bad"), None);
    }

    #[tokio::test]
    async fn test_scripted_replies() {
        let mock = MockTransport::new();
        let badge = kind("badge");
        mock.script(CallMethod::Put, "badge", Err(TransportError::http(503, "busy")));

        let err = mock.put_bulk(&badge, &[("B".into(), Payload::new())]).await.unwrap_err();
        assert_eq!(err.status, Some(503));
        assert_eq!(mock.object("badge", "B"), None);

        mock.put_bulk(&badge, &[("B".into(), Payload::new())]).await.unwrap();
        assert!(mock.object("badge", "B").is_some());
        assert_eq!(mock.count(CallMethod::Put), 2);
    }
}
