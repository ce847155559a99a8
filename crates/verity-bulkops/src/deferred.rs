//! References written out of dependency order.
//!
//! A route-map clause may match on a tenant VRF, while tenants are applied
//! after route maps and route maps after clauses. The catalog declares such a
//! field as deferred on the referencing kind. Two rules follow:
//!
//! - A clause upserted in the same flush as the creation of the tenant it
//!   names goes out without the reference. The value is patched back once the
//!   tenant batch has finished, and the clause's handles complete only then.
//! - Before tenants are deleted, clauses queued for deletion that still point
//!   at one of them get the reference cleared, so the tenant delete is not
//!   refused for being in use.
//!
//! References to objects that are not being created are sent as they are; if
//! the target does not exist the controller's error surfaces unchanged.

use crate::cache::ObjectMap;
use crate::dag::{DeferredField, KindSpec, WriteMethod};
use crate::payload::Payload;
use crate::queue::QueuedIntent;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// References held back from one queued upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deferral {
    /// `(kind, name)` of every object the held references point at
    pub waits_on: Vec<(String, String)>,
    /// Fields to PATCH once none of those objects is pending creation
    pub restore: Payload,
}

/// References to clear before a delete batch runs.
#[derive(Debug, Clone)]
pub struct Clearing {
    /// Kind holding the references
    pub kind: Arc<KindSpec>,
    pub field: DeferredField,
    /// Objects of `kind` queued for deletion
    pub names: Vec<String>,
    /// Names being deleted from the referenced kind
    pub targets: HashSet<String>,
}

fn reference(payload: &Payload, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Strips deferred references to objects whose creation is still pending.
///
/// `pending(kind, name)` reports whether a create of that object is queued or
/// in flight. A reference is blanked in PUT bodies and left out of PATCH
/// bodies. Returns the deferrals keyed by object name.
pub fn hold_back(
    spec: &KindSpec,
    intents: &mut [QueuedIntent],
    pending: impl Fn(&str, &str) -> bool,
) -> HashMap<String, Deferral> {
    let mut held = HashMap::new();
    if spec.deferred.is_empty() {
        return held;
    }
    for intent in intents.iter_mut().filter(|i| i.op.is_upsert()) {
        let method = spec.write_method(intent.op);
        let Some(payload) = intent.payload.as_mut() else {
            continue;
        };
        let mut deferral = Deferral::default();
        for deferred in &spec.deferred {
            let Some(target) = reference(payload, &deferred.field) else {
                continue;
            };
            if !pending(&deferred.references, &target) {
                continue;
            }
            for companion in &deferred.companions {
                if let Some(value) = payload.get(companion) {
                    deferral.restore.set(companion.clone(), value.clone());
                }
            }
            deferral.restore.set(deferred.field.clone(), target.clone());
            match method {
                WriteMethod::Put => payload.set(deferred.field.clone(), ""),
                WriteMethod::Patch => {
                    payload.unset(&deferred.field);
                }
            }
            deferral.waits_on.push((deferred.references.clone(), target));
        }
        if !deferral.waits_on.is_empty() {
            held.insert(intent.name.clone(), deferral);
        }
    }
    held
}

/// PATCH items clearing `field` on the objects in `names` that reference one
/// of `targets`. Companion fields keep their current values.
pub fn clearing_items(
    field: &DeferredField,
    objects: &ObjectMap,
    names: &[String],
    targets: &HashSet<String>,
) -> Vec<(String, Payload)> {
    names
        .iter()
        .filter_map(|name| {
            let object = Payload::from_json(objects.get(name)?.clone())?;
            let target = reference(&object, &field.field)?;
            if !targets.contains(&target) {
                return None;
            }
            let mut patch = Payload::new().with(field.field.clone(), "");
            for companion in &field.companions {
                if let Some(value) = object.get(companion) {
                    patch.set(companion.clone(), value.clone());
                }
            }
            Some((name.clone(), patch))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::dag::DependencyDag;
    use crate::intent::Intent;
    use crate::queue::IntentQueue;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    fn clause_spec() -> Arc<KindSpec> {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        dag.kind("route_map_clause").unwrap().clone()
    }

    fn claimed(intents: Vec<Intent>) -> Vec<QueuedIntent> {
        let mut queue = IntentQueue::new("route_map_clause");
        for (seq, intent) in intents.into_iter().enumerate() {
            queue.push(seq as u64, intent, Instant::now()).unwrap();
        }
        queue.claim(true, true)
    }

    #[test]
    fn test_holds_back_references_to_pending_creates() {
        let spec = clause_spec();
        let mut intents = claimed(vec![
            Intent::create(
                "route_map_clause",
                "C1",
                Payload::new()
                    .with("enable", true)
                    .with("match_vrf", "T1")
                    .with("match_vrf_ref_type_", "tenant"),
            ),
            Intent::create("route_map_clause", "C2", Payload::new().with("match_vrf", "T-existing")),
            Intent::update("route_map_clause", "C3", Payload::new().with("match_vrf", "T1").with("enable", false)),
        ]);

        let held = hold_back(&spec, &mut intents, |kind, name| kind == "tenant" && name == "T1");

        assert_eq!(held.len(), 2);
        assert_eq!(
            held["C1"],
            Deferral {
                waits_on: vec![("tenant".into(), "T1".into())],
                restore: Payload::new()
                    .with("match_vrf", "T1")
                    .with("match_vrf_ref_type_", "tenant"),
            }
        );
        // PUT bodies carry an empty reference, PATCH bodies none at all.
        assert_eq!(
            intents[0].payload.as_ref().unwrap().to_json(),
            json!({"enable": true, "match_vrf": "", "match_vrf_ref_type_": "tenant"})
        );
        assert_eq!(
            intents[1].payload.as_ref().unwrap().to_json(),
            json!({"match_vrf": "T-existing"})
        );
        assert_eq!(
            intents[2].payload.as_ref().unwrap().to_json(),
            json!({"enable": false})
        );
    }

    #[test]
    fn test_nothing_held_without_pending_targets() {
        let spec = clause_spec();
        let mut intents = claimed(vec![
            Intent::create("route_map_clause", "C1", Payload::new().with("match_vrf", "T1")),
            Intent::create("route_map_clause", "C2", Payload::new().with("match_vrf", "")),
            Intent::delete("route_map_clause", "C3"),
        ]);
        let held = hold_back(&spec, &mut intents, |_, _| false);
        assert!(held.is_empty());
        assert_eq!(
            intents[0].payload.as_ref().unwrap().to_json(),
            json!({"match_vrf": "T1"})
        );
    }

    #[test]
    fn test_clearing_items() {
        let spec = clause_spec();
        let field = &spec.deferred[0];
        let objects = ObjectMap::from([
            (
                "C1".to_string(),
                json!({"name": "C1", "match_vrf": "T1", "match_vrf_ref_type_": "tenant"}),
            ),
            ("C2".to_string(), json!({"name": "C2", "match_vrf": "T-kept"})),
            ("C3".to_string(), json!({"name": "C3", "match_vrf": "T1"})),
        ]);
        let targets = HashSet::from(["T1".to_string()]);
        // C3 references a deleted tenant but is not itself being deleted.
        let names = vec!["C1".to_string(), "C2".to_string(), "C9".to_string()];

        let items = clearing_items(field, &objects, &names, &targets);
        assert_eq!(
            items,
            vec![(
                "C1".to_string(),
                Payload::new()
                    .with("match_vrf", "")
                    .with("match_vrf_ref_type_", "tenant")
            )]
        );
    }
}
