//! Dependency DAG over resource kinds.
//!
//! The graph is loaded once from a TOML catalog (the built-in one is compiled
//! into the crate) and never changes afterwards. Kinds are stored in
//! topological order, so a kind's topological index is simply its position.
//! Ties between unrelated kinds are broken by catalog order, which keeps batch
//! ordering deterministic across runs.

use crate::config::Mode;
use crate::error::{BulkError, Result};
use crate::intent::Op;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

const BUILTIN_CATALOG: &str = include_str!("catalog.toml");

/// How creates and updates of a kind reach the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Creates and updates both go through PUT
    Upsert,
    /// Creates go through PUT, updates through PATCH
    #[default]
    Split,
    /// Everything goes through PATCH; the kind cannot be deleted
    PatchOnly,
}

/// How list-valued fields are applied by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSemantics {
    /// Lists are replaced as a whole; updates must carry the full list
    Replace,
    /// Lists are patched per index
    #[default]
    Patch,
}

/// HTTP verb used for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMethod {
    Put,
    Patch,
}

impl WriteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMethod::Put => "PUT",
            WriteMethod::Patch => "PATCH",
        }
    }
}

/// A field naming an object of a kind that is applied after the field's own
/// kind, so the reference cannot be written in the same request that
/// creates the object holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredField {
    /// Field holding the referenced object's name
    pub field: String,
    /// Kind the field references
    pub references: String,
    /// Fields sent along with the reference when it is restored or cleared
    #[serde(default)]
    pub companions: Vec<String>,
}

fn all_modes() -> Vec<Mode> {
    vec![Mode::Datacenter, Mode::Campus]
}

/// Catalog entry for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSpec {
    /// Kind identifier (e.g. "badge")
    pub name: String,
    /// JSON envelope key used by the controller
    pub json_key: String,
    /// REST collection path, relative to the API base
    pub path: String,
    /// Query parameter carrying names on bulk delete
    #[serde(default)]
    pub delete_param: Option<String>,
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default)]
    pub list_semantics: ListSemantics,
    /// The controller fills in generated fields; re-read after writing
    #[serde(default)]
    pub refetch_after_write: bool,
    #[serde(default = "all_modes")]
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra query parameters sent with every request for this kind
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub deferred: Vec<DeferredField>,
}

impl KindSpec {
    /// Returns true if the kind accepts the operation.
    pub fn supports(&self, op: Op) -> bool {
        match op {
            Op::Create | Op::Update => true,
            Op::Delete => self.write_mode != WriteMode::PatchOnly && self.delete_param.is_some(),
        }
    }

    /// Verb used to send an upsert of the given operation.
    pub fn write_method(&self, op: Op) -> WriteMethod {
        match (self.write_mode, op) {
            (WriteMode::PatchOnly, _) => WriteMethod::Patch,
            (WriteMode::Upsert, _) => WriteMethod::Put,
            (WriteMode::Split, Op::Update) if self.list_semantics == ListSemantics::Patch => {
                WriteMethod::Patch
            }
            (WriteMode::Split, _) => WriteMethod::Put,
        }
    }

    /// Returns true if the kind is active in the given mode.
    pub fn active_in(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "kind")]
    kinds: Vec<KindSpec>,
}

/// Fixed precedence graph over resource kinds.
#[derive(Debug, Clone)]
pub struct DependencyDag {
    /// Kinds in topological order
    kinds: Vec<Arc<KindSpec>>,
    index: HashMap<String, usize>,
    ancestors: Vec<BTreeSet<usize>>,
    descendants: Vec<BTreeSet<usize>>,
}

impl DependencyDag {
    /// Parses and validates a catalog.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| BulkError::config(format!("invalid catalog: {e}")))?;
        Self::from_specs(file.kinds)
    }

    /// The built-in catalog restricted to the kinds active in `mode`.
    pub fn builtin(mode: Mode) -> Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG)?.for_mode(mode)
    }

    /// Builds the graph from catalog entries given in catalog order.
    pub fn from_specs(specs: Vec<KindSpec>) -> Result<Self> {
        let mut position = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if spec.name.is_empty() {
                return Err(BulkError::config(format!("catalog entry {i} has no name")));
            }
            if spec.json_key.is_empty() || spec.path.is_empty() {
                return Err(BulkError::config(format!(
                    "kind {} needs both json_key and path",
                    spec.name
                )));
            }
            if spec.write_mode != WriteMode::PatchOnly && spec.delete_param.is_none() {
                return Err(BulkError::config(format!(
                    "kind {} must declare delete_param",
                    spec.name
                )));
            }
            if position.insert(spec.name.clone(), i).is_some() {
                return Err(BulkError::config(format!("duplicate kind {}", spec.name)));
            }
        }

        for spec in &specs {
            for deferred in &spec.deferred {
                if deferred.field.is_empty() {
                    return Err(BulkError::config(format!(
                        "kind {} has a deferred field without a name",
                        spec.name
                    )));
                }
                if deferred.references == spec.name || !position.contains_key(&deferred.references) {
                    return Err(BulkError::config(format!(
                        "deferred field {}.{} references unknown kind {}",
                        spec.name, deferred.field, deferred.references
                    )));
                }
            }
        }

        let mut children = vec![Vec::new(); specs.len()];
        let mut in_degree = vec![0usize; specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &spec.depends_on {
                let Some(&p) = position.get(dep) else {
                    return Err(BulkError::config(format!(
                        "kind {} depends on unknown kind {dep}",
                        spec.name
                    )));
                };
                if p == i {
                    return Err(BulkError::config(format!("kind {} depends on itself", spec.name)));
                }
                if seen.insert(p) {
                    children[p].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        // Kahn's algorithm; the ready set is ordered by catalog position.
        let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(specs.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &c in &children[i] {
                in_degree[c] -= 1;
                if in_degree[c] == 0 {
                    ready.insert(c);
                }
            }
        }
        if order.len() != specs.len() {
            let stuck: Vec<&str> = (0..specs.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| specs[i].name.as_str())
                .collect();
            return Err(BulkError::config(format!(
                "dependency cycle among kinds: {}",
                stuck.join(", ")
            )));
        }

        let mut slots: Vec<Option<KindSpec>> = specs.into_iter().map(Some).collect();
        let kinds: Vec<Arc<KindSpec>> = order
            .iter()
            .filter_map(|&i| slots[i].take().map(Arc::new))
            .collect();
        let index: HashMap<String, usize> = kinds
            .iter()
            .enumerate()
            .map(|(i, k)| (k.name.clone(), i))
            .collect();

        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); kinds.len()];
        for i in 0..kinds.len() {
            let mut acc = BTreeSet::new();
            for dep in &kinds[i].depends_on {
                if let Some(&p) = index.get(dep) {
                    acc.insert(p);
                    acc.extend(ancestors[p].iter().copied());
                }
            }
            ancestors[i] = acc;
        }
        let mut descendants: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); kinds.len()];
        for (i, anc) in ancestors.iter().enumerate() {
            for &a in anc {
                descendants[a].insert(i);
            }
        }

        Ok(Self {
            kinds,
            index,
            ancestors,
            descendants,
        })
    }

    /// Induced graph over the kinds active in `mode`.
    ///
    /// Ordering through inactive kinds is preserved: if `a -> b -> c` and `b`
    /// is inactive, the result keeps `a -> c`.
    pub fn for_mode(&self, mode: Mode) -> Result<Self> {
        let active: Vec<usize> = (0..self.kinds.len())
            .filter(|&i| self.kinds[i].active_in(mode))
            .collect();
        let active_set: HashSet<usize> = active.iter().copied().collect();
        let active_names: HashSet<&str> = active
            .iter()
            .map(|&i| self.kinds[i].name.as_str())
            .collect();

        // Topological order is a valid catalog order for the rebuilt graph.
        let specs = active
            .iter()
            .map(|&i| {
                let mut spec = (*self.kinds[i]).clone();
                spec.depends_on = self.nearest_active_deps(i, &active_set);
                spec.deferred
                    .retain(|d| active_names.contains(d.references.as_str()));
                spec
            })
            .collect();
        Self::from_specs(specs)
    }

    fn nearest_active_deps(&self, i: usize, active: &HashSet<usize>) -> Vec<String> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<usize> = self.parents(i).collect();
        let mut visited = HashSet::new();
        while let Some(p) = stack.pop() {
            if !visited.insert(p) {
                continue;
            }
            if active.contains(&p) {
                found.insert(p);
            } else {
                stack.extend(self.parents(p));
            }
        }
        found.into_iter().map(|p| self.kinds[p].name.clone()).collect()
    }

    fn parents(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.kinds[i]
            .depends_on
            .iter()
            .filter_map(|d| self.index.get(d).copied())
    }

    /// Number of kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Catalog entry for a kind.
    pub fn kind(&self, name: &str) -> Option<&Arc<KindSpec>> {
        self.index.get(name).map(|&i| &self.kinds[i])
    }

    /// Catalog entry at a topological index.
    pub fn kind_at(&self, index: usize) -> &Arc<KindSpec> {
        &self.kinds[index]
    }

    /// Topological index of a kind.
    pub fn topo_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// All kinds in topological order.
    pub fn kinds(&self) -> impl Iterator<Item = &Arc<KindSpec>> {
        self.kinds.iter()
    }

    /// Transitive upstream kinds, in topological order.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        self.names(self.index.get(name).map(|&i| &self.ancestors[i]))
    }

    /// Transitive downstream kinds, in topological order.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        self.names(self.index.get(name).map(|&i| &self.descendants[i]))
    }

    /// Topological indices of a kind's transitive upstream kinds.
    pub fn ancestor_indices(&self, index: usize) -> &BTreeSet<usize> {
        &self.ancestors[index]
    }

    /// Topological indices of a kind's transitive downstream kinds.
    pub fn descendant_indices(&self, index: usize) -> &BTreeSet<usize> {
        &self.descendants[index]
    }

    fn names(&self, set: Option<&BTreeSet<usize>>) -> Vec<&str> {
        set.map(|s| s.iter().map(|&i| self.kinds[i].name.as_str()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(dag: &DependencyDag) -> Vec<&str> {
        dag.kinds().map(|k| k.name.as_str()).collect()
    }

    const SMALL: &str = r#"
        [[kind]]
        name = "c"
        json_key = "c"
        path = "cs"
        delete_param = "c_name"
        depends_on = ["b"]

        [[kind]]
        name = "a"
        json_key = "a"
        path = "as"
        delete_param = "a_name"

        [[kind]]
        name = "b"
        json_key = "b"
        path = "bs"
        delete_param = "b_name"
        modes = ["datacenter"]
        depends_on = ["a"]

        [[kind]]
        name = "z"
        json_key = "z"
        path = "zs"
        write_mode = "patch_only"
    "#;

    #[test]
    fn test_topological_order_with_catalog_ties() {
        let dag = DependencyDag::from_toml_str(SMALL).unwrap();
        // "a" and "z" are both roots; "a" comes first in the catalog.
        assert_eq!(names(&dag), vec!["a", "b", "c", "z"]);
        assert_eq!(dag.topo_index("c"), Some(2));
        assert_eq!(dag.ancestors("c"), vec!["a", "b"]);
        assert_eq!(dag.descendants("a"), vec!["b", "c"]);
        assert!(dag.descendants("z").is_empty());
        assert!(dag.ancestors("missing").is_empty());
    }

    #[test]
    fn test_defaults_applied() {
        let dag = DependencyDag::from_toml_str(SMALL).unwrap();
        let a = dag.kind("a").unwrap();
        assert_eq!(a.write_mode, WriteMode::Split);
        assert_eq!(a.list_semantics, ListSemantics::Patch);
        assert_eq!(a.modes, vec![Mode::Datacenter, Mode::Campus]);
        assert!(!a.refetch_after_write);
    }

    #[test]
    fn test_for_mode_keeps_transitive_order() {
        let dag = DependencyDag::from_toml_str(SMALL).unwrap();
        let campus = dag.for_mode(Mode::Campus).unwrap();
        assert_eq!(names(&campus), vec!["a", "c", "z"]);
        assert_eq!(campus.kind("c").unwrap().depends_on, vec!["a".to_string()]);
        assert_eq!(campus.ancestors("c"), vec!["a"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let text = r#"
            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
            delete_param = "n"
            depends_on = ["b"]

            [[kind]]
            name = "b"
            json_key = "b"
            path = "bs"
            delete_param = "n"
            depends_on = ["a"]
        "#;
        let err = DependencyDag::from_toml_str(text).unwrap_err();
        assert_eq!(err, BulkError::config("dependency cycle among kinds: a, b"));
    }

    #[test]
    fn test_invalid_catalogs() {
        let unknown = r#"
            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
            delete_param = "n"
            depends_on = ["nope"]
        "#;
        assert!(matches!(
            DependencyDag::from_toml_str(unknown),
            Err(BulkError::Config(msg)) if msg.contains("unknown kind nope")
        ));

        let duplicate = r#"
            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
            delete_param = "n"

            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
            delete_param = "n"
        "#;
        assert!(DependencyDag::from_toml_str(duplicate).is_err());

        let no_delete = r#"
            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
        "#;
        assert!(DependencyDag::from_toml_str(no_delete).is_err());

        assert!(DependencyDag::from_toml_str("kind = 3").is_err());
    }

    #[test]
    fn test_deferred_fields() {
        let text = r#"
            [[kind]]
            name = "a"
            json_key = "a"
            path = "as"
            delete_param = "n"
            deferred = [{ field = "b_ref", references = "b", companions = ["b_ref_type_"] }]

            [[kind]]
            name = "b"
            json_key = "b"
            path = "bs"
            delete_param = "n"
            modes = ["datacenter"]
            depends_on = ["a"]
        "#;
        let dag = DependencyDag::from_toml_str(text).unwrap();
        let deferred = &dag.kind("a").unwrap().deferred;
        assert_eq!(
            deferred,
            &vec![DeferredField {
                field: "b_ref".into(),
                references: "b".into(),
                companions: vec!["b_ref_type_".into()],
            }]
        );
        // Without the referenced kind there is nothing to defer.
        let campus = dag.for_mode(Mode::Campus).unwrap();
        assert!(campus.kind("a").unwrap().deferred.is_empty());

        let dangling = text.replace(r#"references = "b""#, r#"references = "q""#);
        assert!(matches!(
            DependencyDag::from_toml_str(&dangling),
            Err(BulkError::Config(msg)) if msg.contains("a.b_ref references unknown kind q")
        ));
    }

    #[test]
    fn test_builtin_clause_defers_vrf_match() {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        let clause = dag.kind("route_map_clause").unwrap();
        assert_eq!(clause.deferred.len(), 1);
        assert_eq!(clause.deferred[0].field, "match_vrf");
        assert_eq!(clause.deferred[0].references, "tenant");
        // The reference runs against the apply order.
        assert!(dag.topo_index("route_map_clause") < dag.topo_index("tenant"));
    }

    #[test]
    fn test_write_methods() {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();

        let badge = dag.kind("badge").unwrap();
        assert_eq!(badge.write_method(Op::Create), WriteMethod::Put);
        assert_eq!(badge.write_method(Op::Update), WriteMethod::Patch);
        assert!(badge.supports(Op::Delete));

        // Full-list kinds send updates by PUT.
        let prefix = dag.kind("ipv4_prefix_list").unwrap();
        assert_eq!(prefix.list_semantics, ListSemantics::Replace);
        assert_eq!(prefix.write_method(Op::Update), WriteMethod::Put);

        let site = dag.kind("site").unwrap();
        assert_eq!(site.write_method(Op::Create), WriteMethod::Patch);
        assert!(!site.supports(Op::Delete));

        let pod = dag.kind("pod").unwrap();
        assert_eq!(pod.write_method(Op::Update), WriteMethod::Put);
    }

    #[test]
    fn test_builtin_datacenter_ordering() {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        let idx = |k: &str| dag.topo_index(k).unwrap();

        assert!(idx("ipv4_prefix_list") < idx("route_map_clause"));
        assert!(idx("route_map_clause") < idx("route_map"));
        assert!(idx("gateway") < idx("gateway_profile"));
        assert!(idx("eth_port_profile") < idx("site"));
        assert!(idx("bundle") < idx("switchpoint"));
        assert!(idx("switchpoint") < idx("device_controller"));

        assert!(dag.kind("authenticated_eth_port").is_none());
        assert_eq!(dag.kind("bundle").unwrap().json_key, "endpoint_bundle");
        assert_eq!(
            dag.kind("acl_v6").unwrap().query.get("ip_version").map(String::as_str),
            Some("6")
        );
        assert!(dag.descendants("tenant").contains(&"eth_port_profile"));
    }

    #[test]
    fn test_builtin_campus() {
        let dag = DependencyDag::builtin(Mode::Campus).unwrap();
        assert!(dag.kind("tenant").is_none());
        assert!(dag.kind("route_map").is_none());
        assert!(dag.kind("authenticated_eth_port").is_some());

        let idx = |k: &str| dag.topo_index(k).unwrap();
        assert!(idx("service") < idx("eth_port_profile"));
        assert!(idx("eth_port_profile") < idx("authenticated_eth_port"));
        assert!(idx("bundle") < idx("switchpoint"));
    }
}
