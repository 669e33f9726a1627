//! Schema dependency resolution.
//!
//! Schemas reference each other directly through `relations` and indirectly
//! through derived properties (mirror, calculation and aggregation maps).
//! The target rejects references to schemas that do not exist yet, so the
//! orchestrator creates schemas without those fields, in dependency order,
//! and patches the fields back afterwards.
//!
//! [`topological_sort`] runs Kahn's algorithm over the in-set edges and
//! returns an [`ExecutionPlan`]: ordered levels plus the schemas that could
//! not be placed because they sit on (or behind) a cycle.

use crate::resource::Resource;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Fields removed before a schema's first write and patched back later.
pub const DEFERRED_FIELDS: [&str; 4] = [
    "relations",
    "mirrorProperties",
    "calculationProperties",
    "aggregationProperties",
];

const DERIVED_FIELDS: [&str; 3] = [
    "mirrorProperties",
    "calculationProperties",
    "aggregationProperties",
];

/// Whether a schema identifier denotes a system-owned schema.
pub fn is_system_schema(identifier: &str) -> bool {
    identifier.starts_with('_')
}

/// Split schemas into `(regular, system)`.
pub fn partition_system(schemas: &[Resource]) -> (Vec<Resource>, Vec<Resource>) {
    schemas.iter().cloned().partition(|schema| {
        !schema
            .identifier()
            .map(is_system_schema)
            .unwrap_or(false)
    })
}

/// The non-empty deferred maps of a schema, keyed by field name.
///
/// Returns `None` when the schema has nothing to defer.
pub fn extract_deferred_fields(schema: &Resource) -> Option<Map<String, Value>> {
    let deferred: Map<String, Value> = DEFERRED_FIELDS
        .iter()
        .filter_map(|field| match schema.get(field) {
            Some(Value::Object(map)) if !map.is_empty() => {
                Some((field.to_string(), Value::Object(map.clone())))
            }
            _ => None,
        })
        .collect();

    if deferred.is_empty() {
        None
    } else {
        Some(deferred)
    }
}

/// A copy of a schema without its non-empty deferred maps.
pub fn strip_deferred_fields(schema: &Resource) -> Resource {
    match extract_deferred_fields(schema) {
        Some(deferred) => {
            let fields: Vec<&str> = deferred.keys().map(String::as_str).collect();
            schema.without(&fields)
        }
        None => schema.clone(),
    }
}

/// A copy of `base` with the deferred maps written over it.
pub fn merge_deferred_fields(base: &Resource, deferred: &Map<String, Value>) -> Resource {
    let mut merged = base.clone();
    for (field, value) in deferred {
        merged.insert(field.clone(), value.clone());
    }
    merged
}

/// Relation name to target schema identifier.
pub fn relation_targets(schema: &Resource) -> BTreeMap<String, String> {
    let Ok(relations) = schema.get_map("relations") else {
        return BTreeMap::new();
    };

    relations
        .iter()
        .filter_map(|(name, relation)| {
            let target = relation.get("target")?.as_str()?;
            if target.is_empty() {
                None
            } else {
                Some((name.clone(), target.to_string()))
            }
        })
        .collect()
}

/// Every schema identifier this schema references, excluding itself.
///
/// Derived properties contribute their direct `target`, or the target of the
/// relation named by the first segment of their `path`.
pub fn dependencies_of(schema: &Resource) -> BTreeSet<String> {
    let relations = relation_targets(schema);
    let mut deps: BTreeSet<String> = relations.values().cloned().collect();

    for field in DERIVED_FIELDS {
        let Ok(properties) = schema.get_map(field) else {
            continue;
        };
        for property in properties.values() {
            if let Some(target) = property.get("target").and_then(Value::as_str) {
                if !target.is_empty() {
                    deps.insert(target.to_string());
                }
            }
            if let Some(path) = property.get("path").and_then(Value::as_str) {
                let relation = path.split('.').next().unwrap_or_default();
                if let Some(target) = relations.get(relation) {
                    deps.insert(target.clone());
                }
            }
        }
    }

    if let Ok(own) = schema.identifier() {
        deps.remove(own);
    }
    deps
}

/// Dependencies of `schema` that are not in `known`, sorted.
pub fn missing_dependencies(schema: &Resource, known: &BTreeSet<String>) -> Vec<String> {
    dependencies_of(schema)
        .into_iter()
        .filter(|dep| !known.contains(dep))
        .collect()
}

/// Concatenate levels in order.
pub fn flatten_levels(levels: &[Vec<Resource>]) -> Vec<Resource> {
    levels.iter().flatten().cloned().collect()
}

/// The selected schemas plus everything they transitively depend on.
///
/// Output keeps the input order. Unknown selections are ignored.
pub fn resolve_selection(schemas: &[Resource], selected: &[String]) -> Vec<Resource> {
    let by_id: BTreeMap<&str, &Resource> = schemas
        .iter()
        .filter_map(|schema| schema.identifier().ok().map(|id| (id, schema)))
        .collect();

    let mut wanted: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = selected.to_vec();
    while let Some(id) = stack.pop() {
        let Some(schema) = by_id.get(id.as_str()) else {
            continue;
        };
        if !wanted.insert(id) {
            continue;
        }
        stack.extend(
            dependencies_of(schema)
                .into_iter()
                .filter(|dep| !wanted.contains(dep)),
        );
    }

    schemas
        .iter()
        .filter(|schema| {
            schema
                .identifier()
                .map(|id| wanted.contains(id))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Dependency edges among a working set of schemas.
///
/// A node exists iff a schema with that identifier is in the input. Edges
/// to identifiers outside the set, to already-existing identifiers, and to
/// the schema itself are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Build the graph for a set of schemas.
    pub fn build(schemas: &[Resource], existing: &BTreeSet<String>) -> Self {
        let ids: BTreeSet<&str> = schemas.iter().filter_map(|s| s.identifier().ok()).collect();

        let mut edges = BTreeMap::new();
        for schema in schemas {
            let Ok(id) = schema.identifier() else {
                continue;
            };
            if edges.contains_key(id) {
                continue;
            }
            let deps = dependencies_of(schema)
                .into_iter()
                .filter(|dep| ids.contains(dep.as_str()) && !existing.contains(dep))
                .collect();
            edges.insert(id.to_string(), deps);
        }

        Self { edges }
    }

    /// Whether the schema is part of the graph.
    pub fn contains(&self, identifier: &str) -> bool {
        self.edges.contains_key(identifier)
    }

    /// In-set dependencies of a schema.
    pub fn dependencies(&self, identifier: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(identifier)
    }

    /// Node identifiers, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Kahn's algorithm. Returns identifier levels and the unplaced remainder.
    fn levels(&self) -> (Vec<Vec<String>>, Vec<String>) {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, deps) in &self.edges {
            in_degree.insert(id.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut levels = Vec::new();
        loop {
            let ready: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(id, _)| *id)
                .collect();
            if ready.is_empty() {
                break;
            }

            for id in &ready {
                in_degree.remove(id);
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }
            levels.push(ready.into_iter().map(str::to_string).collect());
        }

        let cyclic = in_degree.keys().map(|id| id.to_string()).collect();
        (levels, cyclic)
    }
}

/// Leveled order in which schemas can be applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    /// Levels, applied strictly in order. Members of a level are independent.
    pub levels: Vec<Vec<Resource>>,
    /// Schemas that could not be ordered, sorted by identifier.
    pub cyclic: Vec<Resource>,
}

impl ExecutionPlan {
    /// Identifiers per level.
    pub fn level_ids(&self) -> Vec<Vec<String>> {
        self.levels.iter().map(|level| ids_of(level)).collect()
    }

    /// Identifiers of the cyclic schemas.
    pub fn cyclic_ids(&self) -> Vec<String> {
        ids_of(&self.cyclic)
    }

    /// Number of schemas in the plan.
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum::<usize>() + self.cyclic.len()
    }

    /// Whether the plan holds no schemas.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The same plan with every schema transformed.
    pub fn map(&self, f: impl Fn(&Resource) -> Resource) -> ExecutionPlan {
        ExecutionPlan {
            levels: self
                .levels
                .iter()
                .map(|level| level.iter().map(&f).collect())
                .collect(),
            cyclic: self.cyclic.iter().map(&f).collect(),
        }
    }

    /// Identifier-only view for reporting.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            levels: self.level_ids(),
            cyclic: self.cyclic_ids(),
            system: Vec::new(),
        }
    }
}

/// Identifier-only rendering of an [`ExecutionPlan`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Schema identifiers per level.
    pub levels: Vec<Vec<String>>,
    /// Schema identifiers that could not be ordered.
    pub cyclic: Vec<String>,
    /// System schemas that would be patched.
    pub system: Vec<String>,
}

fn ids_of(schemas: &[Resource]) -> Vec<String> {
    schemas
        .iter()
        .filter_map(|s| s.identifier().ok().map(str::to_string))
        .collect()
}

/// Order schemas so every schema comes after the in-set schemas it depends on.
///
/// Identifiers in `existing` count as already satisfied. Schemas without a
/// usable identifier are left out; for duplicate identifiers the first wins.
pub fn topological_sort(schemas: &[Resource], existing: &BTreeSet<String>) -> ExecutionPlan {
    let graph = DependencyGraph::build(schemas, existing);
    let (level_ids, cyclic_ids) = graph.levels();

    let mut by_id: BTreeMap<&str, &Resource> = BTreeMap::new();
    for schema in schemas {
        if let Ok(id) = schema.identifier() {
            by_id.entry(id).or_insert(schema);
        }
    }
    let lookup = |ids: &[String]| -> Vec<Resource> {
        ids.iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|s| (*s).clone()))
            .collect()
    };

    ExecutionPlan {
        levels: level_ids.iter().map(|level| lookup(level)).collect(),
        cyclic: lookup(&cyclic_ids),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn schema(id: &str, targets: &[&str]) -> Resource {
        let relations: Map<String, Value> = targets
            .iter()
            .map(|t| (t.to_lowercase(), json!({ "target": t })))
            .collect();
        Resource::from_value(json!({ "identifier": id, "relations": relations })).unwrap()
    }

    fn ids(levels: &[&[&str]]) -> Vec<Vec<String>> {
        levels
            .iter()
            .map(|l| l.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_strip_and_extract() {
        let bp = Resource::from_value(json!({
            "identifier": "deployment",
            "title": "Deployment",
            "properties": {"name": {"type": "string"}},
            "relations": {"service": {"target": "service"}},
            "mirrorProperties": {"name": {"path": "service.name"}},
            "calculationProperties": {},
        }))
        .unwrap();

        let stripped = strip_deferred_fields(&bp);
        assert!(stripped.contains("properties"));
        assert!(!stripped.contains("relations"));
        assert!(!stripped.contains("mirrorProperties"));
        // empty maps carry no references and stay
        assert!(stripped.contains("calculationProperties"));

        let deferred = extract_deferred_fields(&bp).unwrap();
        assert_eq!(
            deferred.keys().collect::<Vec<_>>(),
            vec!["mirrorProperties", "relations"]
        );

        let merged = merge_deferred_fields(&stripped, &deferred);
        assert_eq!(merged, bp);

        assert!(extract_deferred_fields(&schema("plain", &[])).is_none());
    }

    #[test]
    fn test_dependencies_from_all_sources() {
        let bp = Resource::from_value(json!({
            "identifier": "deployment",
            "relations": {
                "service": {"target": "service"},
                "cluster": {"target": "cluster"},
                "parent": {"target": "deployment"}
            },
            "mirrorProperties": {"serviceName": {"path": "service.name"}},
            "aggregationProperties": {"podCount": {"target": "pod"}},
            "calculationProperties": {"x": {"calculation": "1+1"}}
        }))
        .unwrap();

        let deps: Vec<String> = dependencies_of(&bp).into_iter().collect();
        assert_eq!(deps, vec!["cluster", "pod", "service"]);

        let known: BTreeSet<String> = ["service".to_string()].into_iter().collect();
        assert_eq!(missing_dependencies(&bp, &known), vec!["cluster", "pod"]);
    }

    #[test]
    fn test_partition_system() {
        let schemas = vec![
            schema("_user", &[]),
            schema("service", &[]),
            schema("_team", &[]),
            schema("deployment", &[]),
        ];
        let (regular, system) = partition_system(&schemas);
        assert_eq!(ids_of(&regular), vec!["service", "deployment"]);
        assert_eq!(ids_of(&system), vec!["_user", "_team"]);
        assert!(is_system_schema("_rule"));
        assert!(!is_system_schema("service"));
    }

    #[test]
    fn test_linear_chain() {
        let schemas = vec![schema("C", &["B"]), schema("A", &[]), schema("B", &["A"])];
        let plan = topological_sort(&schemas, &BTreeSet::new());
        assert_eq!(plan.level_ids(), ids(&[&["A"], &["B"], &["C"]]));
        assert!(plan.cyclic.is_empty());
    }

    #[test]
    fn test_pure_cycle_has_no_levels() {
        let schemas = vec![schema("A", &["B"]), schema("B", &["A"])];
        let plan = topological_sort(&schemas, &BTreeSet::new());
        assert!(plan.levels.is_empty());
        assert_eq!(plan.cyclic_ids(), vec!["A", "B"]);
    }

    #[test]
    fn test_existing_and_external_edges_are_satisfied() {
        let schemas = vec![schema("A", &["external", "_user"]), schema("B", &["A"])];
        let existing: BTreeSet<String> = ["_user".to_string()].into_iter().collect();
        let plan = topological_sort(&schemas, &existing);
        assert_eq!(plan.level_ids(), ids(&[&["A"], &["B"]]));
    }

    #[test]
    fn test_self_relation_is_not_a_cycle() {
        let plan = topological_sort(&[schema("tree", &["tree"])], &BTreeSet::new());
        assert_eq!(plan.level_ids(), ids(&[&["tree"]]));
    }

    #[test]
    fn test_missing_identifier_is_left_out() {
        let nameless = Resource::from_value(json!({"title": "no id"})).unwrap();
        let graph = DependencyGraph::build(&[nameless.clone(), schema("A", &[])], &BTreeSet::new());
        assert_eq!(graph.nodes().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(topological_sort(&[nameless], &BTreeSet::new()).len(), 0);
    }

    #[test]
    fn test_flatten_and_map() {
        let schemas = vec![schema("A", &[]), schema("B", &["A"]), schema("C", &["A"])];
        let plan = topological_sort(&schemas, &BTreeSet::new());
        let flat = flatten_levels(&plan.levels);
        assert_eq!(ids_of(&flat), vec!["A", "B", "C"]);

        let stripped = plan.map(strip_deferred_fields);
        assert!(stripped.levels[1].iter().all(|s| !s.contains("relations")));
        assert_eq!(stripped.level_ids(), plan.level_ids());
    }

    #[test]
    fn test_resolve_selection_is_transitive() {
        let schemas = vec![
            schema("region", &[]),
            schema("cluster", &["region"]),
            schema("service", &[]),
            schema("deployment", &["service", "cluster"]),
            schema("unrelated", &[]),
        ];
        let selected = resolve_selection(&schemas, &["deployment".to_string()]);
        assert_eq!(
            ids_of(&selected),
            vec!["region", "cluster", "service", "deployment"]
        );
        assert!(resolve_selection(&schemas, &["nope".to_string()]).is_empty());
    }
}
