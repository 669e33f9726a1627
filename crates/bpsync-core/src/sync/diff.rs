//! Desired-versus-current reconciliation.
//!
//! Items are matched by identity key and compared structurally after
//! normalization: excluded fields are dropped at every nesting level and
//! lists made only of strings are sorted.

use crate::config::SyncOptions;
use crate::resource::{Resource, ResourceKey, ResourceKind, PAGE_LAYOUT_FIELDS};
use crate::snapshot::Snapshot;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Volatile or cosmetic fields ignored by every comparison.
pub const EXCLUDED_FIELDS: [&str; 9] = [
    "_id",
    "id",
    "orgId",
    "createdAt",
    "createdBy",
    "updatedAt",
    "updatedBy",
    "icon",
    "color",
];

/// Page types the target manages itself.
pub const SYSTEM_PAGE_TYPES: [&str; 9] = [
    "entity",
    "blueprint-entities",
    "home",
    "audit-log",
    "runs-history",
    "user",
    "team",
    "run",
    "users-and-teams",
];

/// Fields ignored when comparing resources of `kind`.
pub fn excluded_fields(kind: ResourceKind) -> Vec<&'static str> {
    let mut fields = EXCLUDED_FIELDS.to_vec();
    if kind == ResourceKind::Page {
        fields.extend_from_slice(PAGE_LAYOUT_FIELDS);
    }
    fields
}

/// Whether a page is one of the target's built-in pages.
pub fn is_system_page(page: &Resource) -> bool {
    page.get_str("type")
        .map(|t| SYSTEM_PAGE_TYPES.contains(&t))
        .unwrap_or(false)
}

/// Recursively drop `excluded` keys and sort all-string lists.
pub fn normalize(value: &Value, excluded: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_map(map, excluded)),
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(|v| normalize(v, excluded)).collect();
            if !normalized.is_empty() && normalized.iter().all(Value::is_string) {
                normalized.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            }
            Value::Array(normalized)
        }
        other => other.clone(),
    }
}

fn normalize_map(map: &Map<String, Value>, excluded: &[&str]) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| !excluded.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), normalize(v, excluded)))
        .collect()
}

/// Structural equality of two resources of `kind` after normalization.
pub fn resources_equal(kind: ResourceKind, a: &Resource, b: &Resource) -> bool {
    let excluded = excluded_fields(kind);
    normalize_map(a.as_map(), &excluded) == normalize_map(b.as_map(), &excluded)
}

/// One leaf-level difference between two resources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    /// Dotted path of the differing field.
    pub path: String,
    /// Value on the source side, absent if the field only exists in the target.
    pub source: Option<Value>,
    /// Value on the target side, absent if the field only exists in the source.
    pub target: Option<Value>,
}

/// Field-level differences between two resources, sorted by path.
///
/// Nested objects are walked; any other differing value is reported whole.
pub fn diff_fields(kind: ResourceKind, source: &Resource, target: &Resource) -> Vec<FieldDiff> {
    let excluded = excluded_fields(kind);
    let source = normalize_map(source.as_map(), &excluded);
    let target = normalize_map(target.as_map(), &excluded);

    let mut diffs = Vec::new();
    walk_fields(&source, &target, "", &mut diffs);
    diffs.sort_by(|a, b| a.path.cmp(&b.path));
    diffs
}

fn walk_fields(
    source: &Map<String, Value>,
    target: &Map<String, Value>,
    prefix: &str,
    diffs: &mut Vec<FieldDiff>,
) {
    let keys: std::collections::BTreeSet<&String> = source.keys().chain(target.keys()).collect();

    for key in keys {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match (source.get(key), target.get(key)) {
            (Some(Value::Object(s)), Some(Value::Object(t))) => walk_fields(s, t, &path, diffs),
            (s, t) if s != t => diffs.push(FieldDiff {
                path,
                source: s.cloned(),
                target: t.cloned(),
            }),
            _ => {}
        }
    }
}

/// Create/update/skip classification for one kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindDiff {
    /// Absent from the current state.
    pub to_create: Vec<Resource>,
    /// Present but different.
    pub to_update: Vec<Resource>,
    /// Present and equal.
    pub to_skip: Vec<Resource>,
}

impl KindDiff {
    /// Whether nothing needs writing.
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty()
    }
}

static EMPTY: KindDiff = KindDiff {
    to_create: Vec::new(),
    to_update: Vec::new(),
    to_skip: Vec::new(),
};

/// Classification for every participating kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffResult {
    kinds: BTreeMap<ResourceKind, KindDiff>,
}

impl DiffResult {
    /// Classification for a kind. Non-participating kinds are empty.
    pub fn kind(&self, kind: ResourceKind) -> &KindDiff {
        self.kinds.get(&kind).unwrap_or(&EMPTY)
    }

    /// Items of `kind` to create.
    pub fn to_create(&self, kind: ResourceKind) -> &[Resource] {
        &self.kind(kind).to_create
    }

    /// Items of `kind` to update.
    pub fn to_update(&self, kind: ResourceKind) -> &[Resource] {
        &self.kind(kind).to_update
    }

    /// Items of `kind` left alone.
    pub fn to_skip(&self, kind: ResourceKind) -> &[Resource] {
        &self.kind(kind).to_skip
    }

    /// Set the classification for a kind.
    pub fn insert(&mut self, kind: ResourceKind, diff: KindDiff) {
        self.kinds.insert(kind, diff);
    }

    /// Participating kinds with their classification.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, &KindDiff)> {
        self.kinds.iter().map(|(k, d)| (*k, d))
    }

    /// Whether anything needs writing.
    pub fn has_changes(&self) -> bool {
        self.kinds.values().any(|d| !d.is_noop())
    }

    /// A snapshot holding only what needs writing.
    pub fn filter(&self) -> Snapshot {
        let mut snapshot = Snapshot::new();
        for (kind, diff) in &self.kinds {
            let mut items = Vec::with_capacity(diff.to_create.len() + diff.to_update.len());
            if *kind != ResourceKind::Integration {
                items.extend(diff.to_create.iter().cloned());
            }
            items.extend(diff.to_update.iter().cloned());
            snapshot.set(*kind, items);
        }
        snapshot
    }
}

/// Classify `desired` against `current` for one kind.
///
/// Items whose identity key cannot be read are left out of every list.
pub fn diff_kind(kind: ResourceKind, desired: &[Resource], current: &[Resource]) -> KindDiff {
    let lookup: BTreeMap<ResourceKey, &Resource> = current
        .iter()
        .filter_map(|r| r.key(kind).ok().map(|key| (key, r)))
        .collect();

    let mut diff = KindDiff::default();
    for item in desired {
        let Ok(key) = item.key(kind) else {
            continue;
        };
        if kind == ResourceKind::Page && is_system_page(item) {
            continue;
        }

        match lookup.get(&key) {
            // Integrations cannot be created.
            None if kind == ResourceKind::Integration => {}
            None => diff.to_create.push(item.clone()),
            Some(existing) if resources_equal(kind, item, existing) => {
                diff.to_skip.push(item.clone())
            }
            Some(_) => diff.to_update.push(item.clone()),
        }
    }
    diff
}

/// Classify every participating kind of `desired` against `current`.
pub fn diff(desired: &Snapshot, current: &Snapshot, options: &SyncOptions) -> DiffResult {
    let mut result = DiffResult::default();
    for kind in ResourceKind::ALL {
        if options.includes(kind) {
            result.insert(kind, diff_kind(kind, desired.get(kind), current.get(kind)));
        }
    }
    result
}
