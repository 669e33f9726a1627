//! Read-only comparison of two states.
//!
//! Unlike reconciliation, comparison explains differences: every modified
//! resource carries its field-level [`FieldDiff`] list.

use super::diff::{diff_fields, FieldDiff};
use crate::resource::{Resource, ResourceKey, ResourceKind};
use crate::snapshot::Snapshot;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Kinds covered by a comparison. Records are compared through their schemas.
pub const COMPARED_KINDS: [ResourceKind; 7] = [
    ResourceKind::Blueprint,
    ResourceKind::Action,
    ResourceKind::Scorecard,
    ResourceKind::Page,
    ResourceKind::Integration,
    ResourceKind::Team,
    ResourceKind::User,
];

/// Counts of a [`ResourceDiff`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    /// In target only.
    pub added: usize,
    /// In both, different.
    pub modified: usize,
    /// In source only.
    pub removed: usize,
}

impl DiffSummary {
    /// Whether there is any difference.
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.removed == 0
    }
}

/// A resource that differs between the two sides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceChange {
    /// Identity key rendered as a string.
    pub identifier: String,
    /// Source copy, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Resource>,
    /// Target copy, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Resource>,
    /// Field-level differences for modified resources.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldDiff>,
}

/// Differences for one kind, each list sorted by identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Counts.
    pub summary: DiffSummary,
    /// In target but not in source.
    pub added: Vec<ResourceChange>,
    /// In both, different.
    pub modified: Vec<ResourceChange>,
    /// In source but not in target.
    pub removed: Vec<ResourceChange>,
}

/// Result of comparing two states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompareReport {
    /// Label of the source side.
    pub source: String,
    /// Label of the target side.
    pub target: String,
    /// RFC 3339 time of the comparison.
    pub timestamp: String,
    /// Whether no kind has any difference.
    pub identical: bool,
    /// Per-kind differences.
    pub kinds: BTreeMap<ResourceKind, ResourceDiff>,
}

impl CompareReport {
    /// Differences for a kind, if it was compared.
    pub fn get(&self, kind: ResourceKind) -> Option<&ResourceDiff> {
        self.kinds.get(&kind)
    }

    /// Summed counts across kinds.
    pub fn totals(&self) -> DiffSummary {
        self.kinds.values().fold(DiffSummary::default(), |acc, d| DiffSummary {
            added: acc.added + d.summary.added,
            modified: acc.modified + d.summary.modified,
            removed: acc.removed + d.summary.removed,
        })
    }
}

/// Compare two resource collections of one kind.
pub fn compare_kind(kind: ResourceKind, source: &[Resource], target: &[Resource]) -> ResourceDiff {
    let index = |items: &[Resource]| -> BTreeMap<ResourceKey, Resource> {
        items
            .iter()
            .filter_map(|r| r.key(kind).ok().map(|k| (k, r.clone())))
            .collect()
    };
    let mut source = index(source);
    let mut target = index(target);

    let keys: BTreeSet<ResourceKey> = source.keys().chain(target.keys()).cloned().collect();
    let mut diff = ResourceDiff::default();

    for key in keys {
        let identifier = key.to_string();
        match (source.remove(&key), target.remove(&key)) {
            (None, Some(t)) => diff.added.push(ResourceChange {
                identifier,
                source: None,
                target: Some(t),
                fields: Vec::new(),
            }),
            (Some(s), None) => diff.removed.push(ResourceChange {
                identifier,
                source: Some(s),
                target: None,
                fields: Vec::new(),
            }),
            (Some(s), Some(t)) => {
                let fields = diff_fields(kind, &s, &t);
                if !fields.is_empty() {
                    diff.modified.push(ResourceChange {
                        identifier,
                        source: Some(s),
                        target: Some(t),
                        fields,
                    });
                }
            }
            (None, None) => {}
        }
    }

    diff.summary = DiffSummary {
        added: diff.added.len(),
        modified: diff.modified.len(),
        removed: diff.removed.len(),
    };
    diff
}

/// Compare two snapshots over `kinds` (all compared kinds when empty).
pub fn compare(
    source_label: &str,
    source: &Snapshot,
    target_label: &str,
    target: &Snapshot,
    kinds: &BTreeSet<ResourceKind>,
) -> CompareReport {
    let compared: BTreeMap<ResourceKind, ResourceDiff> = COMPARED_KINDS
        .iter()
        .filter(|k| kinds.is_empty() || kinds.contains(*k))
        .map(|k| (*k, compare_kind(*k, source.get(*k), target.get(*k))))
        .collect();

    CompareReport {
        source: source_label.to_string(),
        target: target_label.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        identical: compared.values().all(|d| d.summary.is_empty()),
        kinds: compared,
    }
}
