//! Run results.

use super::classify::{ErrorCollector, ImportError};
use super::resolver::PlanSummary;
use crate::resource::ResourceKind;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-kind outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    /// Resources created.
    pub created: usize,
    /// Resources updated, including create-conflict fallbacks.
    pub updated: usize,
    /// Resources left alone: equal to the target, or filtered out.
    pub skipped: usize,
    /// Resources whose operation failed.
    pub failed: usize,
}

impl KindCounts {
    /// Add another set of counts to this one.
    pub fn merge(&mut self, other: KindCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    /// Number of writes.
    pub fn changed(&self) -> usize {
        self.created + self.updated
    }
}

/// Result of a sync run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    /// Counts per participating kind.
    pub counts: BTreeMap<ResourceKind, KindCounts>,
    /// Every classified failure, in recording order.
    pub errors: Vec<ImportError>,
    /// The schema plan, populated in dry-run mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Whether the run was cancelled before all phases were submitted.
    pub cancelled: bool,
}

impl SyncOutcome {
    /// Counts for a kind (zero when it did not participate).
    pub fn counts(&self, kind: ResourceKind) -> KindCounts {
        self.counts.get(&kind).copied().unwrap_or_default()
    }

    /// Mutable counts for a kind.
    pub fn counts_mut(&mut self, kind: ResourceKind) -> &mut KindCounts {
        self.counts.entry(kind).or_default()
    }

    /// Counts summed across kinds.
    pub fn totals(&self) -> KindCounts {
        let mut totals = KindCounts::default();
        for counts in self.counts.values() {
            totals.merge(*counts);
        }
        totals
    }

    /// Whether any operation failed.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The errors indexed by category and kind.
    pub fn error_collector(&self) -> ErrorCollector {
        let collector = ErrorCollector::new();
        collector.extend(self.errors.iter().cloned());
        collector
    }

    /// Bounded human summary of the errors.
    pub fn error_summary(&self, max_examples: usize) -> String {
        self.error_collector().summary(max_examples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ErrorCategory;

    #[test]
    fn test_counts_and_totals() {
        let mut outcome = SyncOutcome::default();
        outcome.counts_mut(ResourceKind::Blueprint).created = 2;
        outcome.counts_mut(ResourceKind::Entity).updated = 3;
        outcome.counts_mut(ResourceKind::Entity).skipped = 1;

        assert_eq!(outcome.counts(ResourceKind::Team), KindCounts::default());
        let totals = outcome.totals();
        assert_eq!(totals.changed(), 5);
        assert_eq!(totals.skipped, 1);
    }

    #[test]
    fn test_error_summary() {
        let mut outcome = SyncOutcome::default();
        assert_eq!(outcome.error_summary(3), "No errors");

        outcome.errors.push(ImportError::new(
            ErrorCategory::Auth,
            ResourceKind::Team,
            "core",
            "forbidden",
        ));
        assert!(outcome.has_errors());
        assert!(outcome.error_summary(3).contains("AUTH (1):"));
    }

    #[test]
    fn test_error_collector_views() {
        let mut outcome = SyncOutcome::default();
        outcome.errors.push(ImportError::new(
            ErrorCategory::RateLimit,
            ResourceKind::Entity,
            "svc:api",
            "429 too many requests",
        ));
        outcome.errors.push(ImportError::new(
            ErrorCategory::Validation,
            ResourceKind::Team,
            "core",
            "bad request",
        ));

        let collector = outcome.error_collector();
        assert_eq!(collector.len(), 2);
        assert_eq!(collector.by_kind(ResourceKind::Team).len(), 1);
        assert_eq!(collector.count_by_category(ErrorCategory::RateLimit), 1);
        assert_eq!(collector.retryable()[0].resource_id(), "svc:api");
    }
}
