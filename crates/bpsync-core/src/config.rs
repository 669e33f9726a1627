//! Engine configuration.

use crate::resource::ResourceKind;
use std::collections::BTreeSet;

/// Default concurrency ceiling for schema operations.
pub const SCHEMA_CONCURRENCY: usize = 5;

/// Default concurrency ceiling for per-record operations.
pub const RECORD_CONCURRENCY: usize = 20;

/// Default concurrency ceiling for every other kind.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Examples shown per category in an error summary.
pub const DEFAULT_ERROR_EXAMPLES: usize = 5;

/// System schemas assumed to exist in every target.
pub const BUILTIN_SYSTEM_SCHEMAS: &[&str] = &["_user", "_team", "_rule", "_rule_result"];

/// Concurrency ceilings, per class of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Ceiling for schema create/update/patch.
    pub schemas: usize,
    /// Ceiling for data-record operations.
    pub records: usize,
    /// Ceiling for everything else.
    pub default: usize,
}

impl ConcurrencyLimits {
    /// Ceiling for a given resource kind.
    pub fn for_kind(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Blueprint => self.schemas,
            ResourceKind::Entity => self.records,
            _ => self.default,
        }
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            schemas: SCHEMA_CONCURRENCY,
            records: RECORD_CONCURRENCY,
            default: DEFAULT_CONCURRENCY,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool ceilings.
    pub concurrency: ConcurrencyLimits,
    /// System schema identifiers treated as already existing.
    pub builtin_system_schemas: BTreeSet<String>,
    /// Schemas whose records the target rejects, beyond the `_` prefix rule.
    pub protected_schemas: BTreeSet<String>,
    /// Examples shown per category in error summaries.
    pub error_examples: usize,
}

impl EngineConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            concurrency: ConcurrencyLimits::default(),
            builtin_system_schemas: BUILTIN_SYSTEM_SCHEMAS.iter().map(|s| s.to_string()).collect(),
            protected_schemas: BTreeSet::new(),
            error_examples: DEFAULT_ERROR_EXAMPLES,
        }
    }

    /// Set all concurrency ceilings.
    pub fn with_concurrency(mut self, concurrency: ConcurrencyLimits) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the schema concurrency ceiling.
    pub fn with_schema_concurrency(mut self, limit: usize) -> Self {
        self.concurrency.schemas = limit;
        self
    }

    /// Set the record concurrency ceiling.
    pub fn with_record_concurrency(mut self, limit: usize) -> Self {
        self.concurrency.records = limit;
        self
    }

    /// Add a schema to the protected deny-list.
    pub fn with_protected_schema(mut self, identifier: impl Into<String>) -> Self {
        self.protected_schemas.insert(identifier.into());
        self
    }

    /// Set the number of examples per category in summaries.
    pub fn with_error_examples(mut self, examples: usize) -> Self {
        self.error_examples = examples;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a single sync invocation.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Kinds that participate. Empty means all.
    pub kinds: BTreeSet<ResourceKind>,
    /// Omit data-record sync.
    pub skip_records: bool,
    /// Compute the diff and plan without writing.
    pub dry_run: bool,
    /// Schemas to collect from a source. Empty means all.
    pub blueprints: Vec<String>,
}

impl SyncOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the run to the given kinds.
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Skip data records.
    pub fn with_skip_records(mut self, skip: bool) -> Self {
        self.skip_records = skip;
        self
    }

    /// Enable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Select schemas to collect.
    pub fn with_blueprints(mut self, blueprints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blueprints = blueprints.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a kind participates in this run.
    pub fn includes(&self, kind: ResourceKind) -> bool {
        if kind == ResourceKind::Entity && self.skip_records {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency.schemas, SCHEMA_CONCURRENCY);
        assert_eq!(config.concurrency.records, RECORD_CONCURRENCY);
        assert_eq!(config.error_examples, DEFAULT_ERROR_EXAMPLES);
        assert!(config.builtin_system_schemas.contains("_user"));
        assert!(config.protected_schemas.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_schema_concurrency(2)
            .with_record_concurrency(50)
            .with_protected_schema("audit")
            .with_error_examples(1);

        assert_eq!(config.concurrency.for_kind(ResourceKind::Blueprint), 2);
        assert_eq!(config.concurrency.for_kind(ResourceKind::Entity), 50);
        assert_eq!(config.concurrency.for_kind(ResourceKind::Team), DEFAULT_CONCURRENCY);
        assert!(config.protected_schemas.contains("audit"));
        assert_eq!(config.error_examples, 1);
    }

    #[test]
    fn test_options_kind_filter() {
        let all = SyncOptions::new();
        assert!(all.includes(ResourceKind::Page));

        let some = SyncOptions::new().with_kinds([ResourceKind::Blueprint, ResourceKind::Entity]);
        assert!(some.includes(ResourceKind::Blueprint));
        assert!(!some.includes(ResourceKind::Team));

        let no_records = some.with_skip_records(true);
        assert!(!no_records.includes(ResourceKind::Entity));
    }
}
