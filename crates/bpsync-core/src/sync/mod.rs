//! Resource sync engine.
//!
//! Lands an unordered, possibly cyclic set of schemas and their records in a
//! target that enforces referential integrity at creation time:
//!
//! - Diffing against a freshly fetched current state (create/update/skip)
//! - Dependency-ordered, phased apply with deferred field patching
//! - Bounded-concurrency execution with cancellation
//! - Classified, collected per-resource failures
//! - Read-only comparison of two states
//!
//! # Phases
//!
//! | Phase | Work | Concurrency |
//! |-------|------|-------------|
//! | 1 | Partition system schemas, strip deferred fields, level the rest | none |
//! | 2 | Create (or update on conflict) level by level, cyclic last | schema pool per level |
//! | 3 | Patch deferred fields once every target exists | schema pool per level |
//! | 4 | Update system schemas | schema pool |
//! | records | Every other kind, all kinds at once | one pool per kind |
//!
//! # Example
//!
//! ```ignore
//! use bpsync_core::sync::{diff, topological_sort};
//!
//! let plan = topological_sort(&snapshot.blueprints, &existing);
//! for (i, level) in plan.level_ids().iter().enumerate() {
//!     println!("level {}: {:?}", i, level);
//! }
//! ```

pub mod classify;
pub mod collector;
pub mod compare;
pub mod diff;
pub mod engine;
pub mod orchestrator;
pub mod pool;
pub mod records;
pub mod resolver;
pub mod result;

// Classifier types
pub use classify::{categorize, classify, summarize, ErrorCategory, ErrorCollector, ImportError};

// Pool types
pub use pool::{BatchProcessor, WorkerPool};

// Resolver types
pub use resolver::{
    dependencies_of, extract_deferred_fields, flatten_levels, is_system_schema,
    merge_deferred_fields, missing_dependencies, partition_system, relation_targets,
    resolve_selection, strip_deferred_fields, topological_sort, DependencyGraph, ExecutionPlan,
    PlanSummary, DEFERRED_FIELDS,
};

// Diff types
pub use diff::{
    diff, diff_fields, diff_kind, excluded_fields, is_system_page, normalize, resources_equal,
    DiffResult, FieldDiff, KindDiff, EXCLUDED_FIELDS, SYSTEM_PAGE_TYPES,
};

// Compare types
pub use compare::{compare, compare_kind, CompareReport, DiffSummary, ResourceChange, ResourceDiff};

// Orchestration types
pub use collector::{collect_snapshot, Collector};
pub use engine::SyncEngine;
pub use orchestrator::{Orchestrator, SchemaPlan};
pub use records::inherited_ownership_schemas;
pub use result::{KindCounts, SyncOutcome};
