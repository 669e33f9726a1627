//! Blueprint Sync Core - Dependency-ordered resource synchronization.
//!
//! This crate lands schemas ("blueprints") and their records in a target
//! backend that enforces referential integrity at creation time, including
//! schemas that reference each other in cycles.

pub mod api;
pub mod config;
pub mod error;
pub mod memory;
pub mod resource;
pub mod snapshot;
pub mod sync;

pub use api::{ApiError, ResourceApi};
pub use config::{ConcurrencyLimits, EngineConfig, SyncOptions};
pub use error::{Error, Result};
pub use memory::{Call, MemoryBackend, Op};
pub use resource::{FieldError, Identity, Resource, ResourceKey, ResourceKind, UnknownKind};
pub use snapshot::Snapshot;

// Engine exports
pub use sync::{
    compare, diff, topological_sort, CompareReport, DiffResult, ErrorCategory, ExecutionPlan,
    ImportError, KindCounts, SyncEngine, SyncOutcome,
};
