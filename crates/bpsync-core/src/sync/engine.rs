//! Entry points: import, migrate, export.

use super::collector::Collector;
use super::diff::{self, DiffResult};
use super::orchestrator::Orchestrator;
use super::result::SyncOutcome;
use crate::api::ResourceApi;
use crate::config::{EngineConfig, SyncOptions};
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Synchronizes desired state into a target backend.
///
/// # Example
///
/// ```ignore
/// use bpsync_core::{EngineConfig, MemoryBackend, SyncEngine, SyncOptions};
///
/// let target = Arc::new(MemoryBackend::new());
/// let engine = SyncEngine::new(target, EngineConfig::default());
/// let outcome = engine.import(&snapshot, &SyncOptions::default()).await?;
/// println!("{}", outcome.error_summary(5));
/// ```
pub struct SyncEngine {
    target: Arc<dyn ResourceApi>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Create an engine for a target.
    pub fn new(target: Arc<dyn ResourceApi>, config: EngineConfig) -> Self {
        Self {
            target,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Thread a cancellation signal through every phase and pool.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn collector(&self, api: Arc<dyn ResourceApi>) -> Collector {
        Collector::new(api)
            .with_concurrency(self.config.concurrency.default)
            .with_cancellation(self.cancel.clone())
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.target), self.config.clone())
            .with_cancellation(self.cancel.clone())
    }

    /// Fetch the target's current state. Failure is fatal.
    pub async fn current_state(&self, options: &SyncOptions) -> Result<Snapshot> {
        let options = SyncOptions {
            blueprints: Vec::new(),
            ..options.clone()
        };
        self.collector(Arc::clone(&self.target))
            .collect(&options)
            .await
            .map_err(|err| match err {
                Error::Collect { kind, source } => Error::CurrentState { kind, source },
                other => other,
            })
    }

    /// Diff `desired` against a freshly fetched current state.
    pub async fn diff(&self, desired: &Snapshot, options: &SyncOptions) -> Result<(DiffResult, Snapshot)> {
        let current = self.current_state(options).await?;
        let result = diff::diff(desired, &current, options);
        Ok((result, current))
    }

    /// Import a snapshot into the target.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub async fn import(&self, desired: &Snapshot, options: &SyncOptions) -> Result<SyncOutcome> {
        let (result, current) = self.diff(desired, options).await?;
        info!(changes = result.has_changes(), "diff computed");

        if options.dry_run {
            return Ok(self.dry_run(&result));
        }
        Ok(self.orchestrator().apply(&result, &current, options).await)
    }

    /// Copy everything selected by `options` from `source` into the target.
    #[instrument(skip_all)]
    pub async fn migrate(&self, source: Arc<dyn ResourceApi>, options: &SyncOptions) -> Result<SyncOutcome> {
        let desired = self.collector(source).collect(options).await?;
        info!(resources = desired.len(), "collected migration source");
        self.import(&desired, options).await
    }

    /// Export the target's state.
    pub async fn export(&self, options: &SyncOptions) -> Result<Snapshot> {
        self.collector(Arc::clone(&self.target)).collect(options).await
    }

    /// Counts and plan a run would produce, without writing.
    pub fn dry_run(&self, result: &DiffResult) -> SyncOutcome {
        let mut outcome = SyncOutcome {
            dry_run: true,
            ..SyncOutcome::default()
        };
        for (kind, kind_diff) in result.iter() {
            let counts = outcome.counts_mut(kind);
            counts.created = kind_diff.to_create.len();
            counts.updated = kind_diff.to_update.len();
            counts.skipped = kind_diff.to_skip.len();
        }

        let schemas = result.filter().blueprints;
        outcome.plan = Some(self.orchestrator().plan_schemas(&schemas).summary());
        outcome
    }
}
