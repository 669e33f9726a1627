//! Phased apply.
//!
//! Schemas go through four phases, strictly in order:
//!
//! 1. **Strip & order**: split off system schemas, set aside the deferred
//!    fields of regular schemas and level them with the resolver.
//! 2. **Create/update**: apply level by level; a create that conflicts is
//!    retried as an update. Cyclic schemas go last, best effort.
//! 3. **Patch deferred fields**: once every dependency target is known to
//!    exist, merge the deferred fields into the remote copy and update it.
//! 4. **System schemas**: update only, never create.
//!
//! Record kinds are applied afterwards, concurrently (see `records`).
//!
//! Every pool task returns its own outcome and the phase reduces them after
//! [`WorkerPool::wait`], so no lock is held across a collaborator call.

use super::classify::{classify, ErrorCategory, ErrorCollector, ImportError};
use super::diff::DiffResult;
use super::pool::{BatchProcessor, WorkerPool};
use super::resolver::{self, ExecutionPlan, PlanSummary};
use super::result::{KindCounts, SyncOutcome};
use crate::api::ResourceApi;
use crate::config::{EngineConfig, SyncOptions};
use crate::resource::{Resource, ResourceKey, ResourceKind};
use crate::snapshot::Snapshot;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome of a single write.
#[derive(Debug)]
pub(crate) enum Applied {
    Created,
    Updated,
    Failed(ImportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Create, falling back to update on conflict.
    Upsert,
    /// Update only.
    UpdateOnly,
}

/// Create `payload`, or update it when the target reports a conflict.
pub(crate) async fn upsert(
    api: &dyn ResourceApi,
    kind: ResourceKind,
    key: &ResourceKey,
    payload: &Resource,
) -> Applied {
    match api.create(kind, payload).await {
        Ok(_) => Applied::Created,
        Err(err) if err.is_conflict() => {
            debug!(%kind, %key, "create conflicted, updating instead");
            update_only(api, kind, key, payload).await
        }
        Err(err) => Applied::Failed(classify(&err, kind, key.to_string())),
    }
}

/// Update `payload` in place.
pub(crate) async fn update_only(
    api: &dyn ResourceApi,
    kind: ResourceKind,
    key: &ResourceKey,
    payload: &Resource,
) -> Applied {
    match api.update(kind, key, payload).await {
        Ok(_) => Applied::Updated,
        Err(err) => Applied::Failed(classify(&err, kind, key.to_string())),
    }
}

pub(crate) async fn write(
    api: &dyn ResourceApi,
    mode: WriteMode,
    kind: ResourceKind,
    key: &ResourceKey,
    payload: &Resource,
) -> Applied {
    match mode {
        WriteMode::Upsert => upsert(api, kind, key, payload).await,
        WriteMode::UpdateOnly => update_only(api, kind, key, payload).await,
    }
}

/// Per-kind reduction of write outcomes.
#[derive(Debug, Default)]
pub(crate) struct Tally {
    pub(crate) counts: KindCounts,
    pub(crate) errors: Vec<ImportError>,
}

impl Tally {
    /// Account for a primary write. Returns whether it succeeded.
    pub(crate) fn record(&mut self, applied: Applied) -> bool {
        match applied {
            Applied::Created => {
                self.counts.created += 1;
                true
            }
            Applied::Updated => {
                self.counts.updated += 1;
                true
            }
            Applied::Failed(err) => {
                self.counts.failed += 1;
                self.errors.push(err);
                false
            }
        }
    }

    /// Account for a follow-up patch, which never changes the counts.
    pub(crate) fn note(&mut self, applied: Applied) -> bool {
        match applied {
            Applied::Failed(err) => {
                self.errors.push(err);
                false
            }
            _ => true,
        }
    }

    pub(crate) fn merge_into(self, kind: ResourceKind, outcome: &mut SyncOutcome, errors: &ErrorCollector) {
        outcome.counts_mut(kind).merge(self.counts);
        errors.extend(self.errors);
    }
}

/// Phase 1 output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaPlan {
    /// Leveled regular schemas, with deferred fields stripped.
    pub plan: ExecutionPlan,
    /// Deferred fields by schema identifier.
    pub deferred: BTreeMap<String, Map<String, Value>>,
    /// System schemas, patched in phase 4.
    pub system: Vec<Resource>,
}

impl SchemaPlan {
    /// Identifier-only view for reporting.
    pub fn summary(&self) -> PlanSummary {
        let mut summary = self.plan.summary();
        summary.system = self
            .system
            .iter()
            .filter_map(|s| s.identifier().ok().map(str::to_string))
            .collect();
        summary
    }
}

/// Drives the phases against a target.
pub struct Orchestrator {
    pub(crate) api: Arc<dyn ResourceApi>,
    pub(crate) config: EngineConfig,
    pub(crate) cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator for a target.
    pub fn new(api: Arc<dyn ResourceApi>, config: EngineConfig) -> Self {
        Self {
            api,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop submitting new work once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Phase 1: partition, set deferred fields aside and level the schemas.
    ///
    /// Ordering uses the full dependency edges; the levels carry the
    /// stripped payloads that phase 2 sends.
    pub fn plan_schemas(&self, schemas: &[Resource]) -> SchemaPlan {
        let (regular, system) = resolver::partition_system(schemas);

        let deferred = regular
            .iter()
            .filter_map(|schema| {
                let id = schema.identifier().ok()?;
                Some((id.to_string(), resolver::extract_deferred_fields(schema)?))
            })
            .collect();

        let mut existing = self.config.builtin_system_schemas.clone();
        existing.extend(
            system
                .iter()
                .filter_map(|s| s.identifier().ok().map(str::to_string)),
        );

        let plan = resolver::topological_sort(&regular, &existing)
            .map(resolver::strip_deferred_fields);

        SchemaPlan {
            plan,
            deferred,
            system,
        }
    }

    /// Apply a diff against the target.
    ///
    /// Only toCreate/toUpdate items are written; toSkip items are counted as
    /// skipped. Individual failures are collected in the outcome.
    #[instrument(skip_all)]
    pub async fn apply(
        &self,
        diff: &DiffResult,
        current: &Snapshot,
        options: &SyncOptions,
    ) -> SyncOutcome {
        let data = diff.filter();
        let errors = ErrorCollector::new();
        let mut outcome = SyncOutcome::default();
        for (kind, kind_diff) in diff.iter() {
            outcome.counts_mut(kind).skipped = kind_diff.to_skip.len();
        }

        if options.includes(ResourceKind::Blueprint) && !data.blueprints.is_empty() {
            self.apply_schemas(&data.blueprints, current)
                .await
                .merge_into(ResourceKind::Blueprint, &mut outcome, &errors);
        }

        if self.cancel.is_cancelled() {
            warn!("run cancelled after schema phases");
            outcome.cancelled = true;
            outcome.errors = errors.into_errors();
            return outcome;
        }

        let blueprints = diff.kind(ResourceKind::Blueprint);
        let schemas: Vec<Resource> = blueprints
            .to_create
            .iter()
            .chain(&blueprints.to_update)
            .chain(&blueprints.to_skip)
            .chain(&current.blueprints)
            .cloned()
            .collect();

        for (kind, tally) in self.apply_records(&data, &schemas, options).await {
            tally.merge_into(kind, &mut outcome, &errors);
        }

        if errors.has_errors() {
            warn!(
                errors = errors.len(),
                retryable = errors.retryable().len(),
                "sync finished with failures"
            );
        }
        outcome.cancelled = self.cancel.is_cancelled();
        outcome.errors = errors.into_errors();
        outcome
    }

    #[instrument(skip_all, fields(schemas = schemas.len()))]
    async fn apply_schemas(&self, schemas: &[Resource], current: &Snapshot) -> Tally {
        let SchemaPlan {
            plan,
            deferred,
            system,
        } = self.plan_schemas(schemas);
        info!(
            levels = plan.levels.len(),
            cyclic = plan.cyclic.len(),
            system = system.len(),
            deferred = deferred.len(),
            "schema plan ready"
        );

        let mut tally = Tally::default();
        let mut succeeded = BTreeSet::new();

        for (idx, level) in plan.levels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return tally;
            }
            debug!(level = idx, size = level.len(), "applying schema level");
            succeeded.extend(self.write_schemas(level, WriteMode::Upsert, &mut tally).await);
        }

        if !plan.cyclic.is_empty() && !self.cancel.is_cancelled() {
            warn!(schemas = ?plan.cyclic_ids(), "applying cyclic schemas without ordering");
            succeeded.extend(
                self.write_schemas(&plan.cyclic, WriteMode::Upsert, &mut tally)
                    .await,
            );
        }

        let system_ids: BTreeSet<String> = system
            .iter()
            .filter_map(|s| s.identifier().ok().map(str::to_string))
            .collect();
        self.patch_deferred(&plan, &deferred, &succeeded, &system_ids, current, &mut tally)
            .await;

        if !system.is_empty() && !self.cancel.is_cancelled() {
            info!(count = system.len(), "patching system schemas");
            self.write_schemas(&system, WriteMode::UpdateOnly, &mut tally)
                .await;
        }

        tally
    }

    /// Write a batch of schemas concurrently. Returns the identifiers that succeeded.
    async fn write_schemas(
        &self,
        schemas: &[Resource],
        mode: WriteMode,
        tally: &mut Tally,
    ) -> Vec<String> {
        let mut pool = WorkerPool::with_cancellation(
            self.config.concurrency.schemas,
            self.cancel.clone(),
        );

        for schema in schemas {
            let Ok(key) = schema.key(ResourceKind::Blueprint) else {
                continue;
            };
            let api = Arc::clone(&self.api);
            let payload = schema.clone();
            pool.submit(async move {
                let applied = write(api.as_ref(), mode, ResourceKind::Blueprint, &key, &payload).await;
                (key.id, applied)
            });
        }

        let mut succeeded = Vec::new();
        for (id, applied) in pool.wait().await {
            if tally.record(applied) {
                succeeded.push(id);
            }
        }
        succeeded
    }

    /// Phase 3. Runs level by level, cyclic schemas last.
    async fn patch_deferred(
        &self,
        plan: &ExecutionPlan,
        deferred: &BTreeMap<String, Map<String, Value>>,
        succeeded: &BTreeSet<String>,
        system_ids: &BTreeSet<String>,
        current: &Snapshot,
        tally: &mut Tally,
    ) {
        if deferred.is_empty() || self.cancel.is_cancelled() {
            return;
        }

        let existed: BTreeSet<String> = current
            .blueprints
            .iter()
            .filter_map(|s| s.identifier().ok().map(str::to_string))
            .collect();
        let eligible = |id: &str| succeeded.contains(id) || existed.contains(id);

        let mut known: BTreeSet<String> = succeeded
            .iter()
            .chain(&existed)
            .chain(system_ids)
            .chain(&self.config.builtin_system_schemas)
            .cloned()
            .collect();

        let unknown: BTreeSet<String> = deferred
            .iter()
            .filter(|(id, _)| eligible(id.as_str()))
            .flat_map(|(id, fields)| {
                resolver::missing_dependencies(&with_identifier(id, fields), &known)
            })
            .collect();
        known.extend(self.confirm_existing(unknown).await);

        let mut groups = plan.level_ids();
        groups.push(plan.cyclic_ids());

        for group in groups {
            if self.cancel.is_cancelled() {
                return;
            }

            let mut pool = WorkerPool::with_cancellation(
                self.config.concurrency.schemas,
                self.cancel.clone(),
            );
            for id in group {
                let Some(fields) = deferred.get(&id) else {
                    continue;
                };
                if !eligible(id.as_str()) {
                    continue;
                }

                let missing = resolver::missing_dependencies(&with_identifier(&id, fields), &known);
                if !missing.is_empty() {
                    warn!(schema = %id, missing = ?missing, "skipping deferred patch");
                    tally.errors.push(ImportError::new(
                        ErrorCategory::Dependency,
                        ResourceKind::Blueprint,
                        id,
                        format!(
                            "cannot patch deferred fields, missing dependencies: {}",
                            missing.join(", ")
                        ),
                    ));
                    continue;
                }

                let api = Arc::clone(&self.api);
                let fields = fields.clone();
                pool.submit(async move { patch_schema(api.as_ref(), &id, &fields).await });
            }

            for applied in pool.wait().await {
                tally.note(applied);
            }
        }
    }

    /// Check which of `ids` exist in the target right now.
    async fn confirm_existing(&self, ids: BTreeSet<String>) -> Vec<String> {
        if ids.is_empty() {
            return Vec::new();
        }
        debug!(count = ids.len(), "checking dependency targets in the target");

        let batch = BatchProcessor::new(self.config.concurrency.schemas)
            .with_cancellation(self.cancel.clone())
            .with_progress(|done, total| debug!(done, total, "dependency target checked"));
        let checked = batch
            .process(ids.into_iter().collect(), |id: String| {
                let api = Arc::clone(&self.api);
                async move {
                    let key = ResourceKey::new(id);
                    let found = api.get(ResourceKind::Blueprint, &key).await.is_ok();
                    (key.id, found)
                }
            })
            .await;

        checked
            .into_iter()
            .flatten()
            .filter_map(|(id, found)| found.then_some(id))
            .collect()
    }
}

fn with_identifier(id: &str, fields: &Map<String, Value>) -> Resource {
    let mut schema = Resource::from(fields.clone());
    schema.insert("identifier", Value::String(id.to_string()));
    schema
}

/// Fetch the remote copy, merge the deferred fields and write it back.
async fn patch_schema(api: &dyn ResourceApi, id: &str, fields: &Map<String, Value>) -> Applied {
    let key = ResourceKey::new(id);
    let remote = match api.get(ResourceKind::Blueprint, &key).await {
        Ok(remote) => remote,
        Err(err) => return Applied::Failed(classify(&err, ResourceKind::Blueprint, id)),
    };
    let merged = resolver::merge_deferred_fields(&remote, fields);
    update_only(api, ResourceKind::Blueprint, &key, &merged).await
}
