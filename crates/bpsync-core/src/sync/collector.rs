//! Snapshot collection from a backend.
//!
//! Used for export, for reading a migration source, and for fetching the
//! target's current state before diffing.

use super::pool::WorkerPool;
use super::resolver;
use crate::api::{ApiError, ResourceApi};
use crate::config::{SyncOptions, DEFAULT_CONCURRENCY};
use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceKind};
use crate::snapshot::Snapshot;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Kinds listed once for the whole organization.
const ORG_WIDE_KINDS: [ResourceKind; 5] = [
    ResourceKind::Action,
    ResourceKind::Team,
    ResourceKind::User,
    ResourceKind::Page,
    ResourceKind::Integration,
];

/// Collects a [`Snapshot`] from a backend.
pub struct Collector {
    api: Arc<dyn ResourceApi>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Collector {
    /// Create a collector for a backend.
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self {
            api,
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }

    /// Ceiling for concurrent per-schema listings.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Abort with [`Error::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Collect every kind `options` includes.
    ///
    /// Schemas are always collected since records are listed per schema.
    /// Any listing failure is fatal, except a schema whose records answer
    /// 410 Gone.
    #[instrument(skip_all)]
    pub async fn collect(&self, options: &SyncOptions) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();

        let mut schemas = self
            .api
            .list(ResourceKind::Blueprint, None)
            .await
            .map_err(|source| Error::Collect {
                kind: ResourceKind::Blueprint,
                source,
            })?;
        if !options.blueprints.is_empty() {
            schemas = resolver::resolve_selection(&schemas, &options.blueprints);
            debug!(selected = schemas.len(), "narrowed schemas to selection");
        }

        let (entities, scorecards) = self.collect_scoped(&schemas, options).await?;
        snapshot.blueprints = schemas;
        snapshot.entities = entities;
        snapshot.scorecards = scorecards;

        let kinds: Vec<ResourceKind> = ORG_WIDE_KINDS
            .into_iter()
            .filter(|kind| options.includes(*kind))
            .collect();
        let listed = join_all(kinds.iter().map(|kind| self.api.list(*kind, None))).await;
        for (kind, result) in kinds.into_iter().zip(listed) {
            let items = result.map_err(|source| {
                warn!(%kind, error = %source, "failed to list");
                collect_error(kind, source)
            })?;
            snapshot.set(kind, items);
        }

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!(resources = snapshot.len(), "collected snapshot");
        Ok(snapshot)
    }

    /// List records and scorecards for every schema, concurrently.
    async fn collect_scoped(
        &self,
        schemas: &[Resource],
        options: &SyncOptions,
    ) -> Result<(Vec<Resource>, Vec<Resource>)> {
        let with_entities = options.includes(ResourceKind::Entity);
        let with_scorecards = options.includes(ResourceKind::Scorecard);
        if !with_entities && !with_scorecards {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut pool = WorkerPool::with_cancellation(self.concurrency, self.cancel.clone());
        for (idx, schema) in schemas.iter().enumerate() {
            let Ok(id) = schema.identifier() else {
                continue;
            };
            let id = id.to_string();
            let api = Arc::clone(&self.api);
            pool.submit(async move {
                let entities = if with_entities {
                    list_scoped(api.as_ref(), ResourceKind::Entity, &id).await?
                } else {
                    Vec::new()
                };
                let mut scorecards = if with_scorecards {
                    list_scoped(api.as_ref(), ResourceKind::Scorecard, &id).await?
                } else {
                    Vec::new()
                };
                for scorecard in &mut scorecards {
                    if !scorecard.contains("blueprintIdentifier") {
                        scorecard.insert("blueprintIdentifier", Value::String(id.clone()));
                    }
                }
                Ok::<_, Error>((idx, entities, scorecards))
            });
        }

        let mut listed = pool.wait().await.into_iter().collect::<Result<Vec<_>>>()?;
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        listed.sort_by_key(|(idx, _, _)| *idx);

        let mut entities = Vec::new();
        let mut scorecards = Vec::new();
        for (_, e, s) in listed {
            entities.extend(e);
            scorecards.extend(s);
        }
        Ok((entities, scorecards))
    }
}

/// List a scoped kind; a schema that is gone yields nothing.
async fn list_scoped(
    api: &dyn ResourceApi,
    kind: ResourceKind,
    schema: &str,
) -> Result<Vec<Resource>> {
    match api.list(kind, Some(schema)).await {
        Ok(items) => Ok(items),
        Err(err) if err.is_gone() => {
            debug!(%kind, schema, "schema gone, skipping");
            Ok(Vec::new())
        }
        Err(source) => Err(collect_error(kind, source)),
    }
}

fn collect_error(kind: ResourceKind, source: ApiError) -> Error {
    Error::Collect { kind, source }
}

/// Collect a snapshot with default settings.
pub async fn collect_snapshot(api: Arc<dyn ResourceApi>, options: &SyncOptions) -> Result<Snapshot> {
    Collector::new(api).collect(options).await
}
