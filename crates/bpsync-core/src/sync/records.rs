//! Record-kind import.
//!
//! Runs after the schema phases. Every kind is imported independently and
//! concurrently, each with its own pool.

use super::orchestrator::{upsert, write, Orchestrator, Tally, WriteMode};
use super::pool::WorkerPool;
use super::resolver;
use crate::config::SyncOptions;
use crate::resource::{Resource, ResourceKey, ResourceKind};
use crate::snapshot::Snapshot;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Schemas whose records the target rejects because their ownership is
/// inherited through a relation.
///
/// A schema qualifies when it is flagged (`ownership.type` is `Inherited`,
/// or `inheritedOwnership` is true), or when its ownership path walks a
/// relation chain through a schema that qualifies.
pub fn inherited_ownership_schemas(schemas: &[Resource]) -> BTreeSet<String> {
    let mut by_id: BTreeMap<&str, &Resource> = BTreeMap::new();
    for schema in schemas {
        if let Ok(id) = schema.identifier() {
            by_id.entry(id).or_insert(schema);
        }
    }

    let mut inherited: BTreeSet<String> = by_id
        .iter()
        .filter(|(_, schema)| is_flagged(schema))
        .map(|(id, _)| id.to_string())
        .collect();

    loop {
        let newly: Vec<String> = by_id
            .iter()
            .filter(|(id, _)| !inherited.contains(**id))
            .filter(|(_, schema)| {
                ownership_chain(schema, &by_id)
                    .iter()
                    .any(|target| inherited.contains(target))
            })
            .map(|(id, _)| id.to_string())
            .collect();
        if newly.is_empty() {
            break;
        }
        inherited.extend(newly);
    }

    inherited
}

fn is_flagged(schema: &Resource) -> bool {
    if schema.get_bool("inheritedOwnership").unwrap_or(false) {
        return true;
    }
    schema
        .get_map("ownership")
        .ok()
        .and_then(|o| o.get("type"))
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("inherited"))
        .unwrap_or(false)
}

/// Schemas visited by following a schema's ownership path through relations.
fn ownership_chain(schema: &Resource, by_id: &BTreeMap<&str, &Resource>) -> Vec<String> {
    let Some(path) = schema
        .get_map("ownership")
        .ok()
        .and_then(|o| o.get("path"))
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };

    let mut chain = Vec::new();
    let mut cursor = schema;
    for segment in path.split('.') {
        let Some(target) = resolver::relation_targets(cursor).remove(segment) else {
            break;
        };
        let next = by_id.get(target.as_str()).copied();
        chain.push(target);
        match next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    chain
}

impl Orchestrator {
    /// Whether records of a schema are rejected by the target.
    pub fn is_protected_schema(&self, identifier: &str) -> bool {
        resolver::is_system_schema(identifier) || self.config.protected_schemas.contains(identifier)
    }

    /// Import every participating record kind concurrently.
    pub(crate) async fn apply_records(
        &self,
        data: &Snapshot,
        schemas: &[Resource],
        options: &SyncOptions,
    ) -> Vec<(ResourceKind, Tally)> {
        let kinds: Vec<ResourceKind> = ResourceKind::ALL
            .into_iter()
            .filter(|kind| *kind != ResourceKind::Blueprint && options.includes(*kind))
            .filter(|kind| !data.get(*kind).is_empty())
            .collect();

        let tallies = join_all(
            kinds
                .iter()
                .map(|kind| self.import_kind(*kind, data.get(*kind), schemas)),
        )
        .await;

        kinds.into_iter().zip(tallies).collect()
    }

    #[instrument(skip(self, items, schemas), fields(count = items.len()))]
    async fn import_kind(&self, kind: ResourceKind, items: &[Resource], schemas: &[Resource]) -> Tally {
        if self.cancel.is_cancelled() {
            return Tally::default();
        }
        info!("importing {}", kind.plural());

        match kind {
            ResourceKind::Entity => self.import_entities(items, schemas).await,
            ResourceKind::Scorecard => self.import_scorecards(items).await,
            ResourceKind::Integration => self.write_each(kind, items, WriteMode::UpdateOnly).await,
            _ => self.write_each(kind, items, WriteMode::Upsert).await,
        }
    }

    /// One pool task per item, payload cleaned of target-managed fields.
    async fn write_each(&self, kind: ResourceKind, items: &[Resource], mode: WriteMode) -> Tally {
        let excluded = kind.payload_excluded_fields();
        let mut pool = WorkerPool::with_cancellation(
            self.config.concurrency.for_kind(kind),
            self.cancel.clone(),
        );

        for item in items {
            let Ok(key) = item.key(kind) else {
                continue;
            };
            let api = Arc::clone(&self.api);
            let payload = item.without(&excluded);
            pool.submit(async move { write(api.as_ref(), mode, kind, &key, &payload).await });
        }

        let mut tally = Tally::default();
        for applied in pool.wait().await {
            tally.record(applied);
        }
        tally
    }

    /// Scorecards are grouped per parent schema; one task handles a group.
    async fn import_scorecards(&self, scorecards: &[Resource]) -> Tally {
        let kind = ResourceKind::Scorecard;
        let excluded = kind.payload_excluded_fields();

        let mut groups: BTreeMap<String, Vec<(ResourceKey, Resource)>> = BTreeMap::new();
        for scorecard in scorecards {
            let Ok(key) = scorecard.key(kind) else {
                continue;
            };
            let parent = key.parent.clone().unwrap_or_default();
            groups
                .entry(parent)
                .or_default()
                .push((key, scorecard.without(&excluded)));
        }

        let mut pool = WorkerPool::with_cancellation(
            self.config.concurrency.for_kind(kind),
            self.cancel.clone(),
        );
        for (parent, group) in groups {
            let api = Arc::clone(&self.api);
            pool.submit(async move {
                debug!(schema = %parent, count = group.len(), "importing scorecard group");
                let mut applied = Vec::with_capacity(group.len());
                for (key, payload) in &group {
                    applied.push(upsert(api.as_ref(), kind, key, payload).await);
                }
                applied
            });
        }

        let mut tally = Tally::default();
        for applied in pool.wait().await.into_iter().flatten() {
            tally.record(applied);
        }
        tally
    }

    /// Two passes: write records without relations, then patch relations
    /// back into those that were written.
    async fn import_entities(&self, entities: &[Resource], schemas: &[Resource]) -> Tally {
        let kind = ResourceKind::Entity;
        let inherited = inherited_ownership_schemas(schemas);
        let mut tally = Tally::default();

        let mut accepted = Vec::with_capacity(entities.len());
        for entity in entities {
            let Ok(key) = entity.key(kind) else {
                continue;
            };
            let schema = key.parent.as_deref().unwrap_or_default();
            if self.is_protected_schema(schema) || inherited.contains(schema) {
                tally.counts.skipped += 1;
                continue;
            }
            accepted.push((key, entity));
        }
        if tally.counts.skipped > 0 {
            info!(
                skipped = tally.counts.skipped,
                "skipping records of protected or ownership-inherited schemas"
            );
        }

        let limit = self.config.concurrency.for_kind(kind);
        let mut first = WorkerPool::with_cancellation(limit, self.cancel.clone());
        for (key, entity) in accepted {
            let has_relations = matches!(
                entity.get("relations"),
                Some(Value::Object(relations)) if !relations.is_empty()
            );
            let (payload, relink) = if has_relations {
                (entity.without(&["relations"]), Some(entity.clone()))
            } else {
                (entity.clone(), None)
            };

            let api = Arc::clone(&self.api);
            first.submit(async move {
                let applied = upsert(api.as_ref(), kind, &key, &payload).await;
                (key, relink, applied)
            });
        }

        let mut relinks = Vec::new();
        for (key, relink, applied) in first.wait().await {
            if tally.record(applied) {
                if let Some(full) = relink {
                    relinks.push((key, full));
                }
            }
        }

        if relinks.is_empty() || self.cancel.is_cancelled() {
            return tally;
        }
        debug!(count = relinks.len(), "patching record relations");

        let mut second = WorkerPool::with_cancellation(limit, self.cancel.clone());
        for (key, full) in relinks {
            let api = Arc::clone(&self.api);
            second.submit(async move { write(api.as_ref(), WriteMode::UpdateOnly, kind, &key, &full).await });
        }
        for applied in second.wait().await {
            tally.note(applied);
        }
        tally
    }
}
