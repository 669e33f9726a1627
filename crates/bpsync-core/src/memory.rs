//! In-memory backend.
//!
//! Implements [`ResourceApi`] with the referential-integrity rules of a real
//! target, so the engine can run offline and be tested end to end. Every
//! call is logged.

use crate::api::{ApiError, ResourceApi};
use crate::config::BUILTIN_SYSTEM_SCHEMAS;
use crate::resource::{Resource, ResourceKey, ResourceKind};
use crate::snapshot::Snapshot;
use crate::sync::{inherited_ownership_schemas, is_system_schema, relation_targets};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Collaborator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `list`
    List,
    /// `get`
    Get,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// One logged collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Operation.
    pub op: Op,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Rendered key, or the parent schema for scoped lists.
    pub target: String,
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: Op,
    kind: ResourceKind,
    target: String,
    error: ApiError,
}

type Store = BTreeMap<ResourceKind, BTreeMap<ResourceKey, Resource>>;

/// A [`ResourceApi`] backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<FailureRule>>,
    latency: Option<Duration>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend seeded with the built-in system schemas.
    pub fn with_builtin_schemas() -> Self {
        let backend = Self::new();
        {
            let mut store = backend.store.lock();
            let schemas = store.entry(ResourceKind::Blueprint).or_default();
            for id in BUILTIN_SYSTEM_SCHEMAS {
                let mut schema = Resource::new();
                schema.insert("identifier", Value::String(id.to_string()));
                schema.insert("title", Value::String(id.trim_start_matches('_').to_string()));
                schemas.insert(ResourceKey::new(*id), schema);
            }
        }
        backend
    }

    /// Create a backend holding the contents of a snapshot, without validation.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let backend = Self::new();
        backend.seed(snapshot);
        backend
    }

    /// Insert the contents of a snapshot, without validation.
    pub fn seed(&self, snapshot: &Snapshot) {
        let mut store = self.store.lock();
        for kind in ResourceKind::ALL {
            for resource in snapshot.get(kind) {
                if let Ok(key) = resource.key(kind) {
                    store.entry(kind).or_default().insert(key, resource.clone());
                }
            }
        }
    }

    /// Sleep this long inside every write, to make concurrency observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every matching call with `error`. `target` is the rendered key.
    pub fn fail_on(&self, op: Op, kind: ResourceKind, target: impl Into<String>, error: ApiError) {
        self.failures.lock().push(FailureRule {
            op,
            kind,
            target: target.into(),
            error,
        });
    }

    /// Current contents as a snapshot, ordered by key.
    pub fn snapshot(&self) -> Snapshot {
        let store = self.store.lock();
        let mut snapshot = Snapshot::new();
        for (kind, resources) in store.iter() {
            snapshot.set(*kind, resources.values().cloned().collect());
        }
        snapshot
    }

    /// A stored resource.
    pub fn stored(&self, kind: ResourceKind, key: &ResourceKey) -> Option<Resource> {
        self.store.lock().get(&kind).and_then(|m| m.get(key)).cloned()
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Number of calls of an operation on a kind.
    pub fn count(&self, op: Op, kind: ResourceKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.op == op && c.kind == kind)
            .count()
    }

    /// Forget logged calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Highest number of writes observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn log(&self, op: Op, kind: ResourceKind, target: &str) -> Result<(), ApiError> {
        self.calls.lock().push(Call {
            op,
            kind,
            target: target.to_string(),
        });
        match self
            .failures
            .lock()
            .iter()
            .find(|r| r.op == op && r.kind == kind && r.target == target)
        {
            Some(rule) => Err(rule.error.clone()),
            None => Ok(()),
        }
    }

    async fn simulate_write(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn stamp(&self, kind: ResourceKind, resource: &Resource, previous: Option<&Resource>) -> Resource {
        let mut stored = resource.clone();
        let now = Value::String(Utc::now().to_rfc3339());
        match previous {
            Some(previous) => {
                for field in ["id", "createdAt"] {
                    if let Some(value) = previous.get(field) {
                        stored.insert(field, value.clone());
                    }
                }
            }
            None => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                stored.insert("id", Value::String(format!("{}_{}", kind, n)));
                stored.insert("createdAt", now.clone());
            }
        }
        stored.insert("updatedAt", now);
        stored
    }
}

fn not_found(kind: ResourceKind, key: &ResourceKey) -> ApiError {
    ApiError::new(404, format!("no {} with key '{}'", kind, key))
}

fn missing_key(kind: ResourceKind, err: impl std::fmt::Display) -> ApiError {
    ApiError::new(400, format!("invalid {} payload: {}", kind, err))
}

/// Integrity checks a write must pass against the rest of the store.
fn validate(store: &Store, kind: ResourceKind, key: &ResourceKey, resource: &Resource) -> Result<(), ApiError> {
    let schemas = store.get(&ResourceKind::Blueprint);
    let schema_exists = |id: &str| {
        id == key.id && kind == ResourceKind::Blueprint
            || schemas.map_or(false, |s| s.contains_key(&ResourceKey::new(id)))
    };

    match kind {
        ResourceKind::Blueprint => validate_schema(resource, &schema_exists),
        ResourceKind::Entity | ResourceKind::Scorecard => {
            let parent = key.parent.as_deref().unwrap_or_default();
            let Some(schema) = schemas.and_then(|s| s.get(&ResourceKey::new(parent))) else {
                return Err(ApiError::new(
                    404,
                    format!("target blueprint '{}' was not found", parent),
                ));
            };
            if kind == ResourceKind::Entity {
                validate_entity(store, schema, parent, resource)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_schema(schema: &Resource, exists: &dyn Fn(&str) -> bool) -> Result<(), ApiError> {
    let relations = relation_targets(schema);
    for (name, target) in &relations {
        if !exists(target) {
            return Err(ApiError::new(
                404,
                format!("relation target blueprint '{}' of '{}' was not found", target, name),
            ));
        }
    }

    if let Ok(mirrors) = schema.get_map("mirrorProperties") {
        for (name, mirror) in mirrors {
            let path = mirror.get("path").and_then(Value::as_str).unwrap_or_default();
            let relation = path.split('.').next().unwrap_or_default();
            if !relations.contains_key(relation) {
                return Err(ApiError::new(
                    422,
                    format!("invalid relation '{}' in mirror property '{}'", relation, name),
                ));
            }
        }
    }

    if let Ok(aggregations) = schema.get_map("aggregationProperties") {
        for aggregation in aggregations.values() {
            if let Some(target) = aggregation.get("target").and_then(Value::as_str) {
                if !exists(target) {
                    return Err(ApiError::new(
                        404,
                        format!("target blueprint '{}' was not found", target),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn validate_entity(store: &Store, schema: &Resource, schema_id: &str, entity: &Resource) -> Result<(), ApiError> {
    if is_system_schema(schema_id) {
        return Err(ApiError::new(
            403,
            format!("protected_entity: records of '{}' are managed by the system", schema_id),
        ));
    }
    let schemas: Vec<Resource> = store
        .get(&ResourceKind::Blueprint)
        .map(|s| s.values().cloned().collect())
        .unwrap_or_default();
    if inherited_ownership_schemas(&schemas).contains(schema_id) {
        return Err(ApiError::new(
            422,
            format!("inherited_ownership_enabled on blueprint '{}'", schema_id),
        ));
    }

    let Ok(relations) = entity.get_map("relations") else {
        return Ok(());
    };
    let targets = relation_targets(schema);
    let entities = store.get(&ResourceKind::Entity);

    for (name, value) in relations {
        let ids: Vec<&str> = match value {
            Value::Null => Vec::new(),
            Value::String(id) => vec![id.as_str()],
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => return Err(ApiError::new(400, format!("malformed relation '{}'", name))),
        };
        let Some(target_schema) = targets.get(name) else {
            return Err(ApiError::new(
                422,
                format!("invalid relation '{}' on blueprint '{}'", name, schema_id),
            ));
        };
        for id in ids {
            let key = ResourceKey::scoped(target_schema.as_str(), id);
            if !entities.map_or(false, |e| e.contains_key(&key)) {
                return Err(ApiError::new(
                    404,
                    format!("relation target entity '{}' was not found", key),
                ));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceApi for MemoryBackend {
    async fn list(&self, kind: ResourceKind, parent: Option<&str>) -> Result<Vec<Resource>, ApiError> {
        self.log(Op::List, kind, parent.unwrap_or_default())?;
        let store = self.store.lock();
        Ok(store
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|(key, _)| parent.is_none() || key.parent.as_deref() == parent)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Resource, ApiError> {
        self.log(Op::Get, kind, &key.to_string())?;
        self.stored(kind, key).ok_or_else(|| not_found(kind, key))
    }

    async fn create(&self, kind: ResourceKind, resource: &Resource) -> Result<Resource, ApiError> {
        let key = resource.key(kind).map_err(|e| missing_key(kind, e))?;
        self.log(Op::Create, kind, &key.to_string())?;
        if kind == ResourceKind::Integration {
            return Err(ApiError::new(405, "integrations cannot be created"));
        }
        self.simulate_write().await;

        let mut store = self.store.lock();
        if store.get(&kind).map_or(false, |m| m.contains_key(&key)) {
            return Err(ApiError::new(
                409,
                format!("{} '{}' already exists", kind, key),
            ));
        }
        validate(&store, kind, &key, resource)?;

        let stored = self.stamp(kind, resource, None);
        store.entry(kind).or_default().insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        resource: &Resource,
    ) -> Result<Resource, ApiError> {
        self.log(Op::Update, kind, &key.to_string())?;
        self.simulate_write().await;

        let mut store = self.store.lock();
        let Some(previous) = store.get(&kind).and_then(|m| m.get(key)).cloned() else {
            return Err(not_found(kind, key));
        };
        validate(&store, kind, key, resource)?;

        let stored = self.stamp(kind, resource, Some(&previous));
        store.entry(kind).or_default().insert(key.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, key: &ResourceKey) -> Result<(), ApiError> {
        self.log(Op::Delete, kind, &key.to_string())?;
        let mut store = self.store.lock();
        let removed = store.get_mut(&kind).and_then(|m| m.remove(key));
        if removed.is_none() {
            return Err(not_found(kind, key));
        }
        if kind == ResourceKind::Blueprint {
            for scoped in [ResourceKind::Entity, ResourceKind::Scorecard] {
                if let Some(items) = store.get_mut(&scoped) {
                    items.retain(|k, _| k.parent.as_deref() != Some(key.id.as_str()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn res(value: Value) -> Resource {
        Resource::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_create_conflict_and_metadata() {
        let backend = MemoryBackend::new();
        let schema = res(json!({"identifier": "service", "title": "Service"}));

        let stored = backend.create(ResourceKind::Blueprint, &schema).await.unwrap();
        assert!(stored.contains("id"));
        assert!(stored.contains("createdAt"));

        let err = backend.create(ResourceKind::Blueprint, &schema).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(backend.count(Op::Create, ResourceKind::Blueprint), 2);
    }

    #[tokio::test]
    async fn test_schema_integrity() {
        let backend = MemoryBackend::new();
        let dangling = res(json!({
            "identifier": "deployment",
            "relations": {"service": {"target": "service"}}
        }));
        let err = backend.create(ResourceKind::Blueprint, &dangling).await.unwrap_err();
        assert_eq!(err.status, Some(404));

        let bad_mirror = res(json!({
            "identifier": "deployment",
            "mirrorProperties": {"name": {"path": "service.title"}}
        }));
        assert!(backend.create(ResourceKind::Blueprint, &bad_mirror).await.is_err());

        let self_ref = res(json!({
            "identifier": "tree",
            "relations": {"parent": {"target": "tree"}}
        }));
        assert!(backend.create(ResourceKind::Blueprint, &self_ref).await.is_ok());
    }

    #[tokio::test]
    async fn test_entity_integrity() {
        let backend = MemoryBackend::new();
        let entity = res(json!({"blueprint": "service", "identifier": "api"}));
        let err = backend.create(ResourceKind::Entity, &entity).await.unwrap_err();
        assert!(err.to_string().contains("was not found"));

        backend
            .create(
                ResourceKind::Blueprint,
                &res(json!({"identifier": "service", "relations": {"owner": {"target": "service"}}})),
            )
            .await
            .unwrap();
        backend.create(ResourceKind::Entity, &entity).await.unwrap();

        let linked = res(json!({
            "blueprint": "service",
            "identifier": "web",
            "relations": {"owner": "missing"}
        }));
        assert!(backend.create(ResourceKind::Entity, &linked).await.is_err());

        let linked = res(json!({
            "blueprint": "service",
            "identifier": "web",
            "relations": {"owner": "api"}
        }));
        assert!(backend.create(ResourceKind::Entity, &linked).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_requires_existing_and_keeps_metadata() {
        let backend = MemoryBackend::new();
        let key = ResourceKey::new("core");
        let team = res(json!({"name": "core", "description": "a"}));

        let err = backend.update(ResourceKind::Team, &key, &team).await.unwrap_err();
        assert_eq!(err.status, Some(404));

        let created = backend.create(ResourceKind::Team, &team).await.unwrap();
        let updated = backend
            .update(ResourceKind::Team, &key, &res(json!({"name": "core", "description": "b"})))
            .await
            .unwrap();
        assert_eq!(updated.get("id"), created.get("id"));
        assert_eq!(updated.get("description"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_integrations_cannot_be_created() {
        let backend = MemoryBackend::new();
        let integration = res(json!({"installationId": "gh"}));
        let err = backend.create(ResourceKind::Integration, &integration).await.unwrap_err();
        assert_eq!(err.status, Some(405));
    }

    #[tokio::test]
    async fn test_failure_injection_and_snapshot() {
        let backend = MemoryBackend::from_snapshot(
            &Snapshot::new().with(ResourceKind::Team, vec![res(json!({"name": "core"}))]),
        );
        backend.fail_on(Op::List, ResourceKind::User, "", ApiError::new(401, "unauthorized"));

        assert!(backend.list(ResourceKind::User, None).await.is_err());
        assert_eq!(backend.list(ResourceKind::Team, None).await.unwrap().len(), 1);
        assert_eq!(backend.snapshot().teams.len(), 1);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_cascades_to_records() {
        let backend = MemoryBackend::new();
        backend
            .create(ResourceKind::Blueprint, &res(json!({"identifier": "service"})))
            .await
            .unwrap();
        backend
            .create(
                ResourceKind::Entity,
                &res(json!({"blueprint": "service", "identifier": "api"})),
            )
            .await
            .unwrap();

        backend
            .delete(ResourceKind::Blueprint, &ResourceKey::new("service"))
            .await
            .unwrap();
        assert!(backend.snapshot().entities.is_empty());
    }
}
