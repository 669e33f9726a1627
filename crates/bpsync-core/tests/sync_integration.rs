//! End-to-end sync runs against the in-memory backend.

use bpsync_core::sync::{ErrorCategory, KindDiff, Orchestrator};
use bpsync_core::{
    ApiError, DiffResult, EngineConfig, Error, MemoryBackend, Op, Resource, ResourceKey,
    ResourceKind, Snapshot, SyncEngine, SyncOptions,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn res(value: Value) -> Resource {
    Resource::from_value(value).unwrap()
}

fn schema(id: &str, relations: &[(&str, &str)]) -> Resource {
    let relations: serde_json::Map<String, Value> = relations
        .iter()
        .map(|(name, target)| (name.to_string(), json!({"target": target, "many": false})))
        .collect();
    let mut schema = res(json!({"identifier": id, "title": id.to_uppercase()}));
    if !relations.is_empty() {
        schema.insert("relations", Value::Object(relations));
    }
    schema
}

/// a <- b, a <- c, {b, c} <- d, plus records of a and b.
fn catalog() -> Snapshot {
    let mut d = schema("d", &[("b", "b"), ("c", "c")]);
    d.insert("mirrorProperties", json!({"b_title": {"path": "b.$title"}}));

    Snapshot::new()
        .with(
            ResourceKind::Blueprint,
            vec![d, schema("c", &[("a", "a")]), schema("b", &[("a", "a")]), schema("a", &[])],
        )
        .with(
            ResourceKind::Entity,
            vec![
                res(json!({"blueprint": "b", "identifier": "b1", "relations": {"a": "a1"}})),
                res(json!({"blueprint": "a", "identifier": "a1", "properties": {"tier": 1}})),
            ],
        )
        .with(
            ResourceKind::Team,
            vec![res(json!({"name": "platform", "description": "Platform team"}))],
        )
}

fn engine(target: &Arc<MemoryBackend>) -> SyncEngine {
    SyncEngine::new(target.clone(), EngineConfig::default())
}

#[tokio::test]
async fn test_import_into_empty_target() {
    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let outcome = engine(&target)
        .import(&catalog(), &SyncOptions::default())
        .await
        .unwrap();

    assert!(outcome.errors.is_empty(), "{}", outcome.error_summary(5));
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 4);
    assert_eq!(outcome.counts(ResourceKind::Entity).created, 2);
    assert_eq!(outcome.counts(ResourceKind::Team).created, 1);

    let d = target
        .stored(ResourceKind::Blueprint, &ResourceKey::new("d"))
        .unwrap();
    assert_eq!(d.get_map("relations").unwrap().len(), 2);
    assert!(d.contains("mirrorProperties"));

    let b1 = target
        .stored(ResourceKind::Entity, &ResourceKey::scoped("b", "b1"))
        .unwrap();
    assert_eq!(b1.get_map("relations").unwrap().get("a"), Some(&json!("a1")));
}

#[tokio::test]
async fn test_second_import_is_a_noop() {
    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let engine = engine(&target);
    engine.import(&catalog(), &SyncOptions::default()).await.unwrap();
    target.clear_calls();

    let outcome = engine.import(&catalog(), &SyncOptions::default()).await.unwrap();

    assert_eq!(outcome.totals().changed(), 0);
    assert_eq!(outcome.counts(ResourceKind::Blueprint).skipped, 4);
    assert_eq!(outcome.counts(ResourceKind::Entity).skipped, 2);
    assert!(target
        .calls()
        .iter()
        .all(|call| call.op == Op::List || call.op == Op::Get));
}

#[tokio::test]
async fn test_cyclic_schemas_land_with_relations() {
    let desired = Snapshot::new().with(
        ResourceKind::Blueprint,
        vec![
            schema("a", &[]),
            schema("b", &[("a", "a")]),
            schema("c", &[("a", "a"), ("d", "d")]),
            schema("d", &[("b", "b"), ("c", "c")]),
        ],
    );
    let target = Arc::new(MemoryBackend::new());
    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();

    assert!(outcome.errors.is_empty(), "{}", outcome.error_summary(5));
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 4);
    for id in ["c", "d"] {
        let stored = target
            .stored(ResourceKind::Blueprint, &ResourceKey::new(id))
            .unwrap();
        assert_eq!(stored.get_map("relations").unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_create_conflict_falls_back_to_update() {
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(ResourceKind::Blueprint, vec![schema("x", &[])]));

    let mut diff = DiffResult::default();
    diff.insert(
        ResourceKind::Blueprint,
        KindDiff {
            to_create: vec![res(json!({"identifier": "x", "title": "X v2"}))],
            ..KindDiff::default()
        },
    );

    let outcome = Orchestrator::new(target.clone(), EngineConfig::default())
        .apply(&diff, &Snapshot::new(), &SyncOptions::default())
        .await;

    assert_eq!(outcome.counts(ResourceKind::Blueprint).updated, 1);
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 0);
    assert!(outcome.errors.is_empty());
    assert_eq!(target.count(Op::Create, ResourceKind::Blueprint), 1);
    assert_eq!(target.count(Op::Update, ResourceKind::Blueprint), 1);

    let stored = target
        .stored(ResourceKind::Blueprint, &ResourceKey::new("x"))
        .unwrap();
    assert_eq!(stored.get("title"), Some(&json!("X v2")));
}

#[tokio::test]
async fn test_current_state_failure_is_fatal() {
    let target = Arc::new(MemoryBackend::new());
    target.fail_on(
        Op::List,
        ResourceKind::Blueprint,
        "",
        ApiError::new(401, "unauthorized"),
    );

    let err = engine(&target)
        .import(&catalog(), &SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::CurrentState {
            kind: ResourceKind::Blueprint,
            ..
        }
    ));
    assert_eq!(target.count(Op::Create, ResourceKind::Blueprint), 0);
}

#[tokio::test]
async fn test_record_listing_failure_is_fatal() {
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(ResourceKind::Blueprint, vec![schema("a", &[])]));
    target.fail_on(Op::List, ResourceKind::Entity, "a", ApiError::new(500, "boom"));

    let err = engine(&target)
        .import(&catalog(), &SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CurrentState {
            kind: ResourceKind::Entity,
            ..
        }
    ));
}

#[tokio::test]
async fn test_org_wide_listing_failure_is_fatal() {
    let team = res(json!({"name": "platform", "description": "Platform team"}));
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(ResourceKind::Team, vec![team.clone()]));
    target.fail_on(
        Op::List,
        ResourceKind::Team,
        "",
        ApiError::new(503, "service unavailable"),
    );

    let desired = Snapshot::new().with(ResourceKind::Team, vec![team]);
    let err = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::CurrentState {
            kind: ResourceKind::Team,
            ..
        }
    ));
    assert_eq!(target.count(Op::Create, ResourceKind::Team), 0);
    assert_eq!(target.count(Op::Update, ResourceKind::Team), 0);
}

#[tokio::test]
async fn test_export_fails_when_a_kind_cannot_be_listed() {
    let target = Arc::new(MemoryBackend::from_snapshot(&catalog()));
    target.fail_on(Op::List, ResourceKind::User, "", ApiError::new(401, "unauthorized"));

    let err = engine(&target)
        .export(&SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Collect {
            kind: ResourceKind::User,
            ..
        }
    ));
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let options = SyncOptions::default().with_dry_run(true);
    let outcome = engine(&target).import(&catalog(), &options).await.unwrap();

    assert!(outcome.dry_run);
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 4);
    let plan = outcome.plan.unwrap();
    assert_eq!(plan.levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    assert!(plan.cyclic.is_empty());

    assert_eq!(target.count(Op::Create, ResourceKind::Blueprint), 0);
    assert_eq!(target.count(Op::Create, ResourceKind::Entity), 0);
}

#[tokio::test]
async fn test_metadata_differences_are_ignored() {
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(
        ResourceKind::Blueprint,
        vec![res(json!({
            "identifier": "a",
            "title": "A",
            "createdAt": "2024-01-01T00:00:00Z",
            "updatedBy": "someone",
            "icon": "Cloud"
        }))],
    ));
    let desired = Snapshot::new().with(
        ResourceKind::Blueprint,
        vec![res(json!({"identifier": "a", "title": "A", "color": "blue"}))],
    );

    let (diff, _) = engine(&target)
        .diff(&desired, &SyncOptions::default())
        .await
        .unwrap();
    assert!(!diff.has_changes());
    assert_eq!(diff.to_skip(ResourceKind::Blueprint).len(), 1);
}

#[tokio::test]
async fn test_protected_and_inherited_records_are_skipped() {
    let mut owned = schema("deploy", &[]);
    owned.insert("inheritedOwnership", json!(true));
    let desired = Snapshot::new()
        .with(ResourceKind::Blueprint, vec![schema("svc", &[]), owned])
        .with(
            ResourceKind::Entity,
            vec![
                res(json!({"blueprint": "svc", "identifier": "api"})),
                res(json!({"blueprint": "deploy", "identifier": "d1"})),
                res(json!({"blueprint": "_user", "identifier": "someone@example.com"})),
            ],
        );

    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();

    let entities = outcome.counts(ResourceKind::Entity);
    assert_eq!(entities.created, 1);
    assert_eq!(entities.skipped, 2);
    assert!(outcome.errors.is_empty());
    assert_eq!(target.count(Op::Create, ResourceKind::Entity), 1);
}

#[tokio::test]
async fn test_configured_protected_schema_is_skipped() {
    let desired = Snapshot::new()
        .with(ResourceKind::Blueprint, vec![schema("svc", &[])])
        .with(
            ResourceKind::Entity,
            vec![res(json!({"blueprint": "svc", "identifier": "api"}))],
        );
    let target = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::new(
        target.clone(),
        EngineConfig::default().with_protected_schema("svc"),
    );

    let outcome = engine.import(&desired, &SyncOptions::default()).await.unwrap();
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 1);
    assert_eq!(outcome.counts(ResourceKind::Entity).skipped, 1);
    assert_eq!(target.count(Op::Create, ResourceKind::Entity), 0);
}

#[tokio::test]
async fn test_skip_records_leaves_entities_alone() {
    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let options = SyncOptions::default().with_skip_records(true);
    let outcome = engine(&target).import(&catalog(), &options).await.unwrap();

    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 4);
    assert_eq!(outcome.counts(ResourceKind::Entity).created, 0);
    assert_eq!(target.count(Op::List, ResourceKind::Entity), 0);
    assert_eq!(target.count(Op::Create, ResourceKind::Entity), 0);
}

#[tokio::test]
async fn test_dangling_record_relation_is_reported() {
    let desired = Snapshot::new()
        .with(ResourceKind::Blueprint, vec![schema("svc", &[("owner", "svc")])])
        .with(
            ResourceKind::Entity,
            vec![res(json!({
                "blueprint": "svc",
                "identifier": "api",
                "relations": {"owner": "ghost"}
            }))],
        );
    let target = Arc::new(MemoryBackend::new());
    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.counts(ResourceKind::Entity).created, 1);
    assert_eq!(outcome.errors.len(), 1);
    let err = &outcome.errors[0];
    assert_eq!(err.category(), ErrorCategory::Dependency);
    assert_eq!(err.kind(), ResourceKind::Entity);
    assert_eq!(err.resource_id(), "svc:api");

    let collector = outcome.error_collector();
    assert_eq!(collector.by_kind(ResourceKind::Entity).len(), 1);
    assert_eq!(collector.count_by_category(ErrorCategory::Dependency), 1);
    assert!(collector.retryable().iter().all(|e| e.kind() == ResourceKind::Entity));
}

#[tokio::test]
async fn test_deferred_patch_with_missing_target_is_reported() {
    let desired = Snapshot::new().with(ResourceKind::Blueprint, vec![schema("x", &[("g", "ghost")])]);
    let target = Arc::new(MemoryBackend::new());
    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].category(), ErrorCategory::Dependency);
    assert!(outcome.errors[0].message().contains("missing dependencies: ghost"));
    assert_eq!(target.count(Op::Update, ResourceKind::Blueprint), 0);
    assert_eq!(target.count(Op::Get, ResourceKind::Blueprint), 1);
    assert_eq!(target.calls().iter().filter(|c| c.target == "ghost").count(), 1);
}

#[tokio::test]
async fn test_system_schemas_are_only_updated() {
    let desired = Snapshot::new().with(
        ResourceKind::Blueprint,
        vec![
            res(json!({"identifier": "_user", "title": "Users", "schema": {"properties": {}}})),
            res(json!({"identifier": "_custom", "title": "Custom"})),
        ],
    );
    let target = Arc::new(MemoryBackend::with_builtin_schemas());
    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();

    let counts = outcome.counts(ResourceKind::Blueprint);
    assert_eq!(counts.updated, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.created, 0);
    assert_eq!(outcome.errors[0].category(), ErrorCategory::NotFound);
    assert_eq!(target.count(Op::Create, ResourceKind::Blueprint), 0);
}

#[tokio::test]
async fn test_integrations_are_never_created() {
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(
        ResourceKind::Integration,
        vec![res(json!({"installationId": "gh", "config": {"a": 1}}))],
    ));
    let desired = Snapshot::new().with(
        ResourceKind::Integration,
        vec![
            res(json!({"installationId": "gh", "config": {"a": 2}})),
            res(json!({"installationId": "new", "config": {}})),
        ],
    );

    let outcome = engine(&target)
        .import(&desired, &SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.counts(ResourceKind::Integration).updated, 1);
    assert_eq!(target.count(Op::Create, ResourceKind::Integration), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_record_concurrency_ceiling() {
    let entities = (0..30)
        .map(|i| res(json!({"blueprint": "svc", "identifier": format!("e{}", i)})))
        .collect();
    let desired = Snapshot::new()
        .with(ResourceKind::Blueprint, vec![schema("svc", &[])])
        .with(ResourceKind::Entity, entities);

    let target = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(5)));
    let engine = SyncEngine::new(
        target.clone(),
        EngineConfig::default().with_record_concurrency(4),
    );
    let outcome = engine.import(&desired, &SyncOptions::default()).await.unwrap();

    assert_eq!(outcome.counts(ResourceKind::Entity).created, 30);
    assert!(target.peak_in_flight() <= 4, "peak {}", target.peak_in_flight());
}

#[tokio::test]
async fn test_cancelled_run_aborts() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let target = Arc::new(MemoryBackend::new());
    target.seed(&Snapshot::new().with(ResourceKind::Blueprint, vec![schema("a", &[])]));

    let err = engine(&target)
        .with_cancellation(cancel)
        .import(&catalog(), &SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(target.count(Op::Create, ResourceKind::Blueprint), 0);
}

#[tokio::test]
async fn test_migrate_between_backends() {
    let source = Arc::new(MemoryBackend::from_snapshot(&catalog()));
    let target = Arc::new(MemoryBackend::with_builtin_schemas());

    let outcome = engine(&target)
        .migrate(source, &SyncOptions::default())
        .await
        .unwrap();
    assert!(outcome.errors.is_empty(), "{}", outcome.error_summary(5));
    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 4);
    assert_eq!(outcome.counts(ResourceKind::Entity).created, 2);
    assert_eq!(outcome.counts(ResourceKind::Team).created, 1);
}

#[tokio::test]
async fn test_migrate_selection_pulls_dependencies() {
    let source = Arc::new(MemoryBackend::from_snapshot(&catalog()));
    let target = Arc::new(MemoryBackend::new());

    let options = SyncOptions::default().with_blueprints(["b"]);
    let outcome = engine(&target).migrate(source, &options).await.unwrap();

    assert_eq!(outcome.counts(ResourceKind::Blueprint).created, 2);
    assert_eq!(outcome.counts(ResourceKind::Entity).created, 2);
    let ids: Vec<String> = target
        .snapshot()
        .blueprints
        .iter()
        .map(|s| s.identifier().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_export_returns_target_state() {
    let target = Arc::new(MemoryBackend::from_snapshot(&catalog()));
    let exported = engine(&target).export(&SyncOptions::default()).await.unwrap();

    assert_eq!(exported.blueprints.len(), 4);
    assert_eq!(exported.entities.len(), 2);
    assert_eq!(exported.teams.len(), 1);
}
