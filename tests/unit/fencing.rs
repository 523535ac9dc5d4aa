//! Unit tests for fencing through the cluster store

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use pgcluster_operator::controller::{Error, ReconcileContext, fence_off, fence_on};
use pgcluster_operator::crd::{FENCED_INSTANCES_ANNOTATION, FencingSet};

use crate::common::*;

fn setup(instances: u32) -> (InMemoryStore, ReconcileContext) {
    let store = InMemoryStore::new();
    store.insert_cluster(create_test_cluster("c", TEST_NAMESPACE, instances));
    let ctx = ReconcileContext::new(
        Arc::new(store.clone()),
        TEST_NAMESPACE,
        Duration::from_secs(5),
    );
    (store, ctx)
}

fn annotation(store: &InMemoryStore) -> Option<String> {
    store
        .cluster(TEST_NAMESPACE, "c")
        .unwrap()
        .metadata
        .annotations
        .and_then(|a| a.get(FENCED_INSTANCES_ANNOTATION).cloned())
}

fn named(names: &[&str]) -> FencingSet {
    FencingSet::Instances(names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>())
}

#[tokio::test]
async fn test_fence_single_instance() {
    let (store, ctx) = setup(3);

    let set = fence_on(&ctx, "c", "c-2").await.unwrap();

    assert_eq!(set, named(&["c-2"]));
    assert_eq!(annotation(&store).as_deref(), Some(r#"["c-2"]"#));
}

#[tokio::test]
async fn test_fence_all_uses_wildcard() {
    let (store, ctx) = setup(2);

    let set = fence_on(&ctx, "c", "*").await.unwrap();

    assert!(set.is_all());
    assert_eq!(annotation(&store).as_deref(), Some(r#"["*"]"#));
    let cluster = store.cluster(TEST_NAMESPACE, "c").unwrap();
    assert!(cluster.is_instance_fenced("c-1"));
    assert!(cluster.is_instance_fenced("c-2"));

    // Instances added later are covered too
    store.modify_cluster(TEST_NAMESPACE, "c", |c| {
        c.status.as_mut().unwrap().instance_names.push("c-3".to_string());
    });
    assert!(store.cluster(TEST_NAMESPACE, "c").unwrap().is_instance_fenced("c-3"));
}

#[tokio::test]
async fn test_fence_unknown_instance_is_rejected() {
    let (store, ctx) = setup(2);

    let err = fence_on(&ctx, "c", "c-9").await.unwrap_err();

    assert!(matches!(err, Error::InvalidInstance { .. }));
    assert!(err.to_string().contains("c-9 is not a known instance"));
    assert_eq!(store.writes().cluster_updates, 0);
    assert_eq!(annotation(&store), None);
}

#[tokio::test]
async fn test_fence_is_idempotent() {
    let (store, ctx) = setup(2);

    fence_on(&ctx, "c", "c-1").await.unwrap();
    fence_on(&ctx, "c", "c-1").await.unwrap();

    assert_eq!(store.writes().cluster_updates, 1);
}

#[tokio::test]
async fn test_unfence_last_instance_removes_annotation() {
    let (store, ctx) = setup(2);
    fence_on(&ctx, "c", "c-1").await.unwrap();

    let set = fence_off(&ctx, "c", "c-1").await.unwrap();

    assert!(set.is_empty());
    assert_eq!(annotation(&store), None);
}

#[tokio::test]
async fn test_unfence_wildcard_clears_everything() {
    let (store, ctx) = setup(3);
    fence_on(&ctx, "c", "c-1").await.unwrap();
    fence_on(&ctx, "c", "c-3").await.unwrap();

    let set = fence_off(&ctx, "c", "*").await.unwrap();

    assert!(set.is_empty());
    assert_eq!(annotation(&store), None);
}

#[tokio::test]
async fn test_unfence_one_while_all_fenced_is_rejected() {
    let (_store, ctx) = setup(2);
    fence_on(&ctx, "c", "*").await.unwrap();

    let err = fence_off(&ctx, "c", "c-1").await.unwrap_err();

    assert!(matches!(err, Error::InvalidInstance { .. }));
}

#[tokio::test]
async fn test_unfence_departed_instance_still_listed() {
    let store = InMemoryStore::new();
    store.insert_cluster(
        PostgresClusterBuilder::new("c", TEST_NAMESPACE)
            .with_instances(1)
            .with_fencing_annotation(r#"["c-4"]"#)
            .build(),
    );
    let ctx = ReconcileContext::new(
        Arc::new(store.clone()),
        TEST_NAMESPACE,
        Duration::from_secs(5),
    );

    let set = fence_off(&ctx, "c", "c-4").await.unwrap();

    assert!(set.is_empty());
}

#[tokio::test]
async fn test_malformed_annotation_rejects_mutation() {
    let store = InMemoryStore::new();
    store.insert_cluster(
        PostgresClusterBuilder::new("c", TEST_NAMESPACE)
            .with_instances(2)
            .with_fencing_annotation("not-json")
            .build(),
    );
    let ctx = ReconcileContext::new(
        Arc::new(store.clone()),
        TEST_NAMESPACE,
        Duration::from_secs(5),
    );

    let cluster = store.cluster(TEST_NAMESPACE, "c").unwrap();
    assert!(!cluster.is_instance_fenced("c-1"));

    let err = fence_on(&ctx, "c", "c-1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn test_missing_cluster_is_not_found() {
    let (_store, ctx) = setup(1);

    let err = fence_on(&ctx, "other", "other-1").await.unwrap_err();

    assert!(err.is_not_found());
}

/// Two operators fencing different instances at the same time must both win
#[tokio::test]
async fn test_concurrent_fencing_merges_after_conflict() {
    let (store, ctx) = setup(2);
    store.interleave_cluster_write(|cluster| {
        cluster
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(FENCED_INSTANCES_ANNOTATION.to_string(), r#"["c-1"]"#.to_string());
    });

    let set = fence_on(&ctx, "c", "c-2").await.unwrap();

    assert_eq!(set, named(&["c-1", "c-2"]));
    assert_eq!(annotation(&store).as_deref(), Some(r#"["c-1","c-2"]"#));
}

#[tokio::test]
async fn test_persistent_conflict_is_surfaced() {
    let (store, ctx) = setup(2);
    let ctx = ctx.with_retry(pgcluster_operator::controller::RetryConfig::with_max_attempts(2));
    for _ in 0..2 {
        store.interleave_cluster_write(|_| {});
    }

    let err = fence_on(&ctx, "c", "c-1").await.unwrap_err();

    assert!(err.is_conflict());
}
