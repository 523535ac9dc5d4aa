//! Unit tests for status management

use std::sync::Arc;
use std::time::Duration;

use pgcluster_operator::controller::status::{
    ConditionBuilder, StatusManager, apply_phase, condition_status, condition_types, spec_changed,
};
use pgcluster_operator::controller::ReconcileContext;
use pgcluster_operator::crd::{ClusterPhase, Condition, PostgresCluster, PostgresClusterStatus};

use crate::common::*;

/// Helper to create a test cluster with optional status
fn create_test_cluster_with_status(
    name: &str,
    generation: i64,
    status: Option<PostgresClusterStatus>,
) -> PostgresCluster {
    let mut cluster = PostgresClusterBuilder::new(name, TEST_NAMESPACE)
        .with_generation(generation)
        .build();
    cluster.status = status;
    cluster
}

fn condition<'a>(conditions: &'a [Condition], type_: &str) -> &'a Condition {
    conditions.iter().find(|c| c.type_ == type_).unwrap()
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_new_condition_builder() {
        let builder = ConditionBuilder::new(Some(1));
        let conditions = builder.build();
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_set_condition_adds_new() {
        let conditions = ConditionBuilder::new(Some(1))
            .set_condition("TestCondition", "True", "TestReason", "Test message")
            .build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "TestCondition");
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason, "TestReason");
        assert_eq!(conditions[0].message, "Test message");
        assert_eq!(conditions[0].observed_generation, Some(1));
    }

    #[test]
    fn test_set_condition_updates_existing_same_status() {
        let existing = vec![Condition {
            type_: "TestCondition".to_string(),
            status: "True".to_string(),
            reason: "OldReason".to_string(),
            message: "Old message".to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            observed_generation: Some(1),
        }];

        let conditions = ConditionBuilder::from_existing(existing, Some(2))
            .set_condition("TestCondition", "True", "NewReason", "New message")
            .build();

        assert_eq!(conditions.len(), 1);
        // Status same, so transition time should NOT change
        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, "NewReason");
        assert_eq!(conditions[0].message, "New message");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_set_condition_updates_existing_different_status() {
        let existing = vec![Condition {
            type_: "TestCondition".to_string(),
            status: "True".to_string(),
            reason: "OldReason".to_string(),
            message: "Old message".to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            observed_generation: Some(1),
        }];

        let conditions = ConditionBuilder::from_existing(existing, Some(2))
            .set_condition("TestCondition", "False", "NewReason", "New message")
            .build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        // Status changed, so transition time SHOULD change
        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_remove_condition() {
        let conditions = ConditionBuilder::new(Some(1))
            .ready(true, "Ready", "Ready")
            .degraded(false, "Healthy", "Healthy")
            .remove_condition(condition_types::DEGRADED)
            .build();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, condition_types::READY);
    }

    #[test]
    fn test_roles_reconciled_helper() {
        let conditions = ConditionBuilder::new(Some(1))
            .roles_reconciled(false, "RoleSyncFailed", "1 role failed")
            .build();

        assert_eq!(conditions[0].type_, condition_types::ROLES_RECONCILED);
        assert_eq!(conditions[0].status, condition_status::FALSE);
    }

    #[test]
    fn test_multiple_conditions() {
        let conditions = ConditionBuilder::new(Some(1))
            .ready(true, "Ready", "Ready")
            .progressing(false, "Stable", "Stable")
            .degraded(false, "Healthy", "Healthy")
            .build();

        assert_eq!(conditions.len(), 3);
    }

    #[test]
    fn test_condition_status_constants() {
        assert_eq!(condition_status::TRUE, "True");
        assert_eq!(condition_status::FALSE, "False");
        assert_eq!(condition_status::UNKNOWN, "Unknown");
    }
}

mod apply_phase_tests {
    use super::*;

    #[test]
    fn test_running_sets_ready() {
        let mut status = PostgresClusterStatus::default();
        apply_phase(&mut status, Some(3), ClusterPhase::Running, "ClusterReady", "ok");

        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(status.observed_generation, Some(3));
        let ready = condition(&status.conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::TRUE);
        assert_eq!(ready.reason, "ClusterReady");
        let degraded = condition(&status.conditions, condition_types::DEGRADED);
        assert_eq!(degraded.status, condition_status::FALSE);
    }

    #[test]
    fn test_failed_carries_reason_and_message() {
        let mut status = PostgresClusterStatus::default();
        apply_phase(
            &mut status,
            Some(1),
            ClusterPhase::Failed,
            "PartialFailure",
            "1 role operation(s) failed",
        );

        let ready = condition(&status.conditions, condition_types::READY);
        assert_eq!(ready.status, condition_status::FALSE);
        let degraded = condition(&status.conditions, condition_types::DEGRADED);
        assert_eq!(degraded.status, condition_status::TRUE);
        assert_eq!(degraded.reason, "PartialFailure");
        assert_eq!(degraded.message, "1 role operation(s) failed");
    }

    #[test]
    fn test_upgrading_is_progressing() {
        let mut status = PostgresClusterStatus::default();
        apply_phase(
            &mut status,
            Some(1),
            ClusterPhase::UpgradingMajorVersion,
            "MajorUpgradeInProgress",
            "upgrading",
        );

        let progressing = condition(&status.conditions, condition_types::PROGRESSING);
        assert_eq!(progressing.status, condition_status::TRUE);
    }

    #[test]
    fn test_reapplying_same_phase_is_stable() {
        let mut status = PostgresClusterStatus::default();
        apply_phase(&mut status, Some(1), ClusterPhase::Running, "ClusterReady", "ok");
        let first = status.clone();
        apply_phase(&mut status, Some(1), ClusterPhase::Running, "ClusterReady", "ok");
        assert_eq!(status, first);
    }
}

mod spec_changed_tests {
    use super::*;

    #[test]
    fn test_spec_changed_no_status() {
        let cluster = create_test_cluster_with_status("test", 1, None);
        // No status means never observed, needs reconciliation
        assert!(spec_changed(&cluster));
    }

    #[test]
    fn test_spec_changed_no_observed_generation() {
        let status = PostgresClusterStatus {
            observed_generation: None,
            ..Default::default()
        };
        let cluster = create_test_cluster_with_status("test", 1, Some(status));
        assert!(spec_changed(&cluster));
    }

    #[test]
    fn test_spec_changed_generations_match() {
        let status = PostgresClusterStatus {
            observed_generation: Some(5),
            ..Default::default()
        };
        let cluster = create_test_cluster_with_status("test", 5, Some(status));
        assert!(!spec_changed(&cluster));
    }

    #[test]
    fn test_spec_changed_generation_increased() {
        let status = PostgresClusterStatus {
            observed_generation: Some(5),
            ..Default::default()
        };
        let cluster = create_test_cluster_with_status("test", 6, Some(status));
        assert!(spec_changed(&cluster));
    }
}

mod status_manager_tests {
    use super::*;

    fn setup() -> (InMemoryStore, ReconcileContext, PostgresCluster) {
        let store = InMemoryStore::new();
        store.insert_cluster(create_test_cluster("c", TEST_NAMESPACE, 2));
        let ctx = ReconcileContext::new(
            Arc::new(store.clone()),
            TEST_NAMESPACE,
            Duration::from_secs(5),
        );
        let cluster = store.cluster(TEST_NAMESPACE, "c").unwrap();
        (store, ctx, cluster)
    }

    #[tokio::test]
    async fn test_update_writes_status() {
        let (store, ctx, cluster) = setup();

        StatusManager::new(&ctx, &cluster)
            .update(|status| {
                apply_phase(status, Some(1), ClusterPhase::Running, "ClusterReady", "ok")
            })
            .await
            .unwrap();

        let stored = store.cluster(TEST_NAMESPACE, "c").unwrap();
        assert_eq!(stored.phase(), ClusterPhase::Running);
        assert_eq!(store.writes().status_updates, 1);
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_written() {
        let (store, ctx, cluster) = setup();

        StatusManager::new(&ctx, &cluster)
            .update(|_| {})
            .await
            .unwrap();

        assert_eq!(store.writes().status_updates, 0);
    }

    #[tokio::test]
    async fn test_conflict_reapplies_on_fresh_copy() {
        let (store, ctx, cluster) = setup();
        store.interleave_cluster_write(|c| {
            c.status.as_mut().unwrap().current_primary = Some("c-2".to_string());
        });

        StatusManager::new(&ctx, &cluster)
            .update(|status| {
                apply_phase(status, Some(1), ClusterPhase::Running, "ClusterReady", "ok")
            })
            .await
            .unwrap();

        let stored = store.cluster(TEST_NAMESPACE, "c").unwrap();
        let status = stored.status.unwrap();
        // The concurrent change survives alongside ours
        assert_eq!(status.current_primary.as_deref(), Some("c-2"));
        assert_eq!(status.phase, ClusterPhase::Running);
        assert_eq!(store.writes().status_updates, 1);
    }
}
