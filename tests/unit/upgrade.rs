//! Unit tests for the major upgrade flow against an in-memory store

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use pgcluster_operator::controller::major_upgrade::{
    UpgradeEvent, UpgradeStateMachine, UpgradeTransitionResult, get_target_image_from_major_upgrade_job,
    major_upgrade_job_name, reconcile_major_upgrade,
};
use pgcluster_operator::controller::ReconcileContext;
use pgcluster_operator::crd::{MajorUpgradeStatus, PostgresCluster, UpgradePhase};

use crate::common::*;

fn ctx(store: &InMemoryStore) -> ReconcileContext {
    ReconcileContext::new(
        Arc::new(store.clone()),
        TEST_NAMESPACE,
        Duration::from_secs(5),
    )
}

fn upgrading_cluster() -> PostgresCluster {
    PostgresClusterBuilder::new("c", TEST_NAMESPACE)
        .with_instances(3)
        .with_primary("c-2")
        .upgrading_from(OLD_IMAGE)
        .build()
}

/// Feed the recorded attempt back into the cluster, as the status write would
fn record(cluster: &mut PostgresCluster, status: Option<MajorUpgradeStatus>) {
    cluster.status.as_mut().unwrap().major_upgrade = status;
}

mod state_machine_tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let machine = UpgradeStateMachine::new();
        let phase = machine.advance("c", UpgradePhase::NotStarted, UpgradeEvent::JobCreated);
        assert_eq!(phase, UpgradePhase::JobCreated);
        let phase = machine.advance("c", phase, UpgradeEvent::JobSucceeded);
        assert_eq!(phase, UpgradePhase::Succeeded);
    }

    #[test]
    fn test_terminal_phases_do_not_move() {
        let machine = UpgradeStateMachine::new();
        for terminal in [UpgradePhase::Succeeded, UpgradePhase::Failed] {
            for event in [
                UpgradeEvent::JobCreated,
                UpgradeEvent::JobSucceeded,
                UpgradeEvent::JobFailed,
            ] {
                assert!(!machine.can_transition(terminal, event));
                assert_eq!(machine.advance("c", terminal, event), terminal);
            }
        }
    }

    #[test]
    fn test_completion_requires_a_job() {
        let machine = UpgradeStateMachine::new();
        assert!(matches!(
            machine.transition(UpgradePhase::NotStarted, UpgradeEvent::JobSucceeded),
            UpgradeTransitionResult::InvalidTransition { .. }
        ));
    }
}

mod reconcile_tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_job_on_primary_volume() {
        let store = InMemoryStore::new();
        let cluster = upgrading_cluster();

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(outcome.job_created);
        assert!(!outcome.completed);
        let status = outcome.status.unwrap();
        assert_eq!(status.phase, UpgradePhase::JobCreated);
        assert_eq!(status.job_name.as_deref(), Some("c-2-major-upgrade"));
        assert_eq!(status.target_image.as_deref(), Some(NEW_IMAGE));

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name_any(), major_upgrade_job_name("c", 2));
        assert_eq!(get_target_image_from_major_upgrade_job(&jobs[0]), Some(NEW_IMAGE));
    }

    #[tokio::test]
    async fn test_running_job_is_not_recreated() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);
        let second = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(!second.job_created);
        assert_eq!(second.status.unwrap().phase, UpgradePhase::JobCreated);
        assert_eq!(store.writes().jobs_created, 1);
    }

    #[tokio::test]
    async fn test_completed_job_finishes_attempt() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);
        let job = store.jobs().remove(0);
        store.put_job(finish_job(job, "Complete"));

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(outcome.completed);
        assert_eq!(outcome.status.unwrap().phase, UpgradePhase::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_job_stays_failed() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);
        let job = store.jobs().remove(0);
        store.put_job(finish_job(job, "Failed"));

        let failed = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        assert!(!failed.completed);
        assert_eq!(failed.status.as_ref().unwrap().phase, UpgradePhase::Failed);

        // A failed attempt is not retried behind the user's back
        record(&mut cluster, failed.status);
        let again = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        assert_eq!(again.status.unwrap().phase, UpgradePhase::Failed);
        assert_eq!(store.writes().jobs_created, 1);
    }

    #[tokio::test]
    async fn test_running_job_for_other_image_is_kept() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);

        // Retargeted while the first job is still migrating the data directory
        cluster.spec.image_name = "ghcr.io/cloudnative-pg/postgresql:18".to_string();
        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(outcome.superseded);
        assert!(!outcome.job_created);
        let status = outcome.status.unwrap();
        assert_eq!(status.phase, UpgradePhase::JobCreated);
        assert_eq!(status.target_image.as_deref(), Some(NEW_IMAGE));
        assert_eq!(store.writes().jobs_deleted, 0);
        assert_eq!(store.writes().jobs_created, 1);
        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(get_target_image_from_major_upgrade_job(&jobs[0]), Some(NEW_IMAGE));
    }

    #[tokio::test]
    async fn test_finished_job_for_other_image_is_replaced() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);
        let job = store.jobs().remove(0);
        store.put_job(finish_job(job, "Failed"));

        let retargeted = "ghcr.io/cloudnative-pg/postgresql:18";
        cluster.spec.image_name = retargeted.to_string();
        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(outcome.job_created);
        assert!(!outcome.superseded);
        assert_eq!(store.writes().jobs_deleted, 1);
        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(get_target_image_from_major_upgrade_job(&jobs[0]), Some(retargeted));
        assert_eq!(outcome.status.unwrap().phase, UpgradePhase::JobCreated);
    }

    #[tokio::test]
    async fn test_waits_for_primary() {
        let store = InMemoryStore::new();
        let cluster = PostgresClusterBuilder::new("c", TEST_NAMESPACE)
            .with_instances(2)
            .without_primary()
            .upgrading_from(OLD_IMAGE)
            .build();

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert!(!outcome.job_created);
        assert_eq!(outcome.status.unwrap().phase, UpgradePhase::NotStarted);
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_finished_attempt_is_cleaned_up() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        record(&mut cluster, first.status);
        let job = store.jobs().remove(0);
        store.put_job(finish_job(job, "Complete"));
        // Source image cleared once the upgrade went through
        cluster.status.as_mut().unwrap().major_version_upgrade_from_image = None;

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert_eq!(outcome, Default::default());
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_running_job_survives_cleared_upgrade() {
        let store = InMemoryStore::new();
        let mut cluster = upgrading_cluster();

        let first = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();
        let recorded = first.status.clone();
        record(&mut cluster, first.status);
        cluster.status.as_mut().unwrap().major_version_upgrade_from_image = None;

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert_eq!(outcome.status, recorded);
        assert_eq!(store.writes().jobs_deleted, 0);
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_no_pending_upgrade_is_a_no_op() {
        let store = InMemoryStore::new();
        let cluster = create_test_cluster("c", TEST_NAMESPACE, 2);

        let outcome = reconcile_major_upgrade(&ctx(&store), &cluster).await.unwrap();

        assert_eq!(outcome, Default::default());
        assert_eq!(store.writes(), WriteCounts::default());
    }
}
