//! Unit tests for managed role synchronization against an in-memory catalog

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pgcluster_operator::controller::roles::{DatabaseRole, RoleSyncPolicy, RoleSyncReport, sync_roles};
use pgcluster_operator::controller::{Error, ReconcileContext};
use pgcluster_operator::crd::{EnsureOption, PasswordState, RoleConfiguration};

use crate::common::*;

fn ctx() -> ReconcileContext {
    ReconcileContext::new(
        Arc::new(InMemoryStore::new()),
        TEST_NAMESPACE,
        Duration::from_secs(5),
    )
}

async fn sync(
    catalog: &FakeCatalog,
    secrets: &StaticSecrets,
    desired: &[RoleConfiguration],
    stored: &BTreeMap<String, PasswordState>,
) -> RoleSyncReport {
    sync_roles(
        &ctx(),
        catalog,
        secrets,
        desired,
        stored,
        RoleSyncPolicy::default(),
    )
    .await
    .unwrap()
}

fn live(name: &str) -> DatabaseRole {
    DatabaseRole::from_configuration(&RoleConfiguration::new(name))
}

mod password_tests {
    use super::*;

    #[tokio::test]
    async fn test_no_secret_leaves_password_alone() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();

        let report = sync(&catalog, &secrets, &[RoleConfiguration::new("app")], &BTreeMap::new()).await;

        assert_eq!(report.created, vec!["app".to_string()]);
        assert!(report.passwords_rotated.is_empty());
        assert_eq!(catalog.password("app"), None);
        assert!(!report.password_states.contains_key("app"));
    }

    #[tokio::test]
    async fn test_disabled_password_is_nulled_once() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        let desired = [role_without_password("app")];

        let first = sync(&catalog, &secrets, &desired, &BTreeMap::new()).await;
        assert_eq!(catalog.password("app"), Some(None));
        let state = first.password_states.get("app").unwrap().clone();
        assert_eq!(state.resource_version, "");

        catalog.clear_statements();
        let second = sync(&catalog, &secrets, &desired, &first.password_states).await;
        assert!(catalog.statements().is_empty());
        assert_eq!(second.password_states.get("app"), Some(&state));
    }

    #[tokio::test]
    async fn test_secret_and_disabled_conflict_before_writes() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        let mut conflicting = role_with_secret("app", "app-secret");
        conflicting.disable_password = true;

        let err = sync_roles(
            &ctx(),
            &catalog,
            &secrets,
            &[RoleConfiguration::new("first"), conflicting],
            &BTreeMap::new(),
            RoleSyncPolicy::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ConfigurationConflict { ref role, .. } if role == "app"));
        assert!(err.to_string().contains("password both provided and disabled"));
        assert!(catalog.statements().is_empty());
    }

    #[tokio::test]
    async fn test_secret_applied_and_rotated_on_new_version() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        secrets.put("app-secret", "app", "first", "10");
        let desired = [role_with_secret("app", "app-secret")];

        let first = sync(&catalog, &secrets, &desired, &BTreeMap::new()).await;
        assert_eq!(catalog.password("app"), Some(Some("first".to_string())));
        assert_eq!(first.passwords_rotated, vec!["app".to_string()]);

        // Unchanged secret: nothing to do
        catalog.clear_statements();
        let second = sync(&catalog, &secrets, &desired, &first.password_states).await;
        assert!(catalog.statements().is_empty());
        assert!(!second.wrote());

        secrets.put("app-secret", "app", "second", "11");
        let third = sync(&catalog, &secrets, &desired, &second.password_states).await;
        assert_eq!(catalog.password("app"), Some(Some("second".to_string())));
        assert_eq!(
            third.password_states.get("app").unwrap().resource_version,
            "11"
        );
    }

    #[tokio::test]
    async fn test_out_of_band_row_change_reapplies_password() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        secrets.put("app-secret", "app", "pw", "10");
        let desired = [role_with_secret("app", "app-secret")];

        let first = sync(&catalog, &secrets, &desired, &BTreeMap::new()).await;

        // Someone rewrote the row, so its transaction id moved on
        let mut row = catalog.role("app").unwrap();
        row.transaction_id = 0;
        catalog.seed(row);

        catalog.clear_statements();
        sync(&catalog, &secrets, &desired, &first.password_states).await;
        assert_eq!(catalog.statements(), vec!["password app".to_string()]);
    }

    #[tokio::test]
    async fn test_alter_keeps_password_state_current() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        secrets.put("app-secret", "app", "pw", "10");
        let mut desired = role_with_secret("app", "app-secret");

        let first = sync(&catalog, &secrets, &[desired.clone()], &BTreeMap::new()).await;

        desired.connection_limit = 20;
        catalog.clear_statements();
        let second = sync(&catalog, &secrets, &[desired.clone()], &first.password_states).await;
        assert_eq!(catalog.statements(), vec!["alter app".to_string()]);
        let state = second.password_states.get("app").unwrap();
        assert_eq!(state.transaction_id, catalog.role("app").unwrap().transaction_id);

        // The recorded id matches the altered row, so the next pass is quiet
        catalog.clear_statements();
        sync(&catalog, &secrets, &[desired], &second.password_states).await;
        assert!(catalog.statements().is_empty());
    }

    #[tokio::test]
    async fn test_secret_for_another_user_fails_role() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();
        secrets.put("app-secret", "someone-else", "pw", "1");

        let report = sync(
            &catalog,
            &secrets,
            &[role_with_secret("app", "app-secret")],
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].role, "app");
        assert_eq!(report.failures[0].operation, "password");
    }

    #[tokio::test]
    async fn test_missing_secret_keeps_previous_state() {
        let catalog = FakeCatalog::new();
        catalog.seed(live("app"));
        let secrets = StaticSecrets::new();
        let stored = BTreeMap::from([(
            "app".to_string(),
            PasswordState {
                transaction_id: 1,
                resource_version: "3".to_string(),
            },
        )]);

        let report = sync(
            &catalog,
            &secrets,
            &[role_with_secret("app", "gone")],
            &stored,
        )
        .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.password_states.get("app"), stored.get("app"));
    }
}

mod catalog_tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_and_comment_applied_after_create() {
        let catalog = FakeCatalog::new();
        catalog.seed(live("readers"));
        let secrets = StaticSecrets::new();
        let mut config = RoleConfiguration::new("app");
        config.comment = "application role".to_string();
        config.in_roles = vec!["readers".to_string()];

        let report = sync(&catalog, &secrets, &[config.clone()], &BTreeMap::new()).await;

        assert_eq!(
            catalog.statements(),
            vec![
                "create app".to_string(),
                "membership app".to_string(),
                "comment app".to_string(),
            ]
        );
        let row = catalog.role("app").unwrap();
        assert_eq!(row.in_roles, vec!["readers".to_string()]);
        assert_eq!(row.comment, "application role");
        assert_eq!(report.unmanaged, vec!["readers".to_string()]);

        catalog.clear_statements();
        sync(&catalog, &secrets, &[config, RoleConfiguration::new("readers")], &BTreeMap::new()).await;
        assert!(catalog.statements().is_empty());
    }

    #[tokio::test]
    async fn test_membership_change_counts_as_alter() {
        let catalog = FakeCatalog::new();
        let mut current = live("app");
        current.in_roles = vec!["old".to_string()];
        catalog.seed(current);
        let secrets = StaticSecrets::new();
        let mut config = RoleConfiguration::new("app");
        config.in_roles = vec!["new".to_string()];

        let report = sync(&catalog, &secrets, &[config], &BTreeMap::new()).await;

        assert_eq!(report.altered, vec!["app".to_string()]);
        assert_eq!(catalog.role("app").unwrap().in_roles, vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_absent_role_is_dropped() {
        let catalog = FakeCatalog::new();
        catalog.seed(live("legacy"));
        let secrets = StaticSecrets::new();
        let mut config = RoleConfiguration::new("legacy");
        config.ensure = EnsureOption::Absent;

        let report = sync(&catalog, &secrets, &[config.clone()], &BTreeMap::new()).await;
        assert_eq!(report.dropped, vec!["legacy".to_string()]);
        assert!(catalog.role("legacy").is_none());

        // Already gone: nothing more to do
        catalog.clear_statements();
        let report = sync(&catalog, &secrets, &[config], &BTreeMap::new()).await;
        assert!(report.dropped.is_empty());
        assert!(catalog.statements().is_empty());
    }

    #[tokio::test]
    async fn test_absent_role_with_stale_password_settings_is_dropped() {
        let catalog = FakeCatalog::new();
        catalog.seed(live("legacy"));
        let secrets = StaticSecrets::new();
        let mut config = role_with_secret("legacy", "legacy-secret");
        config.disable_password = true;
        config.ensure = EnsureOption::Absent;

        let report = sync(
            &catalog,
            &secrets,
            &[config, RoleConfiguration::new("app")],
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(report.dropped, vec!["legacy".to_string()]);
        assert_eq!(report.created, vec!["app".to_string()]);
        assert!(catalog.role("legacy").is_none());
    }

    #[tokio::test]
    async fn test_reserved_and_duplicate_roles_fail_validation() {
        let catalog = FakeCatalog::new();
        let secrets = StaticSecrets::new();

        let report = sync(
            &catalog,
            &secrets,
            &[
                RoleConfiguration::new("postgres"),
                RoleConfiguration::new("app"),
                RoleConfiguration::new("app"),
            ],
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(report.created, vec!["app".to_string()]);
        let failed: Vec<_> = report.failures.iter().map(|f| f.role.as_str()).collect();
        assert_eq!(failed, vec!["postgres", "app"]);
        assert!(report.failures.iter().all(|f| f.operation == "validate"));
    }

    #[tokio::test]
    async fn test_failed_step_stops_only_that_role() {
        let catalog = FakeCatalog::new();
        catalog.fail_on("create", "broken");
        let secrets = StaticSecrets::new();

        let report = sync(
            &catalog,
            &secrets,
            &[RoleConfiguration::new("broken"), RoleConfiguration::new("fine")],
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(report.reconciled, vec!["fine".to_string()]);
        assert_eq!(
            report.failures_by_role().get("broken").unwrap()[0],
            "create: SQL error: permission denied to create role broken"
        );
        assert!(matches!(report.partial_failure(), Some(Error::PartialFailure(_))));
    }

    #[tokio::test]
    async fn test_unmanaged_roles_reported_not_dropped() {
        let catalog = FakeCatalog::new();
        catalog.seed(live("legacy"));
        catalog.seed(live("postgres"));
        catalog.seed(live("pg_monitor"));
        let secrets = StaticSecrets::new();

        let report = sync(&catalog, &secrets, &[], &BTreeMap::new()).await;

        assert_eq!(report.unmanaged, vec!["legacy".to_string()]);
        assert!(catalog.role("legacy").is_some());
    }
}
