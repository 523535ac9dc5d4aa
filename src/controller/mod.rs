pub mod context;
pub mod error;
pub mod fencing;
pub mod finalizers;
pub mod major_upgrade;
pub mod reconciler;
pub mod retry;
pub mod roles;
pub mod status;

pub use context::{Context, ReconcileContext};
pub use error::{BackoffConfig, Error, Result, RoleFailure};
pub use fencing::{fence_off, fence_on, fenced_instance_count};
pub use finalizers::delete_dependent_finalizers;
pub use major_upgrade::{
    MAJOR_UPGRADE_JOB_ROLE, UpgradeEvent, UpgradeOutcome, UpgradeStateMachine,
    create_major_upgrade_job, get_target_image_from_major_upgrade_job, is_major_upgrade_job,
    job_phase, reconcile_major_upgrade,
};
pub use reconciler::{CLUSTER_FINALIZER, error_policy, reconcile};
pub use retry::{RetryConfig, retry_on_conflict};
pub use status::{ConditionBuilder, StatusManager, apply_phase, spec_changed};
