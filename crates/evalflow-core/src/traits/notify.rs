//! Outbound collaborators: notification delivery and group membership sync.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DigestKind, EvalId, JobType, ReminderAudience};

/// Delivers lifecycle notifications. Each call returns the recipients reached.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_created(&self, eval_id: EvalId, include_owner: bool) -> Result<Vec<String>>;

    async fn send_available(&self, eval_id: EvalId, include_evaluatees: bool)
    -> Result<Vec<String>>;

    async fn send_reminder(&self, eval_id: EvalId, audience: ReminderAudience)
    -> Result<Vec<String>>;

    /// `job_type` is one of the viewable job types.
    async fn send_results(
        &self,
        eval_id: EvalId,
        include_evaluatees: bool,
        include_admins: bool,
        job_type: JobType,
    ) -> Result<Vec<String>>;

    /// One consolidated message per participant covering all `eval_ids`.
    async fn send_digest(&self, kind: DigestKind, eval_ids: &[EvalId]) -> Result<Vec<String>>;
}

/// Pushes evaluation group membership to the external roster system.
#[async_trait]
pub trait GroupMembershipSyncer: Send + Sync {
    /// `group_id == None` syncs every group assigned to the evaluation.
    async fn sync(&self, eval_id: EvalId, group_id: Option<&str>) -> Result<()>;
}
