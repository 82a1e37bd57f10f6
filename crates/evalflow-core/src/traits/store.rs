//! Store collaborators: evaluations, scheduled jobs and the lockable entity graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{EntityRef, EvalId, EvalState, Evaluation, JobId, JobType, ScheduledJob};

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn get_by_id(&self, id: EvalId) -> Result<Option<Evaluation>>;

    /// Persist an existing evaluation (id must be set).
    /// The lock flag belongs to [`LockGraph`] and is left as stored.
    async fn save(&self, eval: &Evaluation) -> Result<()>;

    /// Set `available_email_sent` without touching the rest of the row.
    /// `false` when no such evaluation exists.
    async fn mark_available_sent(&self, id: EvalId) -> Result<bool>;

    async fn exists(&self, id: EvalId) -> Result<bool>;

    /// Evaluations whose persisted state equals `state`.
    async fn list_in_state(&self, state: EvalState) -> Result<Vec<Evaluation>>;
}

/// Job store. Individual operations are atomic; sequences of them are not.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, run_at: DateTime<Utc>, eval_id: EvalId, job_type: JobType)
    -> Result<JobId>;

    /// Jobs of one type for one evaluation, ordered by ascending id.
    async fn find(&self, eval_id: EvalId, job_type: JobType) -> Result<Vec<ScheduledJob>>;

    /// `true` when this call removed the job.
    async fn delete(&self, job_id: JobId) -> Result<bool>;

    /// Jobs with `run_at <= now`, earliest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>>;
}

/// Containment graph of lockable entities
/// (evaluation → template → items → scale).
#[async_trait]
pub trait LockGraph: Send + Sync {
    /// `None` when no entity with that id exists.
    async fn is_locked(&self, entity: EntityRef) -> Result<Option<bool>>;

    async fn set_locked_flag(&self, entity: EntityRef, locked: bool) -> Result<()>;

    /// Entities directly contained by `entity`.
    async fn children(&self, entity: EntityRef) -> Result<Vec<EntityRef>>;

    /// Locked entities that directly contain `entity`.
    async fn locked_parents(&self, entity: EntityRef) -> Result<Vec<EntityRef>>;
}
