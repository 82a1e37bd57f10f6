//! Job coordinator — keeps each evaluation's scheduled jobs in step with its dates.
//!
//! Two entry points: [`JobCoordinator::on_evaluation_change`] when an administrator
//! creates, edits or deletes an evaluation, and [`JobCoordinator::on_job_fired`] when
//! the trigger engine delivers a due job. Both re-read the evaluation, repair its
//! stored state and then reconcile jobs with delete-then-create, so duplicate
//! delivery and racing edits converge on one job per type.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::settings::{self, SettingsProvider};
use evalflow_core::traits::{
    Clock, EvaluationStore, GroupMembershipSyncer, JobStore, LockGraph, NotificationSender,
};
use evalflow_core::types::{
    AuthControl, EntityRef, EvalAction, EvalId, EvalState, Evaluation, JobId, JobType,
    ReminderAudience, ResultsSharing,
};

use crate::cascade::LockCascade;
use crate::reminder::{self, ReminderPolicy};
use crate::state;

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub evaluations: Arc<dyn EvaluationStore>,
    pub jobs: Arc<dyn JobStore>,
    pub notifier: Arc<dyn NotificationSender>,
    pub settings: Arc<dyn SettingsProvider>,
    pub groups: Arc<dyn GroupMembershipSyncer>,
    pub lock_graph: Arc<dyn LockGraph>,
    pub clock: Arc<dyn Clock>,
}

pub struct JobCoordinator {
    evaluations: Arc<dyn EvaluationStore>,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn NotificationSender>,
    settings: Arc<dyn SettingsProvider>,
    groups: Arc<dyn GroupMembershipSyncer>,
    clock: Arc<dyn Clock>,
    cascade: LockCascade,
}

fn eval_id(eval: &Evaluation) -> Result<EvalId> {
    eval.id
        .ok_or_else(|| EvalFlowError::invalid_argument("evaluation has not been saved"))
}

/// `(include_evaluatees, include_admins)` for a results notification.
pub fn results_audience(eval: &Evaluation, job_type: JobType) -> (bool, bool) {
    if eval.results_sharing == ResultsSharing::Private {
        return (false, false);
    }
    match job_type {
        JobType::ViewableInstructors => (false, true),
        JobType::ViewableStudents => (true, false),
        // the main release covers whoever has no separate release of their own
        _ => (
            eval.student_view_results && eval.student_release_date().is_none(),
            eval.instructor_view_results && eval.instructor_release_date().is_none(),
        ),
    }
}

impl JobCoordinator {
    pub fn new(c: Collaborators) -> Self {
        Self {
            evaluations: c.evaluations,
            jobs: c.jobs,
            notifier: c.notifier,
            settings: c.settings,
            groups: c.groups,
            clock: c.clock,
            cascade: LockCascade::new(c.lock_graph),
        }
    }

    // ─── Entry points ──────────────────────────────────────

    /// React to an administrative change.
    pub async fn on_evaluation_change(&self, eval_id: EvalId, action: EvalAction) -> Result<()> {
        let policy = reminder::select_policy(self.settings.as_ref());
        let now = self.clock.now();

        match action {
            EvalAction::Delete => {
                let removed = self.cancel_all(eval_id).await?;
                tracing::info!("🗑️ Evaluation {} deleted, {} job(s) cancelled", eval_id, removed);
                Ok(())
            }
            EvalAction::Create => {
                let eval = self.load(eval_id).await?;
                self.handle_create(eval, now).await
            }
            EvalAction::Update => {
                let eval = self.load(eval_id).await?;
                self.handle_update(eval, policy, now).await
            }
        }
    }

    /// Handle a delivered job. Safe to call more than once for the same job.
    pub async fn on_job_fired(&self, eval_id: EvalId, job_type: JobType) -> Result<()> {
        let policy = reminder::select_policy(self.settings.as_ref());
        let now = self.clock.now();

        let Some(mut eval) = self.evaluations.get_by_id(eval_id).await? else {
            let removed = self.cancel_all(eval_id).await?;
            tracing::warn!(
                "⚠️ {} job fired for missing evaluation {}, cancelled {} remaining job(s)",
                job_type,
                eval_id,
                removed
            );
            return Ok(());
        };

        let state = self.repair_and_save(&mut eval, now).await?;
        match state {
            EvalState::Unknown => {
                tracing::error!(
                    "❌ Evaluation {} state unknown, ignoring {} job; needs operator attention",
                    eval_id,
                    job_type
                );
                return Ok(());
            }
            EvalState::Partial => {
                tracing::info!("⏸️ Evaluation {} is partial, ignoring {} job", eval_id, job_type);
                return Ok(());
            }
            EvalState::Deleted => {
                self.cancel_all(eval_id).await?;
                return Ok(());
            }
            _ => {}
        }

        if self.defer_early_fire(&eval, state, job_type, now).await? {
            return Ok(());
        }

        tracing::info!("🔔 {} job fired for evaluation {} ({})", job_type, eval_id, state);
        match job_type {
            JobType::Created => self.fire_created(&eval).await,
            JobType::Active => self.fire_active(eval, policy, now).await,
            JobType::Reminder => self.fire_reminder(&eval, state, policy, now).await,
            JobType::Due => self.fire_due(&eval, now).await,
            JobType::Closed => self.fire_closed(&eval, now).await,
            JobType::Viewable | JobType::ViewableInstructors | JobType::ViewableStudents => {
                self.fire_results(&eval, job_type).await
            }
        }
    }

    // ─── Administrative changes ──────────────────────────────────────

    async fn handle_create(&self, mut eval: Evaluation, now: DateTime<Utc>) -> Result<()> {
        let id = eval_id(&eval)?;
        let state = self.repair_and_save(&mut eval, now).await?;
        match state {
            EvalState::Partial => {
                return Err(EvalFlowError::InvalidTransition(format!(
                    "evaluation {id} is still partial and cannot be created"
                )));
            }
            EvalState::Unknown => {
                tracing::error!("❌ Evaluation {} created with unknown state, nothing scheduled", id);
                return Ok(());
            }
            EvalState::Deleted => {
                tracing::warn!("⚠️ Evaluation {} is deleted, nothing scheduled", id);
                return Ok(());
            }
            _ => {}
        }

        if self.settings.get_bool(settings::CREATED_ENABLED) {
            let wait = self.settings.get_i64(settings::CREATED_WAIT_SECS).max(0);
            self.schedule_job(id, JobType::Created, now + Duration::seconds(wait))
                .await?;
        }
        let start = eval
            .start_date
            .ok_or_else(|| EvalFlowError::Validation(format!("evaluation {id} has no start date")))?;
        self.schedule_job(id, JobType::Active, start).await?;
        tracing::info!("📅 Evaluation {} created ({}), opens {}", id, state, start);
        Ok(())
    }

    async fn handle_update(
        &self,
        mut eval: Evaluation,
        policy: &dyn ReminderPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = eval_id(&eval)?;
        let state = self.repair_and_save(&mut eval, now).await?;

        match state {
            EvalState::Unknown => {
                tracing::error!("❌ Evaluation {} state unknown after update, jobs left as they are", id);
                return Ok(());
            }
            EvalState::Partial => return Ok(()),
            EvalState::Deleted => {
                self.cancel_all(id).await?;
                return Ok(());
            }
            EvalState::InQueue => {
                if let Some(start) = eval.start_date {
                    self.check_invocation_date(&eval, JobType::Active, start).await?;
                }
            }
            EvalState::Active => {
                self.fix_reminder(&eval, policy, now).await?;
                match eval.due_date {
                    Some(due) => {
                        self.check_invocation_date(&eval, JobType::Due, due).await?;
                    }
                    None => {
                        self.cancel_job(id, JobType::Due).await?;
                    }
                }
            }
            EvalState::GracePeriod => {
                self.check_invocation_date(&eval, JobType::Closed, eval.safe_stop_date(now))
                    .await?;
            }
            EvalState::Closed => {
                self.check_invocation_date(&eval, JobType::Viewable, eval.safe_view_date(now))
                    .await?;
                self.reconcile_release(&eval, JobType::ViewableInstructors, eval.instructor_release_date())
                    .await?;
                self.reconcile_release(&eval, JobType::ViewableStudents, eval.student_release_date())
                    .await?;
            }
            EvalState::Viewable => {}
        }

        let open = matches!(
            state,
            EvalState::InQueue | EvalState::Active | EvalState::GracePeriod
        );
        if open && self.settings.get_bool(settings::SYNC_GROUPS_ON_STATE_CHANGE) {
            self.groups.sync(id, None).await?;
        }
        Ok(())
    }

    async fn reconcile_release(
        &self,
        eval: &Evaluation,
        job_type: JobType,
        release: Option<DateTime<Utc>>,
    ) -> Result<()> {
        match release {
            Some(at) => {
                self.check_invocation_date(eval, job_type, at).await?;
            }
            None => {
                self.cancel_job(eval_id(eval)?, job_type).await?;
            }
        }
        Ok(())
    }

    // ─── Fired jobs ──────────────────────────────────────

    /// Reschedule a transition job that fired before its date (the dates moved
    /// after it was planned). Returns `true` when the fire was deferred.
    async fn defer_early_fire(
        &self,
        eval: &Evaluation,
        state: EvalState,
        job_type: JobType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let (target, planned) = match job_type {
            JobType::Active => (EvalState::Active, eval.start_date),
            JobType::Due => (EvalState::GracePeriod, eval.due_date),
            JobType::Closed => (EvalState::Closed, eval.stop_date.or(eval.due_date)),
            JobType::Viewable => (EvalState::Viewable, eval.view_date),
            _ => return Ok(false),
        };
        if !state::is_before(state, target, false)? {
            return Ok(false);
        }

        let id = eval_id(eval)?;
        match planned {
            Some(at) if at > now => {
                self.schedule_job(id, job_type, at).await?;
                tracing::info!("⏳ {} job for evaluation {} fired early, moved to {}", job_type, id, at);
            }
            _ => {
                self.cancel_job(id, job_type).await?;
                tracing::info!("⏳ {} job for evaluation {} has no date to wait for, dropped", job_type, id);
            }
        }
        Ok(true)
    }

    async fn fire_created(&self, eval: &Evaluation) -> Result<()> {
        let id = eval_id(eval)?;
        let include_owner = self.settings.get_bool(settings::CREATED_INCLUDE_OWNER);
        let recipients = self.notifier.send_created(id, include_owner).await?;
        tracing::info!("📨 Created notification for evaluation {} ({} recipients)", id, recipients.len());
        Ok(())
    }

    async fn fire_active(
        &self,
        eval: Evaluation,
        policy: &dyn ReminderPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = eval_id(&eval)?;

        if policy.sends_available(self.settings.as_ref()) && !eval.available_email_sent {
            let include_evaluatees = self.settings.get_bool(settings::AVAILABLE_INCLUDE_EVALUATEES);
            let recipients = self.notifier.send_available(id, include_evaluatees).await?;
            self.evaluations.mark_available_sent(id).await?;
            tracing::info!("📨 Available notification for evaluation {} ({} recipients)", id, recipients.len());
        }

        if let Some(due) = eval.due_date {
            self.schedule_job(id, JobType::Due, due).await?;
        }
        if policy.plans_reminders() && eval.reminder_schedule().is_enabled() {
            self.schedule_reminder(&eval, now).await?;
        }

        self.cascade.set_locked(EntityRef::evaluation(id), true).await?;
        Ok(())
    }

    async fn fire_reminder(
        &self,
        eval: &Evaluation,
        state: EvalState,
        policy: &dyn ReminderPolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let id = eval_id(eval)?;
        if state != EvalState::Active {
            tracing::debug!("Reminder for evaluation {} skipped, state is {}", id, state);
            return Ok(());
        }
        if !policy.plans_reminders() || !eval.reminder_schedule().is_enabled() {
            tracing::debug!("Reminder for evaluation {} skipped, reminders off ({})", id, policy.name());
            return Ok(());
        }
        if eval.auth_control != AuthControl::AuthRequired {
            tracing::debug!("Reminder for evaluation {} skipped, participants are anonymous", id);
            return Ok(());
        }

        let raw = self.settings.get_str(settings::REMINDER_AUDIENCE);
        let audience = raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Unknown reminder audience '{}', using nontakers", raw);
            ReminderAudience::NonTakers
        });
        let recipients = self.notifier.send_reminder(id, audience).await?;
        tracing::info!("📨 Reminder for evaluation {} ({} recipients)", id, recipients.len());

        self.schedule_reminder(eval, now).await?;
        Ok(())
    }

    async fn fire_due(&self, eval: &Evaluation, now: DateTime<Utc>) -> Result<()> {
        let id = eval_id(eval)?;
        self.cancel_job(id, JobType::Reminder).await?;

        let close_at = match (eval.stop_date, eval.due_date) {
            (Some(stop), due) if Some(stop) != due => stop,
            (_, Some(due)) => due.max(now),
            (_, None) => now,
        };
        self.schedule_job(id, JobType::Closed, close_at).await?;
        Ok(())
    }

    async fn fire_closed(&self, eval: &Evaluation, now: DateTime<Utc>) -> Result<()> {
        let id = eval_id(eval)?;
        self.schedule_job(id, JobType::Viewable, eval.safe_view_date(now))
            .await?;

        let releases = [
            (JobType::ViewableInstructors, eval.instructor_release_date()),
            (JobType::ViewableStudents, eval.student_release_date()),
        ];
        for (job_type, release) in releases {
            match release {
                Some(at) => {
                    self.schedule_job(id, job_type, at).await?;
                }
                None => {
                    self.cancel_job(id, job_type).await?;
                }
            }
        }
        Ok(())
    }

    async fn fire_results(&self, eval: &Evaluation, job_type: JobType) -> Result<()> {
        let id = eval_id(eval)?;
        let (include_evaluatees, include_admins) = results_audience(eval, job_type);
        let recipients = self
            .notifier
            .send_results(id, include_evaluatees, include_admins, job_type)
            .await?;
        tracing::info!(
            "📨 Results ({}) for evaluation {} ({} recipients)",
            job_type,
            id,
            recipients.len()
        );
        Ok(())
    }

    // ─── Job bookkeeping ──────────────────────────────────────

    /// Correct the date of an existing job of `job_type`.
    ///
    /// Missing jobs are left missing. Duplicates are deleted, keeping the lowest id.
    /// A job at the wrong instant is deleted and re-created at `correct`.
    /// Returns `true` when the job set changed.
    pub async fn check_invocation_date(
        &self,
        eval: &Evaluation,
        job_type: JobType,
        correct: DateTime<Utc>,
    ) -> Result<bool> {
        if job_type == JobType::Reminder {
            return Err(EvalFlowError::invalid_argument(
                "reminder jobs are replanned, not date-corrected",
            ));
        }
        let id = eval_id(eval)?;
        let mut jobs = self.jobs.find(id, job_type).await?;
        jobs.sort_by_key(|j| j.id);
        let Some((keep, extras)) = jobs.split_first() else {
            return Ok(false);
        };

        let mut changed = false;
        for extra in extras {
            tracing::warn!(
                "🧹 Removing duplicate {} job {} for evaluation {}",
                job_type,
                extra.id,
                id
            );
            changed |= self.jobs.delete(extra.id).await?;
        }
        if keep.run_at == correct {
            return Ok(changed);
        }

        self.jobs.delete(keep.id).await?;
        self.jobs.create(correct, id, job_type).await?;
        tracing::info!(
            "📅 {} job for evaluation {} moved {} → {}",
            job_type,
            id,
            keep.run_at,
            correct
        );
        Ok(true)
    }

    /// Replace whatever job of `job_type` exists with one at `run_at`.
    pub async fn schedule_job(
        &self,
        eval_id: EvalId,
        job_type: JobType,
        run_at: DateTime<Utc>,
    ) -> Result<JobId> {
        self.cancel_job(eval_id, job_type).await?;
        let job_id = self.jobs.create(run_at, eval_id, job_type).await?;
        tracing::debug!("📅 Scheduled {} job {} for evaluation {} at {}", job_type, job_id, eval_id, run_at);
        Ok(job_id)
    }

    /// Delete every job of `job_type`. Returns how many were removed.
    pub async fn cancel_job(&self, eval_id: EvalId, job_type: JobType) -> Result<usize> {
        let mut removed = 0;
        for job in self.jobs.find(eval_id, job_type).await? {
            if self.jobs.delete(job.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn cancel_all(&self, eval_id: EvalId) -> Result<usize> {
        let mut removed = 0;
        for job_type in JobType::ALL {
            removed += self.cancel_job(eval_id, job_type).await?;
        }
        Ok(removed)
    }

    /// Plan the next reminder if the evaluation is still `ACTIVE`.
    pub async fn schedule_reminder(
        &self,
        eval: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let id = eval_id(eval)?;
        let state = state::resolve(eval, true, now);
        if state != EvalState::Active {
            tracing::debug!("No reminder for evaluation {}, state is {}", id, state);
            return Ok(None);
        }
        let Some(at) = reminder::next_reminder_at(eval, now) else {
            tracing::debug!("No further reminder for evaluation {}", id);
            return Ok(None);
        };
        self.schedule_job(id, JobType::Reminder, at).await?;
        tracing::info!("⏰ Reminder for evaluation {} planned at {}", id, at);
        Ok(Some(at))
    }

    /// Cancel the pending reminder and plan a fresh one under `policy`.
    pub async fn fix_reminder(
        &self,
        eval: &Evaluation,
        policy: &dyn ReminderPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let id = eval_id(eval)?;
        self.cancel_job(id, JobType::Reminder).await?;
        if !policy.plans_reminders() || !eval.reminder_schedule().is_enabled() {
            return Ok(None);
        }
        self.schedule_reminder(eval, now).await
    }

    // ─── Helpers ──────────────────────────────────────

    async fn load(&self, eval_id: EvalId) -> Result<Evaluation> {
        self.evaluations
            .get_by_id(eval_id)
            .await?
            .ok_or_else(|| EvalFlowError::not_found(format!("evaluation {eval_id}")))
    }

    async fn repair_and_save(&self, eval: &mut Evaluation, now: DateTime<Utc>) -> Result<EvalState> {
        let (state, changed) = state::repair(eval, now);
        if changed {
            self.evaluations.save(eval).await?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::notify::{LoggingNotifier, NotificationKind};
    use chrono::TimeZone;
    use evalflow_core::traits::ManualClock;
    use evalflow_core::types::ItemKind;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap() + Duration::days(n)
    }

    struct Harness {
        backend: Arc<MemoryBackend>,
        notifier: Arc<LoggingNotifier>,
        clock: Arc<ManualClock>,
        coordinator: JobCoordinator,
    }

    fn harness(now: DateTime<Utc>) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let notifier = Arc::new(LoggingNotifier::new());
        let clock = Arc::new(ManualClock::new(now));
        let coordinator = JobCoordinator::new(Collaborators {
            evaluations: backend.clone(),
            jobs: backend.clone(),
            notifier: notifier.clone(),
            settings: backend.clone(),
            groups: backend.clone(),
            lock_graph: backend.clone(),
            clock: clock.clone(),
        });
        Harness {
            backend,
            notifier,
            clock,
            coordinator,
        }
    }

    /// Weekly reminders, due day 30, grace until day 32, results day 35.
    fn weekly_eval() -> Evaluation {
        let mut eval = Evaluation::new("Teaching feedback", "prof")
            .with_dates(day(0), Some(day(30)), Some(day(32)), Some(day(35)));
        eval.state = EvalState::InQueue;
        eval.reminder_days_interval = 7;
        eval
    }

    impl Harness {
        fn insert(&self, eval: Evaluation) -> EvalId {
            self.backend.insert_evaluation(eval).unwrap()
        }

        async fn get(&self, id: EvalId) -> Evaluation {
            self.backend.get_by_id(id).await.unwrap().unwrap()
        }

        /// `(job_type, run_at)` pairs, sorted, for one evaluation.
        fn jobs(&self, id: EvalId) -> Vec<(JobType, DateTime<Utc>)> {
            let mut jobs: Vec<_> = self
                .backend
                .all_jobs()
                .unwrap()
                .into_iter()
                .filter(|j| j.eval_id == id)
                .map(|j| (j.job_type, j.run_at))
                .collect();
            jobs.sort_by_key(|(t, at)| (t.as_str(), *at));
            jobs
        }

        fn job_at(&self, id: EvalId, job_type: JobType) -> Option<DateTime<Utc>> {
            self.jobs(id)
                .into_iter()
                .find(|(t, _)| *t == job_type)
                .map(|(_, at)| at)
        }

        fn sent(&self, id: EvalId) -> Vec<NotificationKind> {
            self.notifier
                .log
                .for_eval(id)
                .into_iter()
                .map(|n| n.kind)
                .collect()
        }

        fn assert_single_job_per_type(&self) {
            let jobs = self.backend.all_jobs().unwrap();
            for job in &jobs {
                let same = jobs
                    .iter()
                    .filter(|j| j.eval_id == job.eval_id && j.job_type == job.job_type)
                    .count();
                assert_eq!(same, 1, "duplicate {} jobs for evaluation {}", job.job_type, job.eval_id);
            }
        }
    }

    #[tokio::test]
    async fn test_create_schedules_created_and_active() {
        let h = harness(day(-2));
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();

        assert_eq!(h.job_at(id, JobType::Created), Some(day(-2) + Duration::seconds(300)));
        assert_eq!(h.job_at(id, JobType::Active), Some(day(0)));
        assert_eq!(h.jobs(id).len(), 2);
    }

    #[tokio::test]
    async fn test_create_honours_created_settings() {
        let h = harness(day(-2));
        h.backend.set(settings::CREATED_ENABLED.name, "false").unwrap();
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Active, day(0))]);

        h.backend.set(settings::CREATED_ENABLED.name, "true").unwrap();
        h.backend.set(settings::CREATED_WAIT_SECS.name, "60").unwrap();
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();
        assert_eq!(h.job_at(id, JobType::Created), Some(day(-2) + Duration::seconds(60)));
        h.assert_single_job_per_type();
    }

    #[tokio::test]
    async fn test_create_partial_is_invalid_transition() {
        let h = harness(day(-2));
        let mut eval = weekly_eval();
        eval.state = EvalState::Partial;
        let id = h.insert(eval);
        let err = h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap_err();
        assert!(matches!(err, EvalFlowError::InvalidTransition(_)));
        assert!(h.jobs(id).is_empty());
    }

    #[tokio::test]
    async fn test_update_of_missing_evaluation_is_not_found() {
        let h = harness(day(0));
        let err = h.coordinator.on_evaluation_change(77, EvalAction::Update).await.unwrap_err();
        assert!(matches!(err, EvalFlowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_cancels_every_job() {
        let h = harness(day(-2));
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();
        h.backend.create(day(3), id, JobType::Reminder).await.unwrap();

        h.coordinator.on_evaluation_change(id, EvalAction::Delete).await.unwrap();
        assert!(h.jobs(id).is_empty());
        // nothing left: still fine
        h.coordinator.on_evaluation_change(id, EvalAction::Delete).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_inqueue_moves_active_job() {
        let h = harness(day(-5));
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();

        let mut eval = h.get(id).await;
        eval.start_date = Some(day(-1));
        h.insert(eval);
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.job_at(id, JobType::Active), Some(day(-1)));
    }

    #[tokio::test]
    async fn test_update_never_creates_missing_jobs() {
        let h = harness(day(-5));
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert!(h.jobs(id).is_empty());
    }

    #[tokio::test]
    async fn test_due_date_edit_reschedules_due_and_replans_reminder() {
        let h = harness(day(0));
        let id = h.insert(weekly_eval());
        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        assert_eq!(h.job_at(id, JobType::Due), Some(day(30)));
        let reminder_before = h.backend.find(id, JobType::Reminder).await.unwrap();
        assert_eq!(reminder_before.len(), 1);

        h.clock.set(day(1));
        let mut eval = h.get(id).await;
        eval.due_date = Some(day(20));
        h.insert(eval);
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();

        assert_eq!(h.job_at(id, JobType::Due), Some(day(20)));
        let reminder_after = h.backend.find(id, JobType::Reminder).await.unwrap();
        assert_eq!(reminder_after.len(), 1);
        assert_eq!(reminder_after[0].run_at, day(7));
        assert_ne!(reminder_after[0].id, reminder_before[0].id);
        h.assert_single_job_per_type();
    }

    #[tokio::test]
    async fn test_removing_due_date_while_active_cancels_due_job() {
        let h = harness(day(0));
        let id = h.insert(weekly_eval());
        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();

        h.clock.set(day(2));
        let mut eval = h.get(id).await;
        eval.due_date = None;
        h.insert(eval);
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.job_at(id, JobType::Due), None);
    }

    #[tokio::test]
    async fn test_active_fire_is_idempotent() {
        let h = harness(day(0));
        let id = h.insert(weekly_eval());

        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        let once = h.jobs(id);
        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();

        assert_eq!(h.jobs(id), once);
        assert_eq!(once, vec![(JobType::Due, day(30)), (JobType::Reminder, day(7))]);
        let available = h
            .sent(id)
            .into_iter()
            .filter(|k| matches!(k, NotificationKind::Available { .. }))
            .count();
        assert_eq!(available, 1);
        h.assert_single_job_per_type();
    }

    #[tokio::test]
    async fn test_active_fire_locks_the_authoring_chain() {
        let h = harness(day(0));
        let scale = h.backend.insert_scale("Quality", &["low", "high"]).unwrap();
        let item = h.backend.insert_item("Lectures", ItemKind::Scaled { scale_id: scale }).unwrap();
        let template = h.backend.insert_template("Course", "prof").unwrap();
        h.backend.add_template_item(template, item, 1, None).unwrap();
        let mut eval = weekly_eval();
        eval.template_id = Some(template);
        let id = h.insert(eval);

        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();

        for entity in [
            EntityRef::evaluation(id),
            EntityRef::template(template),
            EntityRef::item(item),
            EntityRef::scale(scale),
        ] {
            assert_eq!(h.backend.is_locked(entity).await.unwrap(), Some(true), "{entity}");
        }
        assert!(h.get(id).await.available_email_sent);
    }

    #[tokio::test]
    async fn test_weekly_reminder_fires_and_replans() {
        let h = harness(day(0));
        let id = h.insert(weekly_eval());
        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        assert_eq!(h.job_at(id, JobType::Reminder), Some(day(7)));

        h.clock.set(day(7));
        h.coordinator.on_job_fired(id, JobType::Reminder).await.unwrap();

        assert_eq!(h.job_at(id, JobType::Reminder), Some(day(14)));
        assert!(h.sent(id).contains(&NotificationKind::Reminder {
            audience: ReminderAudience::NonTakers
        }));
    }

    #[tokio::test]
    async fn test_reminder_uses_configured_audience() {
        let h = harness(day(7));
        h.backend.set(settings::REMINDER_AUDIENCE.name, "partial").unwrap();
        let mut eval = weekly_eval();
        eval.state = EvalState::Active;
        let id = h.insert(eval);

        h.coordinator.on_job_fired(id, JobType::Reminder).await.unwrap();
        assert_eq!(
            h.sent(id),
            vec![NotificationKind::Reminder { audience: ReminderAudience::Partial }]
        );
    }

    #[tokio::test]
    async fn test_reminder_skipped_for_anonymous_evaluations() {
        let h = harness(day(7));
        let mut eval = weekly_eval();
        eval.auth_control = AuthControl::KeyRequired;
        let id = h.insert(eval);

        h.coordinator.on_job_fired(id, JobType::Reminder).await.unwrap();
        assert!(h.sent(id).is_empty());
        assert_eq!(h.job_at(id, JobType::Reminder), None);
    }

    #[tokio::test]
    async fn test_due_fire_schedules_close() {
        let h = harness(day(30));
        let id = h.insert(weekly_eval());
        h.backend.create(day(35), id, JobType::Reminder).await.unwrap();

        h.coordinator.on_job_fired(id, JobType::Due).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Closed, day(32))]);

        // stop equal to due: close immediately once past due
        let mut eval = weekly_eval();
        eval.stop_date = eval.due_date;
        let other = h.insert(eval);
        h.clock.set(day(31));
        h.coordinator.on_job_fired(other, JobType::Due).await.unwrap();
        assert_eq!(h.jobs(other), vec![(JobType::Closed, day(31))]);
    }

    #[tokio::test]
    async fn test_closed_fire_schedules_release_jobs() {
        let h = harness(day(32));
        let mut eval = weekly_eval();
        eval.instructor_view_date = Some(day(33));
        eval.student_view_results = true;
        eval.student_view_date = Some(day(35));
        let id = h.insert(eval);

        h.coordinator.on_job_fired(id, JobType::Closed).await.unwrap();
        // student date equals the main view date: covered by VIEWABLE
        assert_eq!(
            h.jobs(id),
            vec![(JobType::Viewable, day(35)), (JobType::ViewableInstructors, day(33))]
        );
    }

    #[tokio::test]
    async fn test_update_while_closed_cancels_dropped_release() {
        let h = harness(day(32));
        let mut eval = weekly_eval();
        eval.instructor_view_date = Some(day(33));
        let id = h.insert(eval);
        h.coordinator.on_job_fired(id, JobType::Closed).await.unwrap();

        let mut eval = h.get(id).await;
        eval.instructor_view_results = false;
        eval.view_date = Some(day(36));
        h.insert(eval);
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Viewable, day(36))]);
    }

    #[tokio::test]
    async fn test_update_graceperiod_moves_closed_job() {
        let h = harness(day(31));
        let id = h.insert(weekly_eval());
        h.backend.create(day(32), id, JobType::Closed).await.unwrap();

        let mut eval = h.get(id).await;
        eval.stop_date = Some(day(34));
        h.insert(eval);
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();

        assert_eq!(h.get(id).await.state, EvalState::GracePeriod);
        assert_eq!(h.jobs(id), vec![(JobType::Closed, day(34))]);
    }

    #[tokio::test]
    async fn test_update_of_deleted_evaluation_clears_jobs() {
        let h = harness(day(3));
        h.backend.set(settings::SYNC_GROUPS_ON_STATE_CHANGE.name, "true").unwrap();
        let mut eval = weekly_eval();
        eval.state = EvalState::Deleted;
        let id = h.insert(eval);
        h.backend.create(day(7), id, JobType::Reminder).await.unwrap();
        h.backend.create(day(30), id, JobType::Due).await.unwrap();

        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert!(h.jobs(id).is_empty());
        assert!(h.backend.group_syncs().unwrap().is_empty());
        assert!(h.sent(id).is_empty());
    }

    #[test]
    fn test_results_audience() {
        let mut eval = weekly_eval();
        assert_eq!(results_audience(&eval, JobType::Viewable), (false, true));
        assert_eq!(results_audience(&eval, JobType::ViewableStudents), (true, false));

        eval.instructor_view_date = Some(day(40));
        eval.student_view_results = true;
        assert_eq!(results_audience(&eval, JobType::Viewable), (true, false));

        eval.results_sharing = ResultsSharing::Private;
        assert_eq!(results_audience(&eval, JobType::ViewableInstructors), (false, false));
    }

    #[tokio::test]
    async fn test_fire_for_missing_evaluation_cleans_up() {
        let h = harness(day(1));
        h.backend.create(day(2), 41, JobType::Due).await.unwrap();
        h.backend.create(day(9), 41, JobType::Reminder).await.unwrap();

        h.coordinator.on_job_fired(41, JobType::Due).await.unwrap();
        assert!(h.jobs(41).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_state_leaves_jobs_untouched() {
        let h = harness(day(1));
        let mut eval = weekly_eval();
        eval.start_date = None;
        let id = h.insert(eval);
        h.backend.create(day(30), id, JobType::Due).await.unwrap();

        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Due, day(30))]);
        assert!(h.sent(id).is_empty());
        assert_eq!(h.get(id).await.state, EvalState::InQueue);
    }

    #[tokio::test]
    async fn test_deleted_evaluation_fire_cancels_jobs() {
        let h = harness(day(1));
        let mut eval = weekly_eval();
        eval.state = EvalState::Deleted;
        let id = h.insert(eval);
        h.backend.create(day(30), id, JobType::Due).await.unwrap();

        h.coordinator.on_job_fired(id, JobType::Reminder).await.unwrap();
        assert!(h.jobs(id).is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_repaired_keeping_lowest_id() {
        let h = harness(day(1));
        let id = h.insert(weekly_eval());
        let first = h.backend.create(day(30), id, JobType::Due).await.unwrap();
        h.backend.create(day(29), id, JobType::Due).await.unwrap();
        h.backend.create(day(28), id, JobType::Due).await.unwrap();

        let eval = h.get(id).await;
        let changed = h
            .coordinator
            .check_invocation_date(&eval, JobType::Due, day(30))
            .await
            .unwrap();
        assert!(changed);
        let jobs = h.backend.find(id, JobType::Due).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, first);

        let changed = h
            .coordinator
            .check_invocation_date(&eval, JobType::Due, day(30))
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_reminder_excluded_from_date_correction() {
        let h = harness(day(1));
        let id = h.insert(weekly_eval());
        let eval = h.get(id).await;
        let err = h
            .coordinator
            .check_invocation_date(&eval, JobType::Reminder, day(7))
            .await
            .unwrap_err();
        assert!(matches!(err, EvalFlowError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_consolidated_policy_suppresses_per_evaluation_mail() {
        let h = harness(day(0));
        h.backend.set(settings::CONSOLIDATED_ENABLED.name, "true").unwrap();
        let id = h.insert(weekly_eval());

        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Due, day(30))]);
        assert!(h.sent(id).is_empty());
        assert!(!h.get(id).await.available_email_sent);

        h.backend.set(settings::CONSOLIDATED_FORCE_AVAILABLE.name, "true").unwrap();
        h.coordinator.on_job_fired(id, JobType::Active).await.unwrap();
        assert_eq!(h.sent(id).len(), 1);
        assert_eq!(h.job_at(id, JobType::Reminder), None);
    }

    #[tokio::test]
    async fn test_group_sync_once_per_open_update() {
        let h = harness(day(2));
        h.backend.set(settings::SYNC_GROUPS_ON_STATE_CHANGE.name, "true").unwrap();
        let id = h.insert(weekly_eval());

        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.backend.group_syncs().unwrap(), vec![(id, None)]);

        h.clock.set(day(33));
        h.coordinator.on_evaluation_change(id, EvalAction::Update).await.unwrap();
        assert_eq!(h.backend.group_syncs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_early_fire_is_deferred() {
        let h = harness(day(10));
        let id = h.insert(weekly_eval());

        h.coordinator.on_job_fired(id, JobType::Due).await.unwrap();
        assert_eq!(h.jobs(id), vec![(JobType::Due, day(30))]);
        assert!(h.sent(id).is_empty());
    }

    #[tokio::test]
    async fn test_full_lifecycle_keeps_one_job_per_type() {
        let h = harness(day(-1));
        let id = h.insert(weekly_eval());
        h.coordinator.on_evaluation_change(id, EvalAction::Create).await.unwrap();

        for _ in 0..50 {
            let Some(next) = h.backend.all_jobs().unwrap().iter().map(|j| j.run_at).min() else {
                break;
            };
            h.clock.set(next.max(h.clock.now()));
            for job in h.backend.due(h.clock.now(), 100).await.unwrap() {
                assert!(h.backend.delete(job.id).await.unwrap());
                h.coordinator.on_job_fired(job.eval_id, job.job_type).await.unwrap();
            }
            h.assert_single_job_per_type();
        }

        assert!(h.jobs(id).is_empty());
        let sent = h.sent(id);
        let reminders = sent
            .iter()
            .filter(|k| matches!(k, NotificationKind::Reminder { .. }))
            .count();
        assert_eq!(reminders, 4);
        assert_eq!(sent.first(), Some(&NotificationKind::Created { include_owner: true }));
        assert_eq!(
            sent.last(),
            Some(&NotificationKind::Results {
                include_evaluatees: false,
                include_admins: true,
                job_type: JobType::Viewable,
            })
        );
        assert_eq!(h.get(id).await.state, EvalState::Viewable);
    }
}
