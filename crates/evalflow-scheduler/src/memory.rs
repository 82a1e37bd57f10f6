//! In-memory backend: every store trait behind one mutex.
//! Used by tests; state is lost on drop.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::settings::SettingsProvider;
use evalflow_core::traits::lock::check_lock_args;
use evalflow_core::traits::{
    Clock, DistributedLock, EvaluationStore, GroupMembershipSyncer, JobStore, LockGraph,
    SystemClock,
};
use evalflow_core::types::{
    EntityKind, EntityRef, EvalId, EvalState, Evaluation, Item, ItemKind, JobId, JobType, Scale,
    ScheduledJob, Template, TemplateItem,
};

#[derive(Default)]
struct MemoryState {
    evaluations: BTreeMap<EvalId, Evaluation>,
    jobs: BTreeMap<JobId, ScheduledJob>,
    scales: BTreeMap<i64, Scale>,
    items: BTreeMap<i64, Item>,
    templates: BTreeMap<i64, Template>,
    template_items: Vec<TemplateItem>,
    /// name → (holder, expires_at)
    locks: HashMap<String, (String, DateTime<Utc>)>,
    settings: HashMap<String, String>,
    group_syncs: Vec<(EvalId, Option<String>)>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Lock expiry is judged against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| EvalFlowError::store("memory backend poisoned"))
    }

    /// Store an evaluation, assigning an id when it has none.
    pub fn insert_evaluation(&self, mut eval: Evaluation) -> Result<EvalId> {
        let mut st = self.state()?;
        let id = match eval.id {
            Some(id) => id,
            None => st.next_id(),
        };
        eval.id = Some(id);
        st.evaluations.insert(id, eval);
        Ok(id)
    }

    pub fn remove_evaluation(&self, id: EvalId) -> Result<bool> {
        Ok(self.state()?.evaluations.remove(&id).is_some())
    }

    pub fn insert_scale(&self, title: &str, options: &[&str]) -> Result<i64> {
        let mut st = self.state()?;
        let id = st.next_id();
        st.scales.insert(
            id,
            Scale {
                id: Some(id),
                title: title.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
                locked: false,
            },
        );
        Ok(id)
    }

    pub fn insert_item(&self, text: &str, kind: ItemKind) -> Result<i64> {
        let mut st = self.state()?;
        if let Some(scale_id) = kind.scale_id() {
            if !st.scales.contains_key(&scale_id) {
                return Err(EvalFlowError::not_found(format!("scale {scale_id}")));
            }
        }
        let id = st.next_id();
        st.items.insert(
            id,
            Item {
                id: Some(id),
                text: text.to_string(),
                kind,
                locked: false,
            },
        );
        Ok(id)
    }

    pub fn insert_template(&self, title: &str, owner: &str) -> Result<i64> {
        let mut st = self.state()?;
        let id = st.next_id();
        st.templates.insert(
            id,
            Template {
                id: Some(id),
                title: title.to_string(),
                owner: owner.to_string(),
                locked: false,
            },
        );
        Ok(id)
    }

    pub fn add_template_item(
        &self,
        template_id: i64,
        item_id: i64,
        display_order: i32,
        block_parent_id: Option<i64>,
    ) -> Result<()> {
        let mut st = self.state()?;
        if !st.templates.contains_key(&template_id) {
            return Err(EvalFlowError::not_found(format!("template {template_id}")));
        }
        if !st.items.contains_key(&item_id) {
            return Err(EvalFlowError::not_found(format!("item {item_id}")));
        }
        st.template_items
            .retain(|ti| !(ti.template_id == template_id && ti.item_id == item_id));
        st.template_items.push(TemplateItem {
            template_id,
            item_id,
            display_order,
            block_parent_id,
        });
        Ok(())
    }

    /// Every scheduled job, ordered by id.
    pub fn all_jobs(&self) -> Result<Vec<ScheduledJob>> {
        Ok(self.state()?.jobs.values().cloned().collect())
    }

    /// Group syncs requested so far.
    pub fn group_syncs(&self) -> Result<Vec<(EvalId, Option<String>)>> {
        Ok(self.state()?.group_syncs.clone())
    }

    fn lock_flag(st: &MemoryState, entity: EntityRef, id: i64) -> Option<bool> {
        match entity.kind {
            EntityKind::Scale => st.scales.get(&id).map(|s| s.locked),
            EntityKind::Item => st.items.get(&id).map(|i| i.locked),
            EntityKind::Template => st.templates.get(&id).map(|t| t.locked),
            EntityKind::Evaluation => st.evaluations.get(&id).map(|e| e.locked),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvaluationStore for MemoryBackend {
    async fn get_by_id(&self, id: EvalId) -> Result<Option<Evaluation>> {
        Ok(self.state()?.evaluations.get(&id).cloned())
    }

    async fn save(&self, eval: &Evaluation) -> Result<()> {
        let id = eval
            .id
            .ok_or_else(|| EvalFlowError::invalid_argument("cannot save an evaluation without id"))?;
        let mut st = self.state()?;
        let Some(stored) = st.evaluations.get_mut(&id) else {
            return Err(EvalFlowError::not_found(format!("evaluation {id}")));
        };
        let locked = stored.locked;
        *stored = eval.clone();
        stored.locked = locked;
        Ok(())
    }

    async fn mark_available_sent(&self, id: EvalId) -> Result<bool> {
        Ok(match self.state()?.evaluations.get_mut(&id) {
            Some(eval) => {
                eval.available_email_sent = true;
                true
            }
            None => false,
        })
    }

    async fn exists(&self, id: EvalId) -> Result<bool> {
        Ok(self.state()?.evaluations.contains_key(&id))
    }

    async fn list_in_state(&self, state: EvalState) -> Result<Vec<Evaluation>> {
        Ok(self
            .state()?
            .evaluations
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create(&self, run_at: DateTime<Utc>, eval_id: EvalId, job_type: JobType) -> Result<JobId> {
        let mut st = self.state()?;
        let id = st.next_id();
        st.jobs.insert(
            id,
            ScheduledJob {
                id,
                run_at,
                eval_id,
                job_type,
            },
        );
        Ok(id)
    }

    async fn find(&self, eval_id: EvalId, job_type: JobType) -> Result<Vec<ScheduledJob>> {
        Ok(self
            .state()?
            .jobs
            .values()
            .filter(|j| j.eval_id == eval_id && j.job_type == job_type)
            .cloned()
            .collect())
    }

    async fn delete(&self, job_id: JobId) -> Result<bool> {
        Ok(self.state()?.jobs.remove(&job_id).is_some())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let mut due: Vec<ScheduledJob> = self
            .state()?
            .jobs
            .values()
            .filter(|j| j.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.run_at, j.id));
        due.truncate(limit);
        Ok(due)
    }
}

#[async_trait]
impl LockGraph for MemoryBackend {
    async fn is_locked(&self, entity: EntityRef) -> Result<Option<bool>> {
        let Some(id) = entity.id else { return Ok(None) };
        Ok(Self::lock_flag(&*self.state()?, entity, id))
    }

    async fn set_locked_flag(&self, entity: EntityRef, locked: bool) -> Result<()> {
        let id = entity
            .id
            .ok_or_else(|| EvalFlowError::invalid_argument(format!("{entity} is not persisted")))?;
        let mut st = self.state()?;
        let flag = match entity.kind {
            EntityKind::Scale => st.scales.get_mut(&id).map(|s| &mut s.locked),
            EntityKind::Item => st.items.get_mut(&id).map(|i| &mut i.locked),
            EntityKind::Template => st.templates.get_mut(&id).map(|t| &mut t.locked),
            EntityKind::Evaluation => st.evaluations.get_mut(&id).map(|e| &mut e.locked),
        };
        match flag {
            Some(flag) => {
                *flag = locked;
                Ok(())
            }
            None => Err(EvalFlowError::not_found(entity.to_string())),
        }
    }

    async fn children(&self, entity: EntityRef) -> Result<Vec<EntityRef>> {
        let Some(id) = entity.id else { return Ok(Vec::new()) };
        let st = self.state()?;
        let children = match entity.kind {
            EntityKind::Evaluation => st
                .evaluations
                .get(&id)
                .and_then(|e| e.template_id)
                .map(EntityRef::template)
                .into_iter()
                .collect(),
            EntityKind::Template => {
                let mut ids: Vec<i64> = st
                    .template_items
                    .iter()
                    .filter(|ti| ti.template_id == id)
                    .map(|ti| ti.item_id)
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids.into_iter().map(EntityRef::item).collect()
            }
            EntityKind::Item => st
                .items
                .get(&id)
                .and_then(|i| i.kind.scale_id())
                .map(EntityRef::scale)
                .into_iter()
                .collect(),
            EntityKind::Scale => Vec::new(),
        };
        Ok(children)
    }

    async fn locked_parents(&self, entity: EntityRef) -> Result<Vec<EntityRef>> {
        let Some(id) = entity.id else { return Ok(Vec::new()) };
        let st = self.state()?;
        let parents = match entity.kind {
            EntityKind::Scale => st
                .items
                .values()
                .filter(|i| i.locked && i.kind.scale_id() == Some(id))
                .filter_map(|i| i.id.map(EntityRef::item))
                .collect(),
            EntityKind::Item => {
                let mut ids: Vec<i64> = st
                    .template_items
                    .iter()
                    .filter(|ti| ti.item_id == id)
                    .map(|ti| ti.template_id)
                    .filter(|tid| st.templates.get(tid).is_some_and(|t| t.locked))
                    .collect();
                ids.sort_unstable();
                ids.dedup();
                ids.into_iter().map(EntityRef::template).collect()
            }
            EntityKind::Template => st
                .evaluations
                .values()
                .filter(|e| e.locked && e.template_id == Some(id))
                .filter_map(|e| e.id.map(EntityRef::evaluation))
                .collect(),
            EntityKind::Evaluation => Vec::new(),
        };
        Ok(parents)
    }
}

#[async_trait]
impl DistributedLock for MemoryBackend {
    async fn obtain(&self, name: &str, holder: &str, ttl: StdDuration) -> Result<bool> {
        check_lock_args(name, holder)?;
        let now = self.clock.now();
        let ttl = Duration::from_std(ttl).map_err(|e| EvalFlowError::invalid_argument(e.to_string()))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| EvalFlowError::invalid_argument(format!("lock ttl out of range: {ttl}")))?;
        let mut st = self.state()?;
        let free = match st.locks.get(name) {
            None => true,
            Some((current, expires_at)) => *expires_at <= now || current == holder,
        };
        if free {
            st.locks.insert(name.to_string(), (holder.to_string(), expires_at));
        }
        Ok(free)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        check_lock_args(name, holder)?;
        let mut st = self.state()?;
        let held = st.locks.get(name).is_some_and(|(current, _)| current == holder);
        if held {
            st.locks.remove(name);
        }
        Ok(held)
    }
}

impl SettingsProvider for MemoryBackend {
    fn get(&self, name: &str) -> Option<String> {
        self.state().ok()?.settings.get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.state()?
            .settings
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl GroupMembershipSyncer for MemoryBackend {
    async fn sync(&self, eval_id: EvalId, group_id: Option<&str>) -> Result<()> {
        self.state()?
            .group_syncs
            .push((eval_id, group_id.map(str::to_string)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let backend = MemoryBackend::new();
        let ttl = StdDuration::from_millis(10_000);
        assert!(backend.obtain("X", "A", ttl).await.unwrap());
        assert!(!backend.obtain("X", "B", ttl).await.unwrap());
        // reentrant refresh
        assert!(backend.obtain("X", "A", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_ttl_expiry() {
        let backend = MemoryBackend::new();
        let ttl = StdDuration::from_millis(100);
        assert!(backend.obtain("X", "A", ttl).await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        assert!(backend.obtain("X", "B", ttl).await.unwrap());
        assert!(!backend.release("X", "A").await.unwrap());
        assert!(backend.release("X", "B").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_release_rules() {
        let backend = MemoryBackend::new();
        let ttl = StdDuration::from_secs(60);
        assert!(!backend.release("X", "A").await.unwrap());
        backend.obtain("X", "A", ttl).await.unwrap();
        assert!(!backend.release("X", "B").await.unwrap());
        assert!(backend.release("X", "A").await.unwrap());
        assert!(backend.obtain("X", "B", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_rejects_empty_arguments() {
        let backend = MemoryBackend::new();
        let ttl = StdDuration::from_secs(1);
        assert!(matches!(
            backend.obtain("", "A", ttl).await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
        assert!(matches!(
            backend.release("X", " ").await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_jobs_find_and_due_ordering() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        let later = backend.create(now + Duration::hours(1), 1, JobType::Due).await.unwrap();
        let first = backend.create(now - Duration::hours(2), 1, JobType::Active).await.unwrap();
        let second = backend.create(now - Duration::hours(1), 2, JobType::Active).await.unwrap();

        let due = backend.due(now, 10).await.unwrap();
        assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(backend.due(now, 1).await.unwrap().len(), 1);

        assert_eq!(backend.find(1, JobType::Due).await.unwrap()[0].id, later);
        assert!(backend.delete(later).await.unwrap());
        assert!(!backend.delete(later).await.unwrap());
    }

    #[tokio::test]
    async fn test_graph_edges() {
        let backend = MemoryBackend::new();
        let scale = backend.insert_scale("Agreement", &["agree", "disagree"]).unwrap();
        let item = backend.insert_item("Clear goals?", ItemKind::Scaled { scale_id: scale }).unwrap();
        let template = backend.insert_template("Course", "owner").unwrap();
        backend.add_template_item(template, item, 1, None).unwrap();
        let mut eval = Evaluation::new("Fall", "owner");
        eval.template_id = Some(template);
        let eval_id = backend.insert_evaluation(eval).unwrap();

        assert_eq!(
            backend.children(EntityRef::evaluation(eval_id)).await.unwrap(),
            vec![EntityRef::template(template)]
        );
        assert_eq!(
            backend.children(EntityRef::template(template)).await.unwrap(),
            vec![EntityRef::item(item)]
        );
        assert_eq!(
            backend.children(EntityRef::item(item)).await.unwrap(),
            vec![EntityRef::scale(scale)]
        );

        assert!(backend.locked_parents(EntityRef::scale(scale)).await.unwrap().is_empty());
        backend.set_locked_flag(EntityRef::item(item), true).await.unwrap();
        assert_eq!(
            backend.locked_parents(EntityRef::scale(scale)).await.unwrap(),
            vec![EntityRef::item(item)]
        );
        assert!(backend.is_locked(EntityRef::scale(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_ttl_past_calendar_end_rejected() {
        let backend = MemoryBackend::new();
        let ttl = StdDuration::from_secs(10_000_000_000_000);
        assert!(matches!(
            backend.obtain("X", "A", ttl).await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
        assert!(backend.obtain("X", "B", StdDuration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_leaves_lock_flag_alone() {
        let backend = MemoryBackend::new();
        let id = backend.insert_evaluation(Evaluation::new("Spring", "owner")).unwrap();
        let mut stale = backend.get_by_id(id).await.unwrap().unwrap();

        backend.set_locked_flag(EntityRef::evaluation(id), true).await.unwrap();
        stale.title = "Spring (revised)".into();
        backend.save(&stale).await.unwrap();

        let stored = backend.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Spring (revised)");
        assert!(stored.locked);

        assert!(backend.mark_available_sent(id).await.unwrap());
        assert!(backend.get_by_id(id).await.unwrap().unwrap().available_email_sent);
        assert!(!backend.mark_available_sent(id + 1).await.unwrap());
        stale.id = Some(id + 1);
        assert!(matches!(backend.save(&stale).await, Err(EvalFlowError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_template_item_join_is_unique() {
        let backend = MemoryBackend::new();
        let scale = backend.insert_scale("Agreement", &["agree", "disagree"]).unwrap();
        let item = backend.insert_item("Pace?", ItemKind::Scaled { scale_id: scale }).unwrap();
        let template = backend.insert_template("Course", "owner").unwrap();
        backend.add_template_item(template, item, 1, None).unwrap();
        backend.add_template_item(template, item, 4, None).unwrap();

        assert_eq!(
            backend.children(EntityRef::template(template)).await.unwrap(),
            vec![EntityRef::item(item)]
        );
    }
}
