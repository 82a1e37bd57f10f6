//! SQLite-backed shared store for evaluations, scheduled jobs, the entity lock
//! graph, cluster locks and runtime settings in one database file.
//! Every server process opens the same file; WAL mode lets them read while one writes.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::settings::{SettingKey, SettingsProvider};
use evalflow_core::traits::lock::check_lock_args;
use evalflow_core::traits::{
    Clock, DistributedLock, EvaluationStore, JobStore, LockGraph, SystemClock,
};
use evalflow_core::types::{
    EntityKind, EntityRef, EvalId, EvalState, Evaluation, Item, ItemKind, JobId, JobType,
    ScheduledJob,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Timestamps are stored as RFC 3339 UTC with millisecond precision, so
/// lexical order is time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = EvalFlowError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

const EVAL_COLUMNS: &str = "id, eid, title, owner, template_id, start_date, due_date, stop_date, \
     view_date, instructor_view_date, student_view_date, reminder_days_interval, state, \
     results_sharing, instructor_view_results, student_view_results, auth_control, locked, \
     available_email_sent";

fn row_to_evaluation(row: &Row<'_>) -> rusqlite::Result<Evaluation> {
    Ok(Evaluation {
        id: Some(row.get(0)?),
        eid: row.get(1)?,
        title: row.get(2)?,
        owner: row.get(3)?,
        template_id: row.get(4)?,
        start_date: ts_col(row, 5)?,
        due_date: ts_col(row, 6)?,
        stop_date: ts_col(row, 7)?,
        view_date: ts_col(row, 8)?,
        instructor_view_date: ts_col(row, 9)?,
        student_view_date: ts_col(row, 10)?,
        reminder_days_interval: row.get(11)?,
        state: parse_col(row, 12)?,
        results_sharing: parse_col(row, 13)?,
        instructor_view_results: row.get(14)?,
        student_view_results: row.get(15)?,
        auth_control: parse_col(row, 16)?,
        locked: row.get(17)?,
        available_email_sent: row.get(18)?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: row.get(0)?,
        run_at: ts_col(row, 1)?.ok_or(rusqlite::Error::InvalidColumnType(
            1,
            "run_at".into(),
            Type::Null,
        ))?,
        eval_id: row.get(2)?,
        job_type: parse_col(row, 3)?,
    })
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Scale => "scales",
        EntityKind::Item => "items",
        EntityKind::Template => "templates",
        EntityKind::Evaluation => "evaluations",
    }
}

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| EvalFlowError::store(format!("DB open error: {e}")))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| EvalFlowError::store(format!("DB pragma error: {e}")))?;

        let db = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        db.migrate()?;
        tracing::debug!("🗄️ Scheduler DB ready at {}", path.display());
        Ok(db)
    }

    /// Judge lock expiry against `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EvalFlowError::store("DB connection mutex poisoned"))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                eid TEXT,                           -- external id, imports only
                title TEXT NOT NULL,
                owner TEXT NOT NULL,
                template_id INTEGER,
                start_date TEXT,
                due_date TEXT,
                stop_date TEXT,
                view_date TEXT,
                instructor_view_date TEXT,
                student_view_date TEXT,
                reminder_days_interval INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'PARTIAL',
                results_sharing TEXT NOT NULL DEFAULT 'visible',
                instructor_view_results INTEGER NOT NULL DEFAULT 1,
                student_view_results INTEGER NOT NULL DEFAULT 0,
                auth_control TEXT NOT NULL DEFAULT 'auth_required',
                locked INTEGER NOT NULL DEFAULT 0,
                available_email_sent INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_evaluations_state ON evaluations(state);
            CREATE INDEX IF NOT EXISTS idx_evaluations_template ON evaluations(template_id);

            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_at TEXT NOT NULL,
                eval_id INTEGER NOT NULL,
                job_type TEXT NOT NULL              -- 'created', 'active', 'reminder', ...
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_run_at ON scheduled_jobs(run_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_eval ON scheduled_jobs(eval_id, job_type);

            CREATE TABLE IF NOT EXISTS scales (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                options TEXT NOT NULL DEFAULT '[]', -- JSON array
                locked INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                text TEXT NOT NULL,
                classification TEXT NOT NULL,       -- 'scaled', 'block', 'text', 'header'
                block_parent INTEGER NOT NULL DEFAULT 0,
                scale_id INTEGER REFERENCES scales(id),
                locked INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_items_scale ON items(scale_id);

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                owner TEXT NOT NULL,
                locked INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS template_items (
                template_id INTEGER NOT NULL REFERENCES templates(id) ON DELETE CASCADE,
                item_id INTEGER NOT NULL REFERENCES items(id),
                display_order INTEGER NOT NULL DEFAULT 0,
                block_parent_id INTEGER,
                PRIMARY KEY (template_id, item_id)
            );
            CREATE INDEX IF NOT EXISTS idx_template_items_item ON template_items(item_id);

            -- Cluster locks
            CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| EvalFlowError::store(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Authoring data ──────────────────────────────────────

    /// Insert (or replace, when `eval.id` is set) an evaluation. Returns its id.
    pub fn insert_evaluation(&self, eval: &Evaluation) -> Result<EvalId> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT OR REPLACE INTO evaluations ({EVAL_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        );
        write_evaluation(&conn, &sql, eval)
            .map_err(|e| EvalFlowError::store(format!("Insert evaluation: {e}")))?;
        Ok(eval.id.unwrap_or_else(|| conn.last_insert_rowid()))
    }

    pub fn insert_scale(&self, title: &str, options: &[&str]) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scales (title, options) VALUES (?1, ?2)",
            params![title, serde_json::to_string(options)?],
        )
        .map_err(|e| EvalFlowError::store(format!("Insert scale: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_item(&self, text: &str, kind: ItemKind) -> Result<i64> {
        let (classification, block_parent, scale_id) = kind.to_columns();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO items (text, classification, block_parent, scale_id) VALUES (?1, ?2, ?3, ?4)",
            params![text, classification, block_parent, scale_id],
        )
        .map_err(|e| EvalFlowError::store(format!("Insert item: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Load an item, validating its stored classification columns.
    pub fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, text, classification, block_parent, scale_id, locked FROM items WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| EvalFlowError::store(format!("Load item: {e}")))?;

        let Some((id, text, classification, block_parent, scale_id, locked)) = row else {
            return Ok(None);
        };
        let kind = ItemKind::from_columns(&classification, block_parent, scale_id)
            .map_err(|e| EvalFlowError::Validation(format!("item {id}: {e}")))?;
        Ok(Some(Item {
            id: Some(id),
            text,
            kind,
            locked,
        }))
    }

    pub fn insert_template(&self, title: &str, owner: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO templates (title, owner) VALUES (?1, ?2)",
            params![title, owner],
        )
        .map_err(|e| EvalFlowError::store(format!("Insert template: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_template_item(
        &self,
        template_id: i64,
        item_id: i64,
        display_order: i32,
        block_parent_id: Option<i64>,
    ) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO template_items (template_id, item_id, display_order, block_parent_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![template_id, item_id, display_order, block_parent_id],
            )
            .map_err(|e| EvalFlowError::store(format!("Add template item: {e}")))?;
        Ok(())
    }

    /// Every job for one evaluation, ordered by run time.
    pub fn jobs_for(&self, eval_id: EvalId) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_at, eval_id, job_type FROM scheduled_jobs
                 WHERE eval_id = ?1 ORDER BY run_at, id",
            )
            .map_err(|e| EvalFlowError::store(format!("List jobs: {e}")))?;
        let jobs = stmt
            .query_map(params![eval_id], row_to_job)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| EvalFlowError::store(format!("List jobs: {e}")))?;
        Ok(jobs)
    }

    /// Write configured setting values, overriding what is stored.
    pub fn seed_settings(&self, pairs: &[(SettingKey, String)]) -> Result<()> {
        for (key, value) in pairs {
            self.set(key.name, value)?;
        }
        if !pairs.is_empty() {
            tracing::info!("⚙️ Seeded {} setting(s) from config", pairs.len());
        }
        Ok(())
    }

    fn ids(&self, sql: &str, id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| EvalFlowError::store(format!("Lock graph query: {e}")))?;
        let ids = stmt
            .query_map(params![id], |row| row.get::<_, Option<i64>>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| EvalFlowError::store(format!("Lock graph query: {e}")))?;
        Ok(ids.into_iter().flatten().collect())
    }
}

fn write_evaluation(conn: &Connection, sql: &str, eval: &Evaluation) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            eval.id,
            eval.eid,
            eval.title,
            eval.owner,
            eval.template_id,
            eval.start_date.map(ts),
            eval.due_date.map(ts),
            eval.stop_date.map(ts),
            eval.view_date.map(ts),
            eval.instructor_view_date.map(ts),
            eval.student_view_date.map(ts),
            eval.reminder_days_interval,
            eval.state.as_str(),
            eval.results_sharing.as_str(),
            eval.instructor_view_results,
            eval.student_view_results,
            eval.auth_control.as_str(),
            eval.locked,
            eval.available_email_sent,
        ],
    )
}

// ─── Evaluations ──────────────────────────────────────

#[async_trait]
impl EvaluationStore for SchedulerDb {
    async fn get_by_id(&self, id: EvalId) -> Result<Option<Evaluation>> {
        self.conn()?
            .query_row(
                &format!("SELECT {EVAL_COLUMNS} FROM evaluations WHERE id = ?1"),
                params![id],
                row_to_evaluation,
            )
            .optional()
            .map_err(|e| EvalFlowError::store(format!("Load evaluation {id}: {e}")))
    }

    async fn save(&self, eval: &Evaluation) -> Result<()> {
        let id = eval
            .id
            .ok_or_else(|| EvalFlowError::invalid_argument("cannot save an evaluation without id"))?;
        // `locked` is written only through the lock graph
        let changed = self
            .conn()?
            .execute(
                "UPDATE evaluations SET eid = ?2, title = ?3, owner = ?4, template_id = ?5,
                    start_date = ?6, due_date = ?7, stop_date = ?8, view_date = ?9,
                    instructor_view_date = ?10, student_view_date = ?11,
                    reminder_days_interval = ?12, state = ?13, results_sharing = ?14,
                    instructor_view_results = ?15, student_view_results = ?16,
                    auth_control = ?17, available_email_sent = ?18
                 WHERE id = ?1",
                params![
                    id,
                    eval.eid,
                    eval.title,
                    eval.owner,
                    eval.template_id,
                    eval.start_date.map(ts),
                    eval.due_date.map(ts),
                    eval.stop_date.map(ts),
                    eval.view_date.map(ts),
                    eval.instructor_view_date.map(ts),
                    eval.student_view_date.map(ts),
                    eval.reminder_days_interval,
                    eval.state.as_str(),
                    eval.results_sharing.as_str(),
                    eval.instructor_view_results,
                    eval.student_view_results,
                    eval.auth_control.as_str(),
                    eval.available_email_sent,
                ],
            )
            .map_err(|e| EvalFlowError::store(format!("Save evaluation {id}: {e}")))?;
        if changed == 0 {
            return Err(EvalFlowError::not_found(format!("evaluation {id}")));
        }
        Ok(())
    }

    async fn mark_available_sent(&self, id: EvalId) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE evaluations SET available_email_sent = 1 WHERE id = ?1",
                params![id],
            )
            .map_err(|e| EvalFlowError::store(format!("Mark evaluation {id} available: {e}")))?;
        Ok(changed > 0)
    }

    async fn exists(&self, id: EvalId) -> Result<bool> {
        let found = self
            .conn()?
            .query_row("SELECT 1 FROM evaluations WHERE id = ?1", params![id], |_| Ok(()))
            .optional()
            .map_err(|e| EvalFlowError::store(format!("Check evaluation {id}: {e}")))?;
        Ok(found.is_some())
    }

    async fn list_in_state(&self, state: EvalState) -> Result<Vec<Evaluation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVAL_COLUMNS} FROM evaluations WHERE state = ?1 ORDER BY id"
            ))
            .map_err(|e| EvalFlowError::store(format!("List evaluations: {e}")))?;
        let evals = stmt
            .query_map(params![state.as_str()], row_to_evaluation)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| EvalFlowError::store(format!("List evaluations: {e}")))?;
        Ok(evals)
    }
}

// ─── Scheduled jobs ──────────────────────────────────────

#[async_trait]
impl JobStore for SchedulerDb {
    async fn create(&self, run_at: DateTime<Utc>, eval_id: EvalId, job_type: JobType) -> Result<JobId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scheduled_jobs (run_at, eval_id, job_type) VALUES (?1, ?2, ?3)",
            params![ts(run_at), eval_id, job_type.as_str()],
        )
        .map_err(|e| EvalFlowError::store(format!("Create job: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn find(&self, eval_id: EvalId, job_type: JobType) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_at, eval_id, job_type FROM scheduled_jobs
                 WHERE eval_id = ?1 AND job_type = ?2 ORDER BY id",
            )
            .map_err(|e| EvalFlowError::store(format!("Find jobs: {e}")))?;
        let jobs = stmt
            .query_map(params![eval_id, job_type.as_str()], row_to_job)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| EvalFlowError::store(format!("Find jobs: {e}")))?;
        Ok(jobs)
    }

    async fn delete(&self, job_id: JobId) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![job_id])
            .map_err(|e| EvalFlowError::store(format!("Delete job {job_id}: {e}")))?;
        Ok(removed > 0)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_at, eval_id, job_type FROM scheduled_jobs
                 WHERE run_at <= ?1 ORDER BY run_at, id LIMIT ?2",
            )
            .map_err(|e| EvalFlowError::store(format!("Due jobs: {e}")))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = stmt
            .query_map(params![ts(now), limit], row_to_job)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| EvalFlowError::store(format!("Due jobs: {e}")))?;
        Ok(jobs)
    }
}

// ─── Entity lock graph ──────────────────────────────────────

#[async_trait]
impl LockGraph for SchedulerDb {
    async fn is_locked(&self, entity: EntityRef) -> Result<Option<bool>> {
        let Some(id) = entity.id else { return Ok(None) };
        self.conn()?
            .query_row(
                &format!("SELECT locked FROM {} WHERE id = ?1", table(entity.kind)),
                params![id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(|e| EvalFlowError::store(format!("Read lock flag of {entity}: {e}")))
    }

    async fn set_locked_flag(&self, entity: EntityRef, locked: bool) -> Result<()> {
        let id = entity
            .id
            .ok_or_else(|| EvalFlowError::invalid_argument(format!("{entity} is not persisted")))?;
        let changed = self
            .conn()?
            .execute(
                &format!("UPDATE {} SET locked = ?1 WHERE id = ?2", table(entity.kind)),
                params![locked, id],
            )
            .map_err(|e| EvalFlowError::store(format!("Write lock flag of {entity}: {e}")))?;
        if changed == 0 {
            return Err(EvalFlowError::not_found(entity.to_string()));
        }
        Ok(())
    }

    async fn children(&self, entity: EntityRef) -> Result<Vec<EntityRef>> {
        let Some(id) = entity.id else { return Ok(Vec::new()) };
        let children = match entity.kind {
            EntityKind::Evaluation => self
                .ids("SELECT template_id FROM evaluations WHERE id = ?1", id)?
                .into_iter()
                .map(EntityRef::template)
                .collect(),
            EntityKind::Template => self
                .ids(
                    "SELECT DISTINCT item_id FROM template_items WHERE template_id = ?1 ORDER BY item_id",
                    id,
                )?
                .into_iter()
                .map(EntityRef::item)
                .collect(),
            EntityKind::Item => self
                .get_item(id)?
                .and_then(|item| item.kind.scale_id())
                .map(EntityRef::scale)
                .into_iter()
                .collect(),
            EntityKind::Scale => Vec::new(),
        };
        Ok(children)
    }

    async fn locked_parents(&self, entity: EntityRef) -> Result<Vec<EntityRef>> {
        let Some(id) = entity.id else { return Ok(Vec::new()) };
        let parents = match entity.kind {
            EntityKind::Scale => {
                let mut items = Vec::new();
                for item_id in self.ids(
                    "SELECT id FROM items WHERE scale_id = ?1 AND locked = 1 ORDER BY id",
                    id,
                )? {
                    if let Some(item) = self.get_item(item_id)? {
                        if item.kind.scale_id() == Some(id) {
                            items.push(EntityRef::item(item_id));
                        }
                    }
                }
                items
            }
            EntityKind::Item => self
                .ids(
                    "SELECT DISTINCT t.id FROM templates t
                     JOIN template_items ti ON ti.template_id = t.id
                     WHERE ti.item_id = ?1 AND t.locked = 1 ORDER BY t.id",
                    id,
                )?
                .into_iter()
                .map(EntityRef::template)
                .collect(),
            EntityKind::Template => self
                .ids(
                    "SELECT id FROM evaluations WHERE template_id = ?1 AND locked = 1 ORDER BY id",
                    id,
                )?
                .into_iter()
                .map(EntityRef::evaluation)
                .collect(),
            EntityKind::Evaluation => Vec::new(),
        };
        Ok(parents)
    }
}

// ─── Cluster locks ──────────────────────────────────────

#[async_trait]
impl DistributedLock for SchedulerDb {
    async fn obtain(&self, name: &str, holder: &str, ttl: StdDuration) -> Result<bool> {
        check_lock_args(name, holder)?;
        let now = self.clock.now();
        let ttl = Duration::from_std(ttl).map_err(|e| EvalFlowError::invalid_argument(e.to_string()))?;
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| EvalFlowError::invalid_argument(format!("lock ttl out of range: {ttl}")))?;

        // one statement: insert, take over an expired record, or refresh our own
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                 WHERE locks.expires_at <= ?4 OR locks.holder = excluded.holder",
                params![name, holder, ts(expires_at), ts(now)],
            )
            .map_err(|e| EvalFlowError::store(format!("Obtain lock '{name}': {e}")))?;
        if changed == 1 {
            tracing::debug!("🔑 Lock '{}' held by {}", name, holder);
        }
        Ok(changed == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        check_lock_args(name, holder)?;
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .map_err(|e| EvalFlowError::store(format!("Release lock '{name}': {e}")))?;
        Ok(removed > 0)
    }
}

// ─── Settings ──────────────────────────────────────

impl SettingsProvider for SchedulerDb {
    fn get(&self, name: &str) -> Option<String> {
        let conn = match self.conn() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("⚠️ Setting {} unreadable: {}", name, e);
                return None;
            }
        };
        conn.query_row(
            "SELECT value FROM settings WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            tracing::warn!("⚠️ Setting {} unreadable: {}", name, e);
            None
        })
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO settings (name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![name, value, ts(Utc::now())],
            )
            .map_err(|e| EvalFlowError::store(format!("Write setting {name}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::LockCascade;
    use chrono::TimeZone;
    use evalflow_core::settings;
    use std::path::PathBuf;

    struct TempDb {
        db: SchedulerDb,
        path: PathBuf,
    }

    impl TempDb {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "evalflow-{name}-{}.db",
                unique_suffix()
            ));
            let db = SchedulerDb::open(&path).unwrap();
            Self { db, path }
        }

        fn reopen(&self) -> SchedulerDb {
            SchedulerDb::open(&self.path).unwrap()
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut p = self.path.clone().into_os_string();
                p.push(suffix);
                std::fs::remove_file(PathBuf::from(p)).ok();
            }
        }
    }

    fn unique_suffix() -> String {
        format!(
            "{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        )
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 30, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn test_open_and_migrate_twice() {
        let t = TempDb::new("migrate");
        let again = t.reopen();
        assert!(again.jobs_for(1).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evaluation_store() {
        let t = TempDb::new("evals");
        let mut eval = Evaluation::new("Spring survey", "dean")
            .with_dates(day(0), Some(day(10)), None, Some(day(20)));
        eval.state = EvalState::Active;
        eval.reminder_days_interval = -1;
        let id = t.db.insert_evaluation(&eval).unwrap();

        let mut loaded = t.db.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.due_date, Some(day(10)));
        assert_eq!(loaded.stop_date, None);
        assert_eq!(loaded.state, EvalState::Active);

        loaded.available_email_sent = true;
        loaded.state = EvalState::Closed;
        t.db.save(&loaded).await.unwrap();
        assert!(t.db.list_in_state(EvalState::Active).await.unwrap().is_empty());
        assert_eq!(t.db.list_in_state(EvalState::Closed).await.unwrap(), vec![loaded]);

        assert!(t.db.exists(id).await.unwrap());
        assert!(!t.db.exists(id + 1).await.unwrap());

        let mut ghost = Evaluation::new("ghost", "dean");
        ghost.id = Some(999);
        assert!(matches!(t.db.save(&ghost).await, Err(EvalFlowError::NotFound(_))));
        assert!(!t.db.mark_available_sent(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_does_not_touch_lock_flag() {
        let t = TempDb::new("evals-locked");
        let id = t.db.insert_evaluation(&Evaluation::new("Spring survey", "dean")).unwrap();
        let mut stale = t.db.get_by_id(id).await.unwrap().unwrap();

        // another process locks it after our read
        t.reopen().set_locked_flag(EntityRef::evaluation(id), true).await.unwrap();
        stale.title = "Spring survey (revised)".into();
        t.db.save(&stale).await.unwrap();
        assert!(t.db.mark_available_sent(id).await.unwrap());

        let stored = t.db.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Spring survey (revised)");
        assert!(stored.locked);
        assert!(stored.available_email_sent);
    }

    #[tokio::test]
    async fn test_jobs_due_in_time_order() {
        let t = TempDb::new("jobs");
        let late = t.db.create(day(3), 1, JobType::Due).await.unwrap();
        let early = t.db.create(day(1), 2, JobType::Active).await.unwrap();
        t.db.create(day(9), 1, JobType::Closed).await.unwrap();

        let due = t.db.due(day(5), 10).await.unwrap();
        assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![early, late]);
        assert_eq!(due[1].job_type, JobType::Due);
        assert_eq!(due[1].run_at, day(3));

        assert!(t.db.delete(late).await.unwrap());
        assert!(!t.db.delete(late).await.unwrap());
        assert!(t.db.find(1, JobType::Due).await.unwrap().is_empty());
        assert_eq!(t.db.jobs_for(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_exclusion_across_handles() {
        let t = TempDb::new("locks");
        let other = t.reopen();
        let ttl = StdDuration::from_millis(10_000);

        assert!(t.db.obtain("X", "A", ttl).await.unwrap());
        assert!(!other.obtain("X", "B", ttl).await.unwrap());
        assert!(other.obtain("X", "A", ttl).await.unwrap());
        assert!(!other.release("X", "B").await.unwrap());
        assert!(t.db.release("X", "A").await.unwrap());
        assert!(other.obtain("X", "B", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_ttl_expiry() {
        let t = TempDb::new("lock-ttl");
        let ttl = StdDuration::from_millis(100);
        assert!(t.db.obtain("X", "A", ttl).await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        assert!(t.db.obtain("X", "B", ttl).await.unwrap());
        assert!(!t.db.release("X", "A").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expiry_follows_clock() {
        let t = TempDb::new("lock-clock");
        let clock = Arc::new(evalflow_core::traits::ManualClock::new(day(0)));
        let db = t.reopen().with_clock(clock.clone());
        let ttl = StdDuration::from_secs(1800);

        assert!(db.obtain("digest", "node-a", ttl).await.unwrap());
        clock.advance(Duration::minutes(29));
        assert!(!db.obtain("digest", "node-b", ttl).await.unwrap());
        clock.advance(Duration::minutes(1));
        assert!(db.obtain("digest", "node-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_rejects_empty_arguments() {
        let t = TempDb::new("lock-args");
        let ttl = StdDuration::from_secs(1);
        assert!(matches!(
            t.db.obtain("X", "", ttl).await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.db.release("", "A").await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
        assert!(matches!(
            t.db.obtain("X", "A", StdDuration::from_secs(10_000_000_000_000)).await,
            Err(EvalFlowError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_cascade_over_sqlite_graph() {
        let t = TempDb::new("cascade");
        let scale = t.db.insert_scale("Frequency", &["never", "often"]).unwrap();
        let block = t.db.insert_item("Labs", ItemKind::BlockParent { scale_id: scale }).unwrap();
        let child = t.db.insert_item("Lab 1", ItemKind::Scaled { scale_id: scale }).unwrap();
        let template = t.db.insert_template("Lab course", "dean").unwrap();
        t.db.add_template_item(template, block, 1, None).unwrap();
        t.db.add_template_item(template, child, 2, Some(block)).unwrap();
        let mut eval = Evaluation::new("Lab feedback", "dean");
        eval.template_id = Some(template);
        let eval_id = t.db.insert_evaluation(&eval).unwrap();

        let db = Arc::new(t.reopen());
        let cascade = LockCascade::new(db.clone());
        assert!(cascade.set_locked(EntityRef::evaluation(eval_id), true).await.unwrap());
        assert_eq!(db.is_locked(EntityRef::scale(scale)).await.unwrap(), Some(true));
        assert_eq!(
            db.locked_parents(EntityRef::scale(scale)).await.unwrap(),
            vec![EntityRef::item(block), EntityRef::item(child)]
        );

        assert!(!cascade.set_locked(EntityRef::item(child), false).await.unwrap());
        assert!(cascade.set_locked(EntityRef::evaluation(eval_id), false).await.unwrap());
        assert_eq!(db.is_locked(EntityRef::item(child)).await.unwrap(), Some(false));
        assert_eq!(db.is_locked(EntityRef::scale(scale)).await.unwrap(), Some(false));
    }

    #[test]
    fn test_item_columns_validated_on_load() {
        let t = TempDb::new("items");
        let scale = t.db.insert_scale("Agree", &["a", "b"]).unwrap();
        let item = t.db.insert_item("Block", ItemKind::BlockParent { scale_id: scale }).unwrap();
        assert_eq!(
            t.db.get_item(item).unwrap().unwrap().kind,
            ItemKind::BlockParent { scale_id: scale }
        );

        t.db.conn()
            .unwrap()
            .execute("UPDATE items SET block_parent = 0 WHERE id = ?1", params![item])
            .unwrap();
        assert!(matches!(t.db.get_item(item), Err(EvalFlowError::Validation(_))));
        assert!(t.db.get_item(item + 100).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_graph_rejects_malformed_item() {
        let t = TempDb::new("items-graph");
        let scale = t.db.insert_scale("Agree", &["a", "b"]).unwrap();
        let item = t.db.insert_item("Pace", ItemKind::Scaled { scale_id: scale }).unwrap();
        let template = t.db.insert_template("Course", "dean").unwrap();
        t.db.add_template_item(template, item, 1, None).unwrap();
        let mut eval = Evaluation::new("Fall", "dean");
        eval.template_id = Some(template);
        let eval_id = t.db.insert_evaluation(&eval).unwrap();

        // a text item may not point at a scale
        t.db.conn()
            .unwrap()
            .execute("UPDATE items SET classification = 'text' WHERE id = ?1", params![item])
            .unwrap();
        assert!(matches!(
            t.db.children(EntityRef::item(item)).await,
            Err(EvalFlowError::Validation(_))
        ));
        let cascade = LockCascade::new(Arc::new(t.reopen()));
        assert!(matches!(
            cascade.set_locked(EntityRef::evaluation(eval_id), true).await,
            Err(EvalFlowError::Validation(_))
        ));

        t.db.set_locked_flag(EntityRef::item(item), true).await.unwrap();
        assert!(matches!(
            t.db.locked_parents(EntityRef::scale(scale)).await,
            Err(EvalFlowError::Validation(_))
        ));
    }

    #[test]
    fn test_settings_seed_and_read() {
        let t = TempDb::new("settings");
        assert!(!t.db.get_bool(settings::CONSOLIDATED_ENABLED));
        t.db.seed_settings(&[(settings::CONSOLIDATED_ENABLED, "true".into())])
            .unwrap();
        assert!(t.reopen().get_bool(settings::CONSOLIDATED_ENABLED));
        t.db.set(settings::CREATED_WAIT_SECS.name, "30").unwrap();
        assert_eq!(t.db.get_i64(settings::CREATED_WAIT_SECS), 30);
    }
}
