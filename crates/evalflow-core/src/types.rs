//! Domain types — evaluations, lifecycle states, scheduled jobs and lockable entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EvalFlowError, Result};

pub type EvalId = i64;
pub type JobId = i64;

// ─── Lifecycle state ──────────────────────────────────────

/// Lifecycle state of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvalState {
    /// Saved but not yet schedulable (missing groups or dates).
    Partial,
    InQueue,
    Active,
    GracePeriod,
    Closed,
    Viewable,
    /// Only ever set explicitly.
    Deleted,
    /// Dates could not be compared.
    Unknown,
}

/// The fixed lifecycle order. `Deleted` and `Unknown` have no position.
pub const LIFECYCLE_ORDER: [EvalState; 6] = [
    EvalState::Partial,
    EvalState::InQueue,
    EvalState::Active,
    EvalState::GracePeriod,
    EvalState::Closed,
    EvalState::Viewable,
];

impl EvalState {
    /// Position in [`LIFECYCLE_ORDER`], `None` for the special states.
    pub fn order_index(self) -> Option<usize> {
        LIFECYCLE_ORDER.iter().position(|s| *s == self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvalState::Partial => "PARTIAL",
            EvalState::InQueue => "INQUEUE",
            EvalState::Active => "ACTIVE",
            EvalState::GracePeriod => "GRACEPERIOD",
            EvalState::Closed => "CLOSED",
            EvalState::Viewable => "VIEWABLE",
            EvalState::Deleted => "DELETED",
            EvalState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for EvalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvalState {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PARTIAL" => Ok(EvalState::Partial),
            "INQUEUE" => Ok(EvalState::InQueue),
            "ACTIVE" => Ok(EvalState::Active),
            "GRACEPERIOD" => Ok(EvalState::GracePeriod),
            "CLOSED" => Ok(EvalState::Closed),
            "VIEWABLE" => Ok(EvalState::Viewable),
            "DELETED" => Ok(EvalState::Deleted),
            "UNKNOWN" => Ok(EvalState::Unknown),
            other => Err(EvalFlowError::invalid_argument(format!("unknown state '{other}'"))),
        }
    }
}

// ─── Jobs ──────────────────────────────────────

/// Kind of scheduled job. At most one job of each kind exists per evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Created,
    Active,
    Reminder,
    Due,
    Closed,
    Viewable,
    ViewableInstructors,
    ViewableStudents,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::Created,
        JobType::Active,
        JobType::Reminder,
        JobType::Due,
        JobType::Closed,
        JobType::Viewable,
        JobType::ViewableInstructors,
        JobType::ViewableStudents,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Created => "created",
            JobType::Active => "active",
            JobType::Reminder => "reminder",
            JobType::Due => "due",
            JobType::Closed => "closed",
            JobType::Viewable => "viewable",
            JobType::ViewableInstructors => "viewable_instructors",
            JobType::ViewableStudents => "viewable_students",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_ascii_lowercase().replace('-', "_");
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| EvalFlowError::invalid_argument(format!("unknown job type '{s}'")))
    }
}

/// A job owned by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub run_at: DateTime<Utc>,
    pub eval_id: EvalId,
    pub job_type: JobType,
}

/// Change applied to an evaluation by an administrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalAction {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for EvalAction {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(EvalAction::Create),
            "update" => Ok(EvalAction::Update),
            "delete" => Ok(EvalAction::Delete),
            other => Err(EvalFlowError::invalid_argument(format!(
                "unrecognized evaluation action '{other}'"
            ))),
        }
    }
}

// ─── Notification vocabulary ──────────────────────────────────────

/// Who receives a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderAudience {
    /// Participants who have not responded yet.
    NonTakers,
    /// Participants with a saved but unsubmitted response.
    Partial,
    All,
}

impl ReminderAudience {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderAudience::NonTakers => "nontakers",
            ReminderAudience::Partial => "partial",
            ReminderAudience::All => "all",
        }
    }
}

impl std::str::FromStr for ReminderAudience {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nontakers" => Ok(ReminderAudience::NonTakers),
            "partial" => Ok(ReminderAudience::Partial),
            "all" => Ok(ReminderAudience::All),
            other => Err(EvalFlowError::invalid_argument(format!(
                "unknown reminder audience '{other}'"
            ))),
        }
    }
}

/// Digest flavour sent by the consolidated batch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestKind {
    Available,
    Reminder,
}

/// Who may see results once viewable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultsSharing {
    /// Owner only.
    Private,
    Visible,
    Public,
}

impl ResultsSharing {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultsSharing::Private => "private",
            ResultsSharing::Visible => "visible",
            ResultsSharing::Public => "public",
        }
    }
}

impl std::str::FromStr for ResultsSharing {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(ResultsSharing::Private),
            "visible" => Ok(ResultsSharing::Visible),
            "public" => Ok(ResultsSharing::Public),
            other => Err(EvalFlowError::invalid_argument(format!(
                "unknown results sharing '{other}'"
            ))),
        }
    }
}

/// How participants identify themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthControl {
    AuthRequired,
    KeyRequired,
    None,
}

impl AuthControl {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthControl::AuthRequired => "auth_required",
            AuthControl::KeyRequired => "key_required",
            AuthControl::None => "none",
        }
    }
}

impl std::str::FromStr for AuthControl {
    type Err = EvalFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auth_required" => Ok(AuthControl::AuthRequired),
            "key_required" => Ok(AuthControl::KeyRequired),
            "none" => Ok(AuthControl::None),
            other => Err(EvalFlowError::invalid_argument(format!(
                "unknown auth control '{other}'"
            ))),
        }
    }
}

/// Typed reading of `reminder_days_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderSchedule {
    Disabled,
    EveryDays(u32),
    /// One reminder 24h before the due date.
    DayBeforeDue,
    /// Every five minutes; testing only.
    FastTest,
}

impl ReminderSchedule {
    pub const DAY_BEFORE_DUE: i32 = -1;
    pub const FAST_TEST: i32 = -2;

    pub fn from_days(days: i32) -> Self {
        match days {
            d if d > 0 => ReminderSchedule::EveryDays(d as u32),
            Self::DAY_BEFORE_DUE => ReminderSchedule::DayBeforeDue,
            Self::FAST_TEST => ReminderSchedule::FastTest,
            _ => ReminderSchedule::Disabled,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != ReminderSchedule::Disabled
    }
}

// ─── Evaluation ──────────────────────────────────────

/// One instance of an evaluation workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// `None` until persisted.
    pub id: Option<EvalId>,
    /// Set only when imported from another system.
    pub eid: Option<String>,
    pub title: String,
    pub owner: String,
    pub template_id: Option<i64>,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub stop_date: Option<DateTime<Utc>>,
    pub view_date: Option<DateTime<Utc>>,
    pub instructor_view_date: Option<DateTime<Utc>>,
    pub student_view_date: Option<DateTime<Utc>>,
    pub reminder_days_interval: i32,
    /// Last computed state; only `Partial` and `Deleted` are authoritative.
    pub state: EvalState,
    pub results_sharing: ResultsSharing,
    pub instructor_view_results: bool,
    pub student_view_results: bool,
    pub auth_control: AuthControl,
    pub locked: bool,
    pub available_email_sent: bool,
}

impl Evaluation {
    /// Create an unsaved, partial evaluation.
    pub fn new(title: &str, owner: &str) -> Self {
        Self {
            id: None,
            eid: None,
            title: title.to_string(),
            owner: owner.to_string(),
            template_id: None,
            start_date: None,
            due_date: None,
            stop_date: None,
            view_date: None,
            instructor_view_date: None,
            student_view_date: None,
            reminder_days_interval: 0,
            state: EvalState::Partial,
            results_sharing: ResultsSharing::Visible,
            instructor_view_results: true,
            student_view_results: false,
            auth_control: AuthControl::AuthRequired,
            locked: false,
            available_email_sent: false,
        }
    }

    pub fn reminder_schedule(&self) -> ReminderSchedule {
        ReminderSchedule::from_days(self.reminder_days_interval)
    }

    /// Due date, else the next later date, else `now`.
    pub fn safe_due_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.due_date
            .or(self.stop_date)
            .or(self.view_date)
            .unwrap_or(now)
    }

    pub fn safe_stop_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.stop_date.or(self.view_date).unwrap_or(now)
    }

    pub fn safe_view_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.view_date.unwrap_or(now)
    }

    /// Date of a separate instructor release, when it does not coincide with the main view date.
    pub fn instructor_release_date(&self) -> Option<DateTime<Utc>> {
        if !self.instructor_view_results {
            return None;
        }
        self.instructor_view_date.filter(|d| Some(*d) != self.view_date)
    }

    /// Date of a separate student release, when it does not coincide with the main view date.
    pub fn student_release_date(&self) -> Option<DateTime<Utc>> {
        if !self.student_view_results {
            return None;
        }
        self.student_view_date.filter(|d| Some(*d) != self.view_date)
    }

    /// Check `start <= due <= stop <= view` over the dates that are present.
    pub fn validate_dates(&self) -> Result<()> {
        let chain = [
            ("start", self.start_date),
            ("due", self.due_date),
            ("stop", self.stop_date),
            ("view", self.view_date),
        ];
        let mut previous: Option<(&str, DateTime<Utc>)> = None;
        for (name, date) in chain {
            let Some(date) = date else { continue };
            if let Some((prev_name, prev)) = previous {
                if date < prev {
                    return Err(EvalFlowError::Validation(format!(
                        "{name} date {date} is before {prev_name} date {prev}"
                    )));
                }
            }
            previous = Some((name, date));
        }
        Ok(())
    }

    /// Convenience for building dated evaluations.
    pub fn with_dates(
        mut self,
        start: DateTime<Utc>,
        due: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        view: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = Some(start);
        self.due_date = due;
        self.stop_date = stop;
        self.view_date = view;
        self
    }
}

// ─── Lockable authoring entities ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Scale,
    Item,
    Template,
    Evaluation,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Scale => write!(f, "scale"),
            EntityKind::Item => write!(f, "item"),
            EntityKind::Template => write!(f, "template"),
            EntityKind::Evaluation => write!(f, "evaluation"),
        }
    }
}

/// Reference to a lockable entity. `id == None` means never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Option<i64>,
}

impl EntityRef {
    pub fn scale(id: i64) -> Self {
        Self { kind: EntityKind::Scale, id: Some(id) }
    }

    pub fn item(id: i64) -> Self {
        Self { kind: EntityKind::Item, id: Some(id) }
    }

    pub fn template(id: i64) -> Self {
        Self { kind: EntityKind::Template, id: Some(id) }
    }

    pub fn evaluation(id: i64) -> Self {
        Self { kind: EntityKind::Evaluation, id: Some(id) }
    }

    pub fn unsaved(kind: EntityKind) -> Self {
        Self { kind, id: None }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}#{}", self.kind, id),
            None => write!(f, "{}#new", self.kind),
        }
    }
}

/// What an item is. A block parent groups child items that share its scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Scaled { scale_id: i64 },
    BlockParent { scale_id: i64 },
    Text,
    Header,
}

impl ItemKind {
    pub fn scale_id(self) -> Option<i64> {
        match self {
            ItemKind::Scaled { scale_id } | ItemKind::BlockParent { scale_id } => Some(scale_id),
            ItemKind::Text | ItemKind::Header => None,
        }
    }

    /// Build from the stored classification string and block-parent flag, rejecting rows
    /// where the two disagree.
    pub fn from_columns(
        classification: &str,
        block_parent: bool,
        scale_id: Option<i64>,
    ) -> Result<Self> {
        let classification = classification.to_ascii_lowercase();
        let is_block = classification == "block";
        if is_block != block_parent {
            return Err(EvalFlowError::Validation(format!(
                "item classification '{classification}' disagrees with block_parent={block_parent}"
            )));
        }
        let need_scale = |kind: &str| {
            scale_id.ok_or_else(|| {
                EvalFlowError::Validation(format!("{kind} item has no scale"))
            })
        };
        match classification.as_str() {
            "block" => Ok(ItemKind::BlockParent { scale_id: need_scale("block")? }),
            "scaled" => Ok(ItemKind::Scaled { scale_id: need_scale("scaled")? }),
            "text" | "header" if scale_id.is_some() => Err(EvalFlowError::Validation(format!(
                "{classification} item must not reference a scale"
            ))),
            "text" => Ok(ItemKind::Text),
            "header" => Ok(ItemKind::Header),
            other => Err(EvalFlowError::Validation(format!(
                "unknown item classification '{other}'"
            ))),
        }
    }

    /// `(classification, block_parent, scale_id)` for storage.
    pub fn to_columns(self) -> (&'static str, bool, Option<i64>) {
        match self {
            ItemKind::Scaled { scale_id } => ("scaled", false, Some(scale_id)),
            ItemKind::BlockParent { scale_id } => ("block", true, Some(scale_id)),
            ItemKind::Text => ("text", false, None),
            ItemKind::Header => ("header", false, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub id: Option<i64>,
    pub title: String,
    pub options: Vec<String>,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Option<i64>,
    pub text: String,
    pub kind: ItemKind,
    pub locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Option<i64>,
    pub title: String,
    pub owner: String,
    pub locked: bool,
}

/// Join between a template and one of its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateItem {
    pub template_id: i64,
    pub item_id: i64,
    pub display_order: i32,
    /// Set for children of a block parent.
    pub block_parent_id: Option<i64>,
}
