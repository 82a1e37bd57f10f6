//! # EvalFlow Scheduler
//!
//! Date-driven lifecycle scheduling for evaluations.
//! Every state is derived from an evaluation's dates; the scheduler keeps at
//! most one job of each kind per evaluation and fires them as dates pass.
//!
//! ## Design Principles
//! - State is computed, never trusted: `PARTIAL` and `DELETED` are the only stored states
//! - SQLite persistence, shared by every server process
//! - Tokio timers only, idle between ticks
//! - Cluster-wide work guarded by a TTL lock
//!
//! ## Architecture
//! ```text
//! admin change ──► JobCoordinator::on_evaluation_change
//!                    ├── StateResolver (state.rs)
//!                    ├── reconcile job dates (delete + create)
//!                    └── ReminderPolicy → next reminder
//!
//! JobEngine (tokio interval)
//!   └── due jobs → claim → JobCoordinator::on_job_fired
//!                    ├── CREATED / ACTIVE / REMINDER / DUE / CLOSED
//!                    ├── VIEWABLE(_INSTRUCTORS|_STUDENTS) → results mail
//!                    ├── NotificationSender → Webhook | Log
//!                    └── LockCascade (evaluation → template → items → scales)
//!
//! BatchNotificationRunner (tokio interval, consolidated mode)
//!   └── DistributedLock → available digest + reminder digest → release
//! ```

pub mod batch;
pub mod cascade;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod memory;
pub mod notify;
pub mod persistence;
pub mod reminder;
pub mod state;

pub use batch::{BatchNotificationRunner, BatchOutcome};
pub use cascade::LockCascade;
pub use coordinator::{Collaborators, JobCoordinator};
pub use dispatch::WebhookNotifier;
pub use engine::{EngineStats, FireOutcome, JobEngine};
pub use memory::MemoryBackend;
pub use notify::{LoggingNotifier, NotificationKind, NotifyLog, SentNotification};
pub use persistence::SchedulerDb;
pub use reminder::{ConsolidatedPolicy, PerEvaluationPolicy, ReminderPolicy};
