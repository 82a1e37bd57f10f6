//! Notification log — records what went out and to whom.
//! `LoggingNotifier` is the default sender when no webhook is configured.

use std::sync::Mutex;

use async_trait::async_trait;
use evalflow_core::error::Result;
use evalflow_core::traits::{GroupMembershipSyncer, NotificationSender};
use evalflow_core::types::{DigestKind, EvalId, JobType, ReminderAudience};
use serde::{Deserialize, Serialize};

/// What kind of notification was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Created { include_owner: bool },
    Available { include_evaluatees: bool },
    Reminder { audience: ReminderAudience },
    Results {
        include_evaluatees: bool,
        include_admins: bool,
        job_type: JobType,
    },
    Digest { digest: DigestKind },
}

/// A sent notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentNotification {
    pub kind: NotificationKind,
    /// Evaluations covered; one entry except for digests.
    pub eval_ids: Vec<EvalId>,
    pub recipients: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// In-memory ring buffer of the last [`NotifyLog::CAPACITY`] notifications.
pub struct NotifyLog {
    history: Mutex<Vec<SentNotification>>,
}

impl NotifyLog {
    pub const CAPACITY: usize = 100;

    pub fn new() -> Self {
        Self {
            history: Mutex::new(Vec::new()),
        }
    }

    /// Record a sent notification in history.
    pub fn record(&self, notification: SentNotification) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(notification);
        // ring buffer, keep the last 100
        if history.len() > Self::CAPACITY {
            history.remove(0);
        }
    }

    /// Snapshot of the notification history, oldest first.
    pub fn history(&self) -> Vec<SentNotification> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifications that covered `eval_id`.
    pub fn for_eval(&self, eval_id: EvalId) -> Vec<SentNotification> {
        self.history()
            .into_iter()
            .filter(|n| n.eval_ids.contains(&eval_id))
            .collect()
    }
}

impl Default for NotifyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs each notification and records it. No mail leaves the process.
#[derive(Default)]
pub struct LoggingNotifier {
    pub log: NotifyLog,
}

impl LoggingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, kind: NotificationKind, eval_ids: &[EvalId]) -> Vec<String> {
        tracing::info!("📬 Notification {:?} for evaluations {:?}", kind, eval_ids);
        self.log.record(SentNotification {
            kind,
            eval_ids: eval_ids.to_vec(),
            recipients: Vec::new(),
            timestamp: chrono::Utc::now(),
        });
        Vec::new()
    }
}

#[async_trait]
impl NotificationSender for LoggingNotifier {
    async fn send_created(&self, eval_id: EvalId, include_owner: bool) -> Result<Vec<String>> {
        Ok(self.emit(NotificationKind::Created { include_owner }, &[eval_id]))
    }

    async fn send_available(
        &self,
        eval_id: EvalId,
        include_evaluatees: bool,
    ) -> Result<Vec<String>> {
        Ok(self.emit(NotificationKind::Available { include_evaluatees }, &[eval_id]))
    }

    async fn send_reminder(
        &self,
        eval_id: EvalId,
        audience: ReminderAudience,
    ) -> Result<Vec<String>> {
        Ok(self.emit(NotificationKind::Reminder { audience }, &[eval_id]))
    }

    async fn send_results(
        &self,
        eval_id: EvalId,
        include_evaluatees: bool,
        include_admins: bool,
        job_type: JobType,
    ) -> Result<Vec<String>> {
        Ok(self.emit(
            NotificationKind::Results {
                include_evaluatees,
                include_admins,
                job_type,
            },
            &[eval_id],
        ))
    }

    async fn send_digest(&self, kind: DigestKind, eval_ids: &[EvalId]) -> Result<Vec<String>> {
        Ok(self.emit(NotificationKind::Digest { digest: kind }, eval_ids))
    }
}

#[async_trait]
impl GroupMembershipSyncer for LoggingNotifier {
    async fn sync(&self, eval_id: EvalId, group_id: Option<&str>) -> Result<()> {
        tracing::info!("👥 Group sync for evaluation {} ({:?}) skipped, no sync target", eval_id, group_id);
        Ok(())
    }
}
