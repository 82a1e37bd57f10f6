//! Consolidated notification runner.
//!
//! When consolidated mode is on, participants get one digest covering every
//! open evaluation instead of a mail per evaluation. Any number of server
//! processes may run this loop; the distributed lock lets one of them deliver
//! per run.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use evalflow_core::config::BatchConfig;
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::settings::{self, SettingsProvider};
use evalflow_core::traits::{Clock, DistributedLock, EvaluationStore, NotificationSender};
use evalflow_core::types::{AuthControl, DigestKind, EvalId, EvalState, Evaluation};

use crate::state;

/// Result of one runner pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Consolidated mode is off.
    Disabled,
    /// Another process holds the lock.
    Contended,
    Completed { available: usize, reminded: usize },
}

pub struct BatchNotificationRunner {
    evaluations: Arc<dyn EvaluationStore>,
    notifier: Arc<dyn NotificationSender>,
    settings: Arc<dyn SettingsProvider>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
    holder: String,
    lock_name: String,
    lock_ttl: std::time::Duration,
}

impl BatchNotificationRunner {
    pub fn new(
        evaluations: Arc<dyn EvaluationStore>,
        notifier: Arc<dyn NotificationSender>,
        settings: Arc<dyn SettingsProvider>,
        lock: Arc<dyn DistributedLock>,
        clock: Arc<dyn Clock>,
        config: &BatchConfig,
        holder: &str,
    ) -> Self {
        Self {
            evaluations,
            notifier,
            settings,
            lock,
            clock,
            holder: holder.to_string(),
            lock_name: config.lock_name.clone(),
            lock_ttl: std::time::Duration::from_secs(config.lock_ttl_secs.max(1)),
        }
    }

    /// One pass: take the lock, deliver what is pending, release the lock.
    pub async fn run_once(&self) -> Result<BatchOutcome> {
        if !self.settings.get_bool(settings::CONSOLIDATED_ENABLED) {
            return Ok(BatchOutcome::Disabled);
        }
        if !self
            .lock
            .obtain(&self.lock_name, &self.holder, self.lock_ttl)
            .await?
        {
            tracing::debug!("🔐 Lock '{}' held elsewhere, skipping digest run", self.lock_name);
            return Ok(BatchOutcome::Contended);
        }

        let delivered = self.deliver().await;
        if let Err(e) = self.lock.release(&self.lock_name, &self.holder).await {
            tracing::warn!("⚠️ Failed to release lock '{}': {}", self.lock_name, e);
        }
        delivered
    }

    async fn deliver(&self) -> Result<BatchOutcome> {
        let now = self.clock.now();
        let open = self.open_evaluations(now).await?;

        // ─── Available digest ──────────────────────────────────────
        let fresh: Vec<Evaluation> = open
            .iter()
            .filter(|e| !e.available_email_sent)
            .cloned()
            .collect();
        let fresh_ids = ids(&fresh);
        if !fresh_ids.is_empty() {
            let recipients = self
                .notifier
                .send_digest(DigestKind::Available, &fresh_ids)
                .await?;
            for id in &fresh_ids {
                self.evaluations.mark_available_sent(*id).await?;
            }
            tracing::info!(
                "📨 Available digest for {} evaluation(s) ({} recipients)",
                fresh_ids.len(),
                recipients.len()
            );
        }

        // ─── Reminder digest ──────────────────────────────────────
        let next_at = self.next_reminder_at(now);
        let mut reminded = 0;
        if now >= next_at {
            let pending: Vec<EvalId> = open
                .iter()
                .filter(|e| e.auth_control == AuthControl::AuthRequired)
                .filter_map(|e| e.id)
                .filter(|id| !fresh_ids.contains(id))
                .collect();
            if !pending.is_empty() {
                let recipients = self
                    .notifier
                    .send_digest(DigestKind::Reminder, &pending)
                    .await?;
                reminded = pending.len();
                tracing::info!(
                    "📨 Reminder digest for {} evaluation(s) ({} recipients)",
                    reminded,
                    recipients.len()
                );
            }
            let days = self
                .settings
                .get_i64(settings::CONSOLIDATED_REMINDER_INTERVAL_DAYS)
                .max(1);
            let following = now + Duration::days(days);
            self.settings.set(
                settings::CONSOLIDATED_NEXT_REMINDER_AT.name,
                &following.to_rfc3339_opts(SecondsFormat::Millis, true),
            )?;
            tracing::debug!("⏰ Next reminder digest at {}", following);
        }

        Ok(BatchOutcome::Completed {
            available: fresh_ids.len(),
            reminded,
        })
    }

    /// Evaluations open right now, whatever their stored state says.
    async fn open_evaluations(&self, now: DateTime<Utc>) -> Result<Vec<Evaluation>> {
        let mut open = Vec::new();
        for stored in [EvalState::InQueue, EvalState::Active] {
            for eval in self.evaluations.list_in_state(stored).await? {
                if state::resolve(&eval, true, now) == EvalState::Active {
                    open.push(eval);
                }
            }
        }
        open.sort_by_key(|e| e.id);
        Ok(open)
    }

    fn next_reminder_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let raw = self.settings.get_str(settings::CONSOLIDATED_NEXT_REMINDER_AT);
        if raw.trim().is_empty() {
            return now;
        }
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(at) => at.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!("⚠️ Unreadable next reminder instant '{}': {}, sending now", raw, e);
                now
            }
        }
    }
}

fn ids(evals: &[Evaluation]) -> Vec<EvalId> {
    evals.iter().filter_map(|e| e.id).collect()
}

/// Run the digest pass periodically as a background tokio task body.
pub async fn spawn_batch_runner(runner: Arc<BatchNotificationRunner>, interval_secs: u64) {
    tracing::info!("⏰ Batch notification runner started (every {}s)", interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        match runner.run_once().await {
            Ok(BatchOutcome::Completed { available, reminded }) => {
                if available + reminded > 0 {
                    tracing::info!("📣 Digest run: {} available, {} reminded", available, reminded);
                }
            }
            Ok(_) => {}
            Err(EvalFlowError::Notification(e)) => {
                tracing::warn!("⚠️ Digest delivery failed, will retry next run: {}", e)
            }
            Err(e) => tracing::error!("❌ Digest run failed: {}", e),
        }
    }
}
