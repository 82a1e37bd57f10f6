//! Trigger engine — the loop that delivers due jobs to the coordinator.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).
//!
//! A job is claimed by deleting it; only the process whose delete removed the
//! row fires it. A failed fire is put back after the retry delay, so delivery
//! is at-least-once.

use std::sync::Arc;

use chrono::Duration;
use evalflow_core::config::SchedulerConfig;
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::traits::{Clock, JobStore};
use evalflow_core::types::ScheduledJob;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::coordinator::JobCoordinator;

/// What happened to one due job.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Fired,
    /// Failed; re-queued for a later tick.
    Retried(String),
    /// Failed permanently; dropped.
    Dropped(String),
    /// Another process claimed it first.
    Skipped,
}

/// Running totals since the engine started.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub ticks: u64,
    pub fired: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Errors worth another delivery attempt.
fn is_retryable(e: &EvalFlowError) -> bool {
    matches!(
        e,
        EvalFlowError::Notification(_) | EvalFlowError::Store(_) | EvalFlowError::Io(_)
    )
}

/// Polls the job store and fires what is due.
pub struct JobEngine {
    coordinator: Arc<JobCoordinator>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    retry_delay: Duration,
    stats: EngineStats,
}

impl JobEngine {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        jobs: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            coordinator,
            jobs,
            clock,
            batch_size: config.batch_size.max(1),
            retry_delay: Duration::seconds(config.retry_delay_secs.max(1)),
            stats: EngineStats::default(),
        }
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Claim and fire every due job, up to the batch size.
    pub async fn tick(&mut self) -> Result<Vec<(ScheduledJob, FireOutcome)>> {
        self.stats.ticks += 1;
        let now = self.clock.now();
        let due = self.jobs.due(now, self.batch_size).await?;
        let mut results = Vec::with_capacity(due.len());

        for job in due {
            if !self.jobs.delete(job.id).await? {
                tracing::debug!("Job {} already claimed elsewhere", job.id);
                self.stats.skipped += 1;
                results.push((job, FireOutcome::Skipped));
                continue;
            }

            let outcome = match self.coordinator.on_job_fired(job.eval_id, job.job_type).await {
                Ok(()) => {
                    self.stats.fired += 1;
                    FireOutcome::Fired
                }
                Err(e) if is_retryable(&e) => {
                    self.stats.failed += 1;
                    let retry_at = now + self.retry_delay;
                    tracing::warn!(
                        "⚠️ {} job for evaluation {} failed, retry at {}: {}",
                        job.job_type,
                        job.eval_id,
                        retry_at,
                        e
                    );
                    // the handler may already have re-planned this type
                    if self.jobs.find(job.eval_id, job.job_type).await?.is_empty() {
                        self.jobs.create(retry_at, job.eval_id, job.job_type).await?;
                    }
                    FireOutcome::Retried(e.to_string())
                }
                Err(e) => {
                    self.stats.failed += 1;
                    tracing::error!(
                        "❌ {} job for evaluation {} dropped: {}",
                        job.job_type,
                        job.eval_id,
                        e
                    );
                    FireOutcome::Dropped(e.to_string())
                }
            };
            results.push((job, outcome));
        }

        Ok(results)
    }
}

/// Spawn the engine loop as a background tokio task body.
pub async fn spawn_job_engine(engine: Arc<Mutex<JobEngine>>, check_interval_secs: u64) {
    tracing::info!("⏰ Job engine started (check every {}s)", check_interval_secs);

    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));

    loop {
        interval.tick().await;

        let result = {
            let mut eng = engine.lock().await;
            eng.tick().await
        };

        match result {
            Ok(fired) => {
                for (job, outcome) in &fired {
                    tracing::debug!("📣 [{} #{}] {:?}", job.job_type, job.eval_id, outcome);
                }
            }
            Err(e) => tracing::warn!("⚠️ Job engine tick failed: {e}"),
        }
    }
}
