//! Notification dispatch — sends lifecycle events to an HTTP webhook.
//! The receiving service renders and mails; it answers with the recipients reached.

use std::time::Duration;

use async_trait::async_trait;
use evalflow_core::config::NotifyConfig;
use evalflow_core::error::{EvalFlowError, Result};
use evalflow_core::traits::{GroupMembershipSyncer, NotificationSender};
use evalflow_core::types::{DigestKind, EvalId, JobType, ReminderAudience};
use serde::Deserialize;

use crate::notify::{NotificationKind, NotifyLog, SentNotification};

#[derive(Debug, Default, Deserialize)]
struct WebhookReply {
    #[serde(default)]
    recipients: Vec<String>,
}

/// Posts every notification as JSON to one webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    pub log: NotifyLog,
}

impl WebhookNotifier {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            timeout,
            log: NotifyLog::new(),
        }
    }

    /// Build from config. `None` when no webhook URL is set.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        let url = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty())?;
        Some(Self::new(
            url,
            config.headers.clone(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    async fn post(&self, event: serde_json::Value) -> Result<Vec<String>> {
        let mut req = self.client.post(&self.url).json(&event).timeout(self.timeout);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EvalFlowError::Notification(format!("Webhook send failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EvalFlowError::Notification(format!(
                "Webhook error {status}: {body}"
            )));
        }

        // an empty or non-JSON body just means no recipients were reported
        let body = resp.text().await.unwrap_or_default();
        let reply: WebhookReply = serde_json::from_str(&body).unwrap_or_default();
        Ok(reply.recipients)
    }

    async fn send(&self, kind: NotificationKind, eval_ids: &[EvalId]) -> Result<Vec<String>> {
        let timestamp = chrono::Utc::now();
        let event = serde_json::json!({
            "event": "notification",
            "notification": &kind,
            "eval_ids": eval_ids,
            "timestamp": timestamp.to_rfc3339(),
        });
        let recipients = self.post(event).await?;
        tracing::info!(
            "✅ Webhook notification sent for {:?} ({} recipients)",
            eval_ids,
            recipients.len()
        );
        self.log.record(SentNotification {
            kind,
            eval_ids: eval_ids.to_vec(),
            recipients: recipients.clone(),
            timestamp,
        });
        Ok(recipients)
    }
}

#[async_trait]
impl NotificationSender for WebhookNotifier {
    async fn send_created(&self, eval_id: EvalId, include_owner: bool) -> Result<Vec<String>> {
        self.send(NotificationKind::Created { include_owner }, &[eval_id])
            .await
    }

    async fn send_available(
        &self,
        eval_id: EvalId,
        include_evaluatees: bool,
    ) -> Result<Vec<String>> {
        self.send(NotificationKind::Available { include_evaluatees }, &[eval_id])
            .await
    }

    async fn send_reminder(
        &self,
        eval_id: EvalId,
        audience: ReminderAudience,
    ) -> Result<Vec<String>> {
        self.send(NotificationKind::Reminder { audience }, &[eval_id])
            .await
    }

    async fn send_results(
        &self,
        eval_id: EvalId,
        include_evaluatees: bool,
        include_admins: bool,
        job_type: JobType,
    ) -> Result<Vec<String>> {
        self.send(
            NotificationKind::Results {
                include_evaluatees,
                include_admins,
                job_type,
            },
            &[eval_id],
        )
        .await
    }

    async fn send_digest(&self, kind: DigestKind, eval_ids: &[EvalId]) -> Result<Vec<String>> {
        self.send(NotificationKind::Digest { digest: kind }, eval_ids)
            .await
    }
}

#[async_trait]
impl GroupMembershipSyncer for WebhookNotifier {
    async fn sync(&self, eval_id: EvalId, group_id: Option<&str>) -> Result<()> {
        let event = serde_json::json!({
            "event": "group_sync",
            "eval_id": eval_id,
            "group_id": group_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.post(event).await?;
        tracing::info!("👥 Group sync requested for evaluation {}", eval_id);
        Ok(())
    }
}
