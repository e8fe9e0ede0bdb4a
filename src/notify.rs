//! Operator notifications for failed task runs.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::scheduler::ScheduledTask;

/// Template and audience applied to every failure notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub template_code: String,
    pub recipient_role: String,
}

impl Default for NotificationTemplate {
    fn default() -> Self {
        Self {
            template_code: "scheduled_task_failed".to_string(),
            recipient_role: "admin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub task_code: String,
    pub task_name: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub execution_id: Option<String>,
}

/// Payload delivered to the operator-notification system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotification {
    pub template_code: String,
    pub recipient_role: String,
    pub data: FailureDetails,
}

impl FailureNotification {
    pub fn new(
        template: &NotificationTemplate,
        task: &ScheduledTask,
        error_message: impl Into<String>,
        execution_id: Option<&str>,
    ) -> Self {
        Self {
            template_code: template.template_code.clone(),
            recipient_role: template.recipient_role.clone(),
            data: FailureDetails {
                task_code: task.code.clone(),
                task_name: task.name.clone(),
                error_message: error_message.into(),
                timestamp: Utc::now(),
                execution_id: execution_id.map(str::to_string),
            },
        }
    }
}

/// Delivery channel for failure notifications.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &FailureNotification) -> Result<()>;
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &FailureNotification) -> Result<()> {
        tracing::warn!(
            template = %notification.template_code,
            recipient = %notification.recipient_role,
            task = %notification.data.task_code,
            execution = ?notification.data.execution_id,
            error = %notification.data.error_message,
            "Task failure notification"
        );
        Ok(())
    }
}

/// POSTs the notification as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &FailureNotification) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(notification)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("failed to reach notification webhook {}", self.url))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("notification webhook returned {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: "t-1".to_string(),
            code: "nightly-billing".to_string(),
            name: "Nightly billing".to_string(),
            description: None,
            cron_expression: "0 2 * * *".to_string(),
            timezone: "Asia/Jakarta".to_string(),
            workflow_id: None,
            webhook_url: None,
            is_active: true,
            last_run_at: None,
            last_run_status: None,
            last_run_duration_ms: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_payload_shape() {
        let n = FailureNotification::new(
            &NotificationTemplate::default(),
            &task(),
            "gateway unreachable",
            Some("exec-9"),
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["template_code"], "scheduled_task_failed");
        assert_eq!(json["recipient_role"], "admin");
        assert_eq!(json["data"]["task_code"], "nightly-billing");
        assert_eq!(json["data"]["task_name"], "Nightly billing");
        assert_eq!(json["data"]["error_message"], "gateway unreachable");
        assert_eq!(json["data"]["execution_id"], "exec-9");
        assert!(json["data"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let n = FailureNotification::new(&NotificationTemplate::default(), &task(), "boom", None);
        assert!(LogNotifier.notify(&n).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_notifier_reports_unreachable_endpoint() {
        // Port 9 (discard) on loopback is closed in test environments.
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/notify");
        let n = FailureNotification::new(&NotificationTemplate::default(), &task(), "boom", None);
        assert!(notifier.notify(&n).await.is_err());
    }
}
