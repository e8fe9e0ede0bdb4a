//! Hand-off of scheduled runs to the external workflow engine.
//!
//! The engine receives `{execution_id, task_code, workflow_id, triggered_by}`
//! and reports the outcome later through the executions callback endpoint.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;

use super::{ScheduledTask, TriggerType};

#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest<'a> {
    pub execution_id: &'a str,
    pub task_code: &'a str,
    pub workflow_id: Option<&'a str>,
    pub triggered_by: TriggerType,
}

/// Starts a task run in the workflow engine.
#[async_trait::async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        task: &ScheduledTask,
        execution_id: &str,
        triggered_by: TriggerType,
    ) -> Result<()>;
}

/// Calls the task's webhook URL with a JSON body.
pub struct WebhookDispatcher {
    client: Client,
    timeout: Duration,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait::async_trait]
impl WorkflowDispatcher for WebhookDispatcher {
    async fn dispatch(
        &self,
        task: &ScheduledTask,
        execution_id: &str,
        triggered_by: TriggerType,
    ) -> Result<()> {
        let url = task
            .webhook_url
            .as_deref()
            .with_context(|| format!("no webhook configured for task '{}'", task.code))?;

        let body = DispatchRequest {
            execution_id,
            task_code: &task.code,
            workflow_id: task.workflow_id.as_deref(),
            triggered_by,
        };

        let resp = self
            .client
            .post(url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("failed to reach workflow webhook for '{}'", task.code))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("workflow webhook for '{}' returned {}", task.code, status);
        }

        tracing::debug!(task = %task.code, execution = %execution_id, "Workflow dispatched");
        Ok(())
    }
}
