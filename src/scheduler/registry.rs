//! Task registry: registration, lookup, and enable/disable.

use chrono::Utc;
use tracing::info;

use super::cron::{next_run_time, validate_schedule};
use super::{profiles, NewTask, ScheduledTask, Scheduler, TaskError, TaskResult};

impl Scheduler {
    /// Validate the schedule and persist a new task. Active tasks get their
    /// `next_run_at` immediately.
    pub async fn register_task(&self, new: NewTask) -> TaskResult<ScheduledTask> {
        validate_schedule(&new.cron_expression, &new.timezone)?;

        let next_run_at = if new.is_active {
            next_run_time(&new.cron_expression, &new.timezone)?
        } else {
            None
        };

        let now = Utc::now();
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            code: new.code,
            name: new.name,
            description: new.description,
            cron_expression: new.cron_expression,
            timezone: new.timezone,
            workflow_id: new.workflow_id,
            webhook_url: new.webhook_url,
            is_active: new.is_active,
            last_run_at: None,
            last_run_status: None,
            last_run_duration_ms: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_task(&task)?;

        info!(task = %task.code, cron = %task.cron_expression, tz = %task.timezone, "Task registered");
        Ok(task)
    }

    pub async fn list_tasks(&self) -> TaskResult<Vec<ScheduledTask>> {
        self.store.list_tasks()
    }

    pub async fn get_task_by_code(&self, code: &str) -> TaskResult<ScheduledTask> {
        self.store.get_task_by_code(code)
    }

    /// Activate a task and recompute `next_run_at` from its cron expression.
    /// `next_run_at` is `None` when the expression never fires again.
    pub async fn enable_task(&self, id: &str) -> TaskResult<ScheduledTask> {
        let task = self.store.get_task(id)?;
        let next_run_at = next_run_time(&task.cron_expression, &task.timezone)?;
        self.store.set_schedule(id, true, next_run_at)?;

        info!(task = %task.code, next_run_at = ?next_run_at, "Task enabled");
        self.store.get_task(id)
    }

    /// Deactivate a task. `next_run_at` is kept so re-enabling shows the last
    /// known schedule until it is recomputed.
    pub async fn disable_task(&self, id: &str) -> TaskResult<ScheduledTask> {
        self.store.set_active(id, false)?;
        let task = self.store.get_task(id)?;

        info!(task = %task.code, "Task disabled");
        Ok(task)
    }

    pub async fn toggle_task_status(&self, id: &str, is_active: bool) -> TaskResult<ScheduledTask> {
        if is_active {
            self.enable_task(id).await
        } else {
            self.disable_task(id).await
        }
    }

    /// Register any default profile whose code is not yet present. Returns the
    /// codes that were added.
    pub async fn seed_defaults(&self) -> TaskResult<Vec<String>> {
        let mut added = Vec::new();
        for profile in profiles::defaults() {
            match self.store.get_task_by_code(&profile.code) {
                Ok(_) => continue,
                Err(TaskError::NotFound { .. }) => {
                    let task = self.register_task(profile).await?;
                    added.push(task.code);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }
}
