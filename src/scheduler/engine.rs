use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::cron::next_run_after;
use super::dispatch::WorkflowDispatcher;
use super::isolation::{execute_tasks_isolated, BatchReport, TaskJob};
use super::{
    RunOutcome, ScheduledTask, Scheduler, TaskError, TaskExecution, TaskResult, TriggerType,
};
use crate::storage::ScheduleChange;

/// Main scheduler execution loop.
/// Polls for due tasks every `poll_interval` and hands them to the workflow engine.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    poll_interval: Duration,
) {
    info!(interval_secs = poll_interval.as_secs(), "Scheduler engine started");

    let mut interval = tokio::time::interval(poll_interval);

    loop {
        interval.tick().await;

        match scheduler.dispatch_due(dispatcher.clone(), Utc::now()).await {
            Ok(report) if report.results.is_empty() => {}
            Ok(report) => {
                info!(
                    dispatched = report.total_success,
                    failed = report.total_failed,
                    "Dispatch tick complete"
                );
            }
            Err(e) => {
                error!("Failed to check due tasks: {}", e);
            }
        }
    }
}

impl Scheduler {
    /// Start a `scheduled` execution for every task due at `now` and dispatch
    /// each one in isolation.
    ///
    /// `next_run_at` is advanced in the same transaction that opens the
    /// execution, so a task is never picked up twice.
    pub async fn dispatch_due(
        &self,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        now: DateTime<Utc>,
    ) -> TaskResult<BatchReport> {
        let due = self.store.due_tasks(now)?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut codes = Vec::with_capacity(due.len());
        let mut jobs: HashMap<String, TaskJob> = HashMap::with_capacity(due.len());

        for task in due {
            let next = next_run_after(&task.cron_expression, &task.timezone, now).unwrap_or_else(|e| {
                warn!(task = %task.code, error = %e, "Unparseable schedule; task will not fire again");
                None
            });

            let exec = TaskExecution::start(&task.id, TriggerType::Scheduled, Utc::now());
            if let Err(e) = self
                .store
                .record_execution_start(&exec, ScheduleChange::Advance(next))
            {
                error!(task = %task.code, error = %e, "Failed to open scheduled execution");
                continue;
            }

            info!(task = %task.code, execution = %exec.id, next_run_at = ?next, "Task due");

            let scheduler = self.clone();
            let dispatcher = dispatcher.clone();
            let execution_id = exec.id;
            codes.push(task.code.clone());
            jobs.insert(
                task.code.clone(),
                Box::new(move || {
                    async move {
                        scheduler
                            .run_dispatch(dispatcher, task, execution_id, TriggerType::Scheduled)
                            .await
                    }
                        .boxed()
                }),
            );
        }

        Ok(execute_tasks_isolated(&codes, jobs).await)
    }

    /// Hand one opened execution to the workflow engine under the scheduler's
    /// deadline. Failures and timeouts go through `handle_task_failure`.
    pub(crate) async fn run_dispatch(
        &self,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        task: ScheduledTask,
        execution_id: String,
        triggered_by: TriggerType,
    ) -> anyhow::Result<Value> {
        let work = dispatcher.dispatch(&task, &execution_id, triggered_by);
        let message = match self.execute_with_timeout(&execution_id, work, self.timeout).await {
            RunOutcome::Completed(()) => return Ok(json!({ "execution_id": execution_id })),
            RunOutcome::Failed(message) => message,
            RunOutcome::TimedOut => TaskError::Timeout(self.timeout.as_millis() as u64).to_string(),
        };

        self.handle_task_failure(&task, &message, Some(&execution_id))
            .await;
        anyhow::bail!(message)
    }
}
