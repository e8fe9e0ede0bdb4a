//! Finalising executions: status updates, timeouts, and failure reporting.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::cron::next_run_time;
use super::status::{calculate_execution_time_ms, ensure_transition};
use super::{
    ExecutionStatus, ScheduledTask, Scheduler, TaskError, TaskExecution, TaskResult, TriggerType,
};
use crate::notify::FailureNotification;
use crate::storage::{ScheduleChange, TaskMirror};

/// Fields a caller may change on an execution. `None` leaves a field as is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub records_processed: Option<i64>,
    #[serde(default)]
    pub result_summary: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Result of racing a unit of work against its deadline.
#[derive(Debug, PartialEq)]
pub enum RunOutcome<T> {
    Completed(T),
    Failed(String),
    TimedOut,
}

impl<T> RunOutcome<T> {
    pub fn timed_out(&self) -> bool {
        matches!(self, RunOutcome::TimedOut)
    }
}

impl Scheduler {
    /// Apply `update` to an execution.
    ///
    /// Status changes must follow the state machine. Reaching a terminal
    /// state stamps `completed_at` (now, unless supplied) together with
    /// `execution_time_ms`, and mirrors the outcome onto the parent task in
    /// the same transaction. A finished scheduled run also advances the
    /// task's `next_run_at`.
    pub async fn update_task_execution(
        &self,
        id: &str,
        update: ExecutionUpdate,
    ) -> TaskResult<TaskExecution> {
        let mut exec = self.store.get_execution(id)?;
        let from = exec.status;
        let to = update.status.unwrap_or(from);
        if to != from {
            ensure_transition(from, to)?;
        }
        let finishing = !from.is_terminal() && to.is_terminal();

        match (update.completed_at, finishing) {
            (Some(_), false) if from.is_terminal() => {
                return Err(TaskError::InvalidUpdate(format!(
                    "execution {} already finished",
                    id
                )))
            }
            (Some(_), false) => {
                return Err(TaskError::InvalidUpdate(
                    "completed_at requires a terminal status".to_string(),
                ))
            }
            (completed_at, true) => {
                let completed_at = completed_at.unwrap_or_else(Utc::now);
                exec.execution_time_ms =
                    Some(calculate_execution_time_ms(exec.started_at, completed_at)?);
                exec.completed_at = Some(completed_at);
            }
            (None, false) => {}
        }

        exec.status = to;
        if let Some(n) = update.records_processed {
            exec.records_processed = Some(n);
        }
        if let Some(summary) = update.result_summary {
            exec.result_summary = Some(summary);
        }
        if let Some(message) = update.error_message {
            exec.error_message = Some(message);
        }

        let mirror = if finishing {
            let schedule = if exec.triggered_by == TriggerType::Scheduled {
                let task = self.store.get_task(&exec.task_id)?;
                ScheduleChange::Advance(next_run_time(&task.cron_expression, &task.timezone)?)
            } else {
                ScheduleChange::Preserve
            };
            Some(TaskMirror {
                status: to,
                duration_ms: exec.execution_time_ms,
                schedule,
            })
        } else {
            None
        };

        self.store.finalize_execution(&exec, from, mirror)?;

        if finishing {
            info!(
                execution = %exec.id,
                status = %exec.status,
                duration_ms = ?exec.execution_time_ms,
                "Execution finished"
            );
        }
        Ok(exec)
    }

    pub async fn complete_task_execution(
        &self,
        id: &str,
        records_processed: Option<i64>,
        result_summary: Option<serde_json::Value>,
    ) -> TaskResult<TaskExecution> {
        self.update_task_execution(
            id,
            ExecutionUpdate {
                status: Some(ExecutionStatus::Completed),
                completed_at: Some(Utc::now()),
                records_processed,
                result_summary,
                error_message: None,
            },
        )
        .await
    }

    pub async fn fail_task_execution(
        &self,
        id: &str,
        error_message: &str,
    ) -> TaskResult<TaskExecution> {
        self.update_task_execution(
            id,
            ExecutionUpdate {
                status: Some(ExecutionStatus::Failed),
                completed_at: Some(Utc::now()),
                error_message: Some(error_message.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    /// Race `work` against `timeout`.
    ///
    /// A timeout marks the execution `timeout`, an error marks it `failed`;
    /// success leaves the execution untouched. The losing future is dropped,
    /// which cancels it at its next await point.
    pub async fn execute_with_timeout<T, F>(
        &self,
        execution_id: &str,
        work: F,
        timeout: Duration,
    ) -> RunOutcome<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(timeout, work).await {
            Ok(Ok(value)) => RunOutcome::Completed(value),
            Ok(Err(e)) => {
                let message = format!("{:#}", e);
                if let Err(err) = self.fail_task_execution(execution_id, &message).await {
                    error!(execution = %execution_id, error = %err, "Failed to mark execution failed");
                }
                RunOutcome::Failed(message)
            }
            Err(_) => {
                let message = TaskError::Timeout(timeout.as_millis() as u64).to_string();
                warn!(execution = %execution_id, timeout_ms = timeout.as_millis() as u64, "Execution timed out");
                let update = ExecutionUpdate {
                    status: Some(ExecutionStatus::Timeout),
                    error_message: Some(message),
                    ..Default::default()
                };
                if let Err(err) = self.update_task_execution(execution_id, update).await {
                    error!(execution = %execution_id, error = %err, "Failed to mark execution timed out");
                }
                RunOutcome::TimedOut
            }
        }
    }

    /// Best-effort failure path: mark the execution failed if it is still
    /// running, then deliver an operator notification. Nothing here propagates
    /// an error; the built notification is returned.
    pub async fn handle_task_failure(
        &self,
        task: &ScheduledTask,
        error_message: &str,
        execution_id: Option<&str>,
    ) -> FailureNotification {
        if let Some(id) = execution_id {
            match self.store.get_execution(id) {
                Ok(exec) if exec.status == ExecutionStatus::Running => {
                    if let Err(e) = self.fail_task_execution(id, error_message).await {
                        warn!(task = %task.code, execution = %id, error = %e, "Could not mark execution failed");
                    }
                }
                Ok(exec) => {
                    debug!(task = %task.code, execution = %id, status = %exec.status, "Execution already finished");
                }
                Err(e) => {
                    warn!(task = %task.code, execution = %id, error = %e, "Could not load execution");
                }
            }
        }

        let notification =
            FailureNotification::new(&self.template, task, error_message, execution_id);
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(task = %task.code, error = %e, "Failure notification not delivered");
        }
        notification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::scheduler::NewTask;
    use crate::storage::{open_memory_pool, TaskStore};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<FailureNotification>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &FailureNotification) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct BrokenNotifier;

    #[async_trait::async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _: &FailureNotification) -> anyhow::Result<()> {
            anyhow::bail!("smtp relay down")
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(TaskStore::new(open_memory_pool().unwrap()))
    }

    async fn task(s: &Scheduler) -> ScheduledTask {
        s.register_task(NewTask {
            code: "invoice-aging-report".to_string(),
            name: "Invoice aging report".to_string(),
            description: None,
            cron_expression: "0 6 * * 1-5".to_string(),
            timezone: "Asia/Jakarta".to_string(),
            workflow_id: None,
            webhook_url: None,
            is_active: true,
        })
        .await
        .unwrap()
    }

    async fn start(s: &Scheduler, task: &ScheduledTask, trigger: TriggerType) -> String {
        let exec = TaskExecution::start(&task.id, trigger, Utc::now());
        s.store()
            .record_execution_start(&exec, ScheduleChange::Preserve)
            .unwrap();
        exec.id
    }

    #[tokio::test]
    async fn test_complete_sets_timing_and_mirrors_task() {
        let s = scheduler();
        let t = task(&s).await;
        let id = s.trigger_task_manually(&t.code).await.unwrap();

        let done = s
            .complete_task_execution(&id, Some(42), Some(serde_json::json!({ "buckets": 4 })))
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.execution_time_ms.unwrap() >= 0);
        assert_eq!(done.records_processed, Some(42));

        let reloaded = s.store().get_task(&t.id).unwrap();
        assert_eq!(reloaded.last_run_status, Some(ExecutionStatus::Completed));
        assert_eq!(reloaded.last_run_duration_ms, done.execution_time_ms);
        assert_eq!(reloaded.next_run_at, t.next_run_at);
    }

    #[tokio::test]
    async fn test_explicit_completed_at_drives_duration() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;
        let started = s.store().get_execution(&id).unwrap().started_at;

        let done = s
            .update_task_execution(
                &id,
                ExecutionUpdate {
                    status: Some(ExecutionStatus::Completed),
                    completed_at: Some(started + chrono::Duration::milliseconds(1_500)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(done.execution_time_ms, Some(1_500));
    }

    #[tokio::test]
    async fn test_terminal_execution_cannot_change_status() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;
        s.fail_task_execution(&id, "carrier API 503").await.unwrap();

        let err = s.complete_task_execution(&id, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: ExecutionStatus::Failed,
                to: ExecutionStatus::Completed
            }
        ));
        let saved = s.store().get_execution(&id).unwrap();
        assert_eq!(saved.error_message.as_deref(), Some("carrier API 503"));
    }

    #[tokio::test]
    async fn test_completed_at_on_running_row_is_rejected() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;

        let err = s
            .update_task_execution(
                &id,
                ExecutionUpdate {
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidUpdate(_)));

        // progress updates on a running row are fine
        let progress = s
            .update_task_execution(
                &id,
                ExecutionUpdate {
                    records_processed: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(progress.status, ExecutionStatus::Running);
        assert!(progress.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_completion_before_start_is_rejected() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;
        let started = s.store().get_execution(&id).unwrap().started_at;

        let err = s
            .update_task_execution(
                &id,
                ExecutionUpdate {
                    status: Some(ExecutionStatus::Completed),
                    completed_at: Some(started - chrono::Duration::seconds(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NegativeDuration { .. }));
        assert_eq!(
            s.store().get_execution(&id).unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let s = scheduler();
        assert!(matches!(
            s.update_task_execution("missing", ExecutionUpdate::default()).await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_finished_scheduled_run_advances_schedule() {
        let s = scheduler();
        let t = task(&s).await;
        let stale = Utc::now() - chrono::Duration::days(3);
        s.store().set_schedule(&t.id, true, Some(stale)).unwrap();

        let id = start(&s, &t, TriggerType::Scheduled).await;
        s.complete_task_execution(&id, None, None).await.unwrap();

        let reloaded = s.store().get_task(&t.id).unwrap();
        assert!(reloaded.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_timeout_marks_execution_timeout() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;

        let outcome: RunOutcome<()> = s
            .execute_with_timeout(
                &id,
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                Duration::from_millis(50),
            )
            .await;
        assert!(outcome.timed_out());

        let saved = s.store().get_execution(&id).unwrap();
        assert_eq!(saved.status, ExecutionStatus::Timeout);
        assert_eq!(
            saved.error_message.as_deref(),
            Some("task execution timed out after 50ms")
        );
        assert!(saved.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failing_work_marks_execution_failed() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;

        let outcome: RunOutcome<()> = s
            .execute_with_timeout(
                &id,
                async { Err(anyhow::anyhow!("ledger locked")) },
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome, RunOutcome::Failed("ledger locked".to_string()));
        assert_eq!(
            s.store().get_execution(&id).unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_successful_work_leaves_status_untouched() {
        let s = scheduler();
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;

        let outcome = s
            .execute_with_timeout(&id, async { Ok(7_u32) }, Duration::from_secs(5))
            .await;
        assert_eq!(outcome, RunOutcome::Completed(7));
        assert_eq!(
            s.store().get_execution(&id).unwrap().status,
            ExecutionStatus::Running
        );
    }

    #[tokio::test]
    async fn test_handle_failure_marks_and_notifies() {
        let recorder = Arc::new(RecordingNotifier::default());
        let s = scheduler().with_notifier(recorder.clone());
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;

        let n = s.handle_task_failure(&t, "exchange rate feed down", Some(&id)).await;
        assert_eq!(n.data.execution_id.as_deref(), Some(id.as_str()));
        assert_eq!(
            s.store().get_execution(&id).unwrap().status,
            ExecutionStatus::Failed
        );

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.task_code, "invoice-aging-report");
        assert_eq!(sent[0].data.error_message, "exchange rate feed down");
    }

    #[tokio::test]
    async fn test_handle_failure_leaves_finished_execution_alone() {
        let s = scheduler().with_notifier(Arc::new(BrokenNotifier));
        let t = task(&s).await;
        let id = start(&s, &t, TriggerType::Manual).await;
        s.update_task_execution(
            &id,
            ExecutionUpdate {
                status: Some(ExecutionStatus::Timeout),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // Broken delivery and an already-final execution are both absorbed.
        let n = s.handle_task_failure(&t, "late failure", Some(&id)).await;
        assert_eq!(n.data.error_message, "late failure");
        assert_eq!(
            s.store().get_execution(&id).unwrap().status,
            ExecutionStatus::Timeout
        );
    }
}
