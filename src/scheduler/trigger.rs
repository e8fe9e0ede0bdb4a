//! Operator-initiated runs outside the cron schedule.
//!
//! Manual and retry triggers stamp `last_run_*` on the task but never move
//! `next_run_at`; only scheduled runs advance the schedule. When the scheduler
//! holds a workflow dispatcher, these runs are dispatched the same way as
//! scheduled ones.

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ExecutionStatus, ScheduledTask, Scheduler, TaskError, TaskExecution, TaskResult, TriggerType,
};
use crate::storage::ScheduleChange;

const OUTCOME_STATES: [ExecutionStatus; 3] = [
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
    ExecutionStatus::Timeout,
];

impl Scheduler {
    /// The task behind `task_code`, provided it exists and is active.
    pub async fn validate_manual_trigger(&self, task_code: &str) -> TaskResult<ScheduledTask> {
        let task = self.store.get_task_by_code(task_code)?;
        if !task.is_active {
            return Err(TaskError::Inactive(task.code));
        }
        Ok(task)
    }

    /// Start a `manual` execution and hand it to the workflow dispatcher in
    /// the background. Returns the new execution id.
    pub async fn trigger_task_manually(&self, task_code: &str) -> TaskResult<String> {
        let (id, _dispatch) = self.start_out_of_band(task_code, TriggerType::Manual).await?;
        Ok(id)
    }

    /// Start a `retry` execution and hand it to the workflow dispatcher in
    /// the background. Returns the new execution id.
    pub async fn retry_failed_task(&self, task_code: &str) -> TaskResult<String> {
        let (id, _dispatch) = self.start_out_of_band(task_code, TriggerType::Retry).await?;
        Ok(id)
    }

    /// Start a manual or retry execution and wait until the dispatcher has
    /// accepted it, failed, or timed out. Returns the execution as stored
    /// afterwards.
    pub async fn run_out_of_band(
        &self,
        task_code: &str,
        trigger: TriggerType,
    ) -> TaskResult<TaskExecution> {
        if trigger == TriggerType::Scheduled {
            return Err(TaskError::InvalidUpdate(
                "scheduled runs are opened by the dispatch engine".to_string(),
            ));
        }

        let (id, dispatch) = self.start_out_of_band(task_code, trigger).await?;
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                warn!(execution = %id, error = %e, "Dispatch task aborted");
            }
        }
        self.store.get_execution(&id)
    }

    async fn start_out_of_band(
        &self,
        task_code: &str,
        trigger: TriggerType,
    ) -> TaskResult<(String, Option<JoinHandle<()>>)> {
        let task = self.validate_manual_trigger(task_code).await?;
        let exec = TaskExecution::start(&task.id, trigger, Utc::now());
        self.store
            .record_execution_start(&exec, ScheduleChange::Preserve)?;

        info!(task = %task.code, execution = %exec.id, trigger = %trigger, "Task triggered");

        let dispatch = self.dispatcher.clone().map(|dispatcher| {
            let scheduler = self.clone();
            let execution_id = exec.id.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler
                    .run_dispatch(dispatcher, task, execution_id, trigger)
                    .await
                {
                    debug!(error = %e, "Out-of-band dispatch failed");
                }
            })
        });

        Ok((exec.id, dispatch))
    }

    /// True while the task's latest known outcome is a failure: a failed or
    /// timed-out run exists and no completed run started after it. Runs that
    /// started in the same millisecond are ordered by insertion.
    pub async fn can_retry_task(&self, task_id: &str) -> TaskResult<bool> {
        let latest = self
            .store
            .latest_execution_with_status(task_id, &OUTCOME_STATES)?;

        Ok(latest.is_some_and(|exec| exec.status != ExecutionStatus::Completed))
    }

    /// Executions of a task, newest first.
    pub async fn task_history(&self, task_id: &str, limit: usize) -> TaskResult<Vec<TaskExecution>> {
        self.store.list_executions(task_id, &[], limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{NewTask, WorkflowDispatcher};
    use crate::storage::{open_memory_pool, TaskStore};
    use chrono::{DateTime, Duration, TimeZone};
    use std::sync::Arc;

    fn scheduler() -> Scheduler {
        Scheduler::new(TaskStore::new(open_memory_pool().unwrap()))
    }

    async fn billing(s: &Scheduler, active: bool) -> ScheduledTask {
        s.register_task(NewTask {
            code: "nightly-billing".to_string(),
            name: "Nightly billing".to_string(),
            description: None,
            cron_expression: "0 2 * * *".to_string(),
            timezone: "Asia/Jakarta".to_string(),
            workflow_id: None,
            webhook_url: None,
            is_active: active,
        })
        .await
        .unwrap()
    }

    fn record(s: &Scheduler, task_id: &str, status: ExecutionStatus, at: DateTime<Utc>) {
        let mut e = TaskExecution::start(task_id, TriggerType::Scheduled, at);
        e.status = status;
        s.store().insert_execution(&e).unwrap();
    }

    /// Reports each dispatch on a channel; fails when `fail` is set.
    struct ChannelDispatcher {
        sent: tokio::sync::mpsc::UnboundedSender<(String, String, TriggerType)>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl WorkflowDispatcher for ChannelDispatcher {
        async fn dispatch(
            &self,
            task: &ScheduledTask,
            execution_id: &str,
            triggered_by: TriggerType,
        ) -> anyhow::Result<()> {
            let _ = self
                .sent
                .send((task.code.clone(), execution_id.to_string(), triggered_by));
            if self.fail {
                anyhow::bail!("workflow engine rejected the run");
            }
            Ok(())
        }
    }

    fn dispatching(
        fail: bool,
    ) -> (
        Scheduler,
        tokio::sync::mpsc::UnboundedReceiver<(String, String, TriggerType)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let s = scheduler().with_dispatcher(Arc::new(ChannelDispatcher { sent: tx, fail }));
        (s, rx)
    }

    #[tokio::test]
    async fn test_manual_trigger_reaches_dispatcher() {
        let (s, mut rx) = dispatching(false);
        billing(&s, true).await;

        let id = s.trigger_task_manually("nightly-billing").await.unwrap();
        let (code, execution_id, trigger) =
            tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(code, "nightly-billing");
        assert_eq!(execution_id, id);
        assert_eq!(trigger, TriggerType::Manual);
    }

    #[tokio::test]
    async fn test_run_out_of_band_records_dispatch_failure() {
        let (s, mut rx) = dispatching(true);
        let task = billing(&s, true).await;

        let exec = s
            .run_out_of_band("nightly-billing", TriggerType::Retry)
            .await
            .unwrap();
        assert_eq!(exec.triggered_by, TriggerType::Retry);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(
            exec.error_message.as_deref(),
            Some("workflow engine rejected the run")
        );
        assert_eq!(rx.recv().await.unwrap().2, TriggerType::Retry);

        // The schedule is still untouched.
        let reloaded = s.store().get_task(&task.id).unwrap();
        assert_eq!(reloaded.next_run_at, task.next_run_at);
        assert_eq!(reloaded.last_run_status, Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn test_run_out_of_band_refuses_scheduled_trigger() {
        let (s, _rx) = dispatching(false);
        billing(&s, true).await;
        assert!(matches!(
            s.run_out_of_band("nightly-billing", TriggerType::Scheduled).await,
            Err(TaskError::InvalidUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_unknown_and_inactive() {
        let s = scheduler();
        assert!(matches!(
            s.validate_manual_trigger("ghost").await,
            Err(TaskError::NotFound { .. })
        ));

        billing(&s, false).await;
        assert!(matches!(
            s.trigger_task_manually("nightly-billing").await,
            Err(TaskError::Inactive(code)) if code == "nightly-billing"
        ));
    }

    #[tokio::test]
    async fn test_manual_and_retry_preserve_schedule() {
        let s = scheduler();
        let task = billing(&s, true).await;
        let scheduled_next = task.next_run_at;

        let manual_id = s.trigger_task_manually("nightly-billing").await.unwrap();
        let after_manual = s.store().get_task(&task.id).unwrap();
        assert_eq!(after_manual.next_run_at, scheduled_next);
        assert_eq!(after_manual.last_run_status, Some(ExecutionStatus::Running));
        assert!(after_manual.last_run_at.is_some());

        let retry_id = s.retry_failed_task("nightly-billing").await.unwrap();
        let after_retry = s.store().get_task(&task.id).unwrap();
        assert_eq!(after_retry.next_run_at, scheduled_next);

        let manual = s.store().get_execution(&manual_id).unwrap();
        assert_eq!(manual.triggered_by, TriggerType::Manual);
        assert_eq!(manual.status, ExecutionStatus::Running);
        let retry = s.store().get_execution(&retry_id).unwrap();
        assert_eq!(retry.triggered_by, TriggerType::Retry);
    }

    #[tokio::test]
    async fn test_can_retry_without_failures_is_false() {
        let s = scheduler();
        let task = billing(&s, true).await;
        assert!(!s.can_retry_task(&task.id).await.unwrap());

        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap();
        record(&s, &task.id, ExecutionStatus::Completed, t0);
        assert!(!s.can_retry_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_can_retry_tracks_latest_outcome() {
        let s = scheduler();
        let task = billing(&s, true).await;
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap();

        record(&s, &task.id, ExecutionStatus::Completed, t0);
        record(&s, &task.id, ExecutionStatus::Failed, t0 + Duration::days(1));
        assert!(s.can_retry_task(&task.id).await.unwrap());

        record(&s, &task.id, ExecutionStatus::Completed, t0 + Duration::days(2));
        assert!(!s.can_retry_task(&task.id).await.unwrap());

        record(&s, &task.id, ExecutionStatus::Timeout, t0 + Duration::days(3));
        assert!(s.can_retry_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let s = scheduler();
        let task = billing(&s, true).await;
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 19, 0, 0).unwrap();
        record(&s, &task.id, ExecutionStatus::Failed, t0);
        record(&s, &task.id, ExecutionStatus::Completed, t0 + Duration::hours(1));

        let history = s.task_history(&task.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ExecutionStatus::Completed);
    }
}
