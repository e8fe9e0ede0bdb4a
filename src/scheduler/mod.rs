//! Scheduled-task registry, execution tracking, and workflow dispatch.

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod execution;
pub mod isolation;
pub mod profiles;
pub mod registry;
pub mod status;
pub mod trigger;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::{LogNotifier, Notifier, NotificationTemplate};
use crate::storage::TaskStore;

pub use self::dispatch::{WebhookDispatcher, WorkflowDispatcher};
pub use self::engine::run_scheduler_loop;
pub use self::execution::{ExecutionUpdate, RunOutcome};
pub use self::isolation::{execute_task_isolated, execute_tasks_isolated, BatchReport, TaskJob, TaskRunResult};

/// Default deadline for a single task run (5 minutes).
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("task '{0}' is inactive")]
    Inactive(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("task execution timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("completion time {completed_at} precedes start time {started_at}")]
    NegativeDuration {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },

    #[error("invalid execution update: {0}")]
    InvalidUpdate(String),

    #[error("task code '{0}' already exists")]
    Duplicate(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl TaskError {
    pub(crate) fn task_not_found(key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "task",
            key: key.into(),
        }
    }

    pub(crate) fn execution_not_found(key: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "execution",
            key: key.into(),
        }
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// Lifecycle state of a single execution. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 4] = [
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(TaskError::Corrupt(format!("unknown execution status '{}'", other))),
        }
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::Retry => "retry",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            "retry" => Ok(TriggerType::Retry),
            other => Err(TaskError::Corrupt(format!("unknown trigger type '{}'", other))),
        }
    }
}

/// A cron-driven unit of work whose execution is delegated to an external workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    pub workflow_id: Option<String>,
    pub webhook_url: Option<String>,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<ExecutionStatus>,
    pub last_run_duration_ms: Option<i64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to run a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub records_processed: Option<i64>,
    pub result_summary: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub triggered_by: TriggerType,
}

impl TaskExecution {
    /// A fresh `running` execution for `task_id`, started at `started_at`.
    pub fn start(task_id: &str, triggered_by: TriggerType, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            started_at,
            completed_at: None,
            status: ExecutionStatus::Running,
            records_processed: None,
            result_summary: None,
            error_message: None,
            execution_time_ms: None,
            triggered_by,
        }
    }
}

/// Input for registering a new task.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub cron_expression: String,
    pub timezone: String,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Task bookkeeping service: registry, triggers, execution tracking, and dispatch.
#[derive(Clone)]
pub struct Scheduler {
    store: TaskStore,
    /// Receives manual and retry runs as they are opened.
    dispatcher: Option<Arc<dyn WorkflowDispatcher>>,
    notifier: Arc<dyn Notifier>,
    template: NotificationTemplate,
    timeout: Duration,
}

impl Scheduler {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            dispatcher: None,
            notifier: Arc::new(LogNotifier),
            template: NotificationTemplate::default(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn WorkflowDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_template(mut self, template: NotificationTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dispatcher(&self) -> Option<Arc<dyn WorkflowDispatcher>> {
        self.dispatcher.clone()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
