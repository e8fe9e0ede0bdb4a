//! Persistence for scheduled tasks and their executions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use tracing::warn;

use super::slow_query::{SlowQuery, SlowQueryLog};
use super::Pool;
use crate::scheduler::{
    ExecutionStatus, ScheduledTask, TaskError, TaskExecution, TaskResult, TriggerType,
};

const TASK_COLUMNS: &str = "id, code, name, description, cron_expression, timezone, workflow_id,
    webhook_url, is_active, last_run_at, last_run_status, last_run_duration_ms, next_run_at,
    created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, task_id, started_at, completed_at, status, records_processed,
    result_summary, error_message, execution_time_ms, triggered_by";

/// What a write does to the task's cron-derived `next_run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    /// Leave `next_run_at` as is (manual and retry runs).
    Preserve,
    /// Replace `next_run_at` (scheduled runs).
    Advance(Option<DateTime<Utc>>),
}

/// Denormalised last-run fields copied onto the parent task when an execution finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMirror {
    pub status: ExecutionStatus,
    pub duration_ms: Option<i64>,
    pub schedule: ScheduleChange,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
    slow_log: Arc<SlowQueryLog>,
    slow_threshold: Duration,
}

impl TaskStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            slow_log: Arc::new(SlowQueryLog::default()),
            slow_threshold: Duration::from_millis(500),
        }
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn get_pool(&self) -> &Pool {
        &self.pool
    }

    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.slow_log.snapshot()
    }

    fn timed<T>(
        &self,
        label: &'static str,
        f: impl FnOnce(&mut Connection) -> TaskResult<T>,
    ) -> TaskResult<T> {
        let started = Instant::now();
        let mut conn = self.pool.get()?;
        let out = f(&mut conn);
        let elapsed = started.elapsed();
        if elapsed >= self.slow_threshold {
            warn!(query = label, elapsed_ms = elapsed.as_millis() as u64, "slow query");
            self.slow_log.record(label, elapsed);
        }
        out
    }

    // ---------------------------------------------------------------------
    // Tasks
    // ---------------------------------------------------------------------

    pub fn get_task(&self, id: &str) -> TaskResult<ScheduledTask> {
        self.timed("get_task", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM scheduled_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| TaskError::task_not_found(id))
        })
    }

    pub fn get_task_by_code(&self, code: &str) -> TaskResult<ScheduledTask> {
        self.timed("get_task_by_code", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM scheduled_tasks WHERE code = ?1", TASK_COLUMNS),
                params![code],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| TaskError::task_not_found(code))
        })
    }

    pub fn list_tasks(&self) -> TaskResult<Vec<ScheduledTask>> {
        self.timed("list_tasks", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_tasks ORDER BY code",
                TASK_COLUMNS
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Active tasks whose `next_run_at` is at or before `now`.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> TaskResult<Vec<ScheduledTask>> {
        self.timed("due_tasks", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM scheduled_tasks
                 WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at, code",
                TASK_COLUMNS
            ))?;
            let rows = stmt.query_map(params![ts(now)], task_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn insert_task(&self, task: &ScheduledTask) -> TaskResult<()> {
        self.timed("insert_task", |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO scheduled_tasks ({}) VALUES
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    TASK_COLUMNS
                ),
                params![
                    task.id,
                    task.code,
                    task.name,
                    task.description,
                    task.cron_expression,
                    task.timezone,
                    task.workflow_id,
                    task.webhook_url,
                    task.is_active,
                    task.last_run_at.map(ts),
                    task.last_run_status.map(|s| s.as_str()),
                    task.last_run_duration_ms,
                    task.next_run_at.map(ts),
                    ts(task.created_at),
                    ts(task.updated_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == ErrorCode::ConstraintViolation =>
                {
                    TaskError::Duplicate(task.code.clone())
                }
                other => TaskError::Database(other),
            })?;
            Ok(())
        })
    }

    pub fn set_active(&self, id: &str, is_active: bool) -> TaskResult<()> {
        self.timed("set_active", |conn| {
            let changed = conn.execute(
                "UPDATE scheduled_tasks SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_active, ts(Utc::now()), id],
            )?;
            if changed == 0 {
                return Err(TaskError::task_not_found(id));
            }
            Ok(())
        })
    }

    pub fn set_schedule(
        &self,
        id: &str,
        is_active: bool,
        next_run_at: Option<DateTime<Utc>>,
    ) -> TaskResult<()> {
        self.timed("set_schedule", |conn| {
            let changed = conn.execute(
                "UPDATE scheduled_tasks SET is_active = ?1, next_run_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![is_active, next_run_at.map(ts), ts(Utc::now()), id],
            )?;
            if changed == 0 {
                return Err(TaskError::task_not_found(id));
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Executions
    // ---------------------------------------------------------------------

    /// Insert an execution row as-is, without touching the parent task.
    pub fn insert_execution(&self, exec: &TaskExecution) -> TaskResult<()> {
        self.timed("insert_execution", |conn| {
            insert_execution_row(conn, exec)?;
            Ok(())
        })
    }

    pub fn get_execution(&self, id: &str) -> TaskResult<TaskExecution> {
        self.timed("get_execution", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM task_executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                execution_from_row,
            )
            .optional()?
            .ok_or_else(|| TaskError::execution_not_found(id))
        })
    }

    /// Executions of `task_id`, newest first. An empty `statuses` slice means any status.
    pub fn list_executions(
        &self,
        task_id: &str,
        statuses: &[ExecutionStatus],
        limit: usize,
    ) -> TaskResult<Vec<TaskExecution>> {
        self.timed("list_executions", |conn| {
            let mut sql = format!(
                "SELECT {} FROM task_executions WHERE task_id = ?1",
                EXECUTION_COLUMNS
            );
            if !statuses.is_empty() {
                let placeholders: Vec<String> =
                    (0..statuses.len()).map(|i| format!("?{}", i + 2)).collect();
                sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
            }
            sql.push_str(&format!(" ORDER BY started_at DESC, rowid DESC LIMIT {}", limit));

            let mut values: Vec<&str> = vec![task_id];
            values.extend(statuses.iter().map(|s| s.as_str()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), execution_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn latest_execution_with_status(
        &self,
        task_id: &str,
        statuses: &[ExecutionStatus],
    ) -> TaskResult<Option<TaskExecution>> {
        Ok(self
            .list_executions(task_id, statuses, 1)?
            .into_iter()
            .next())
    }

    /// Insert a new `running` execution and stamp the parent task's last-run
    /// fields in one transaction.
    pub fn record_execution_start(
        &self,
        exec: &TaskExecution,
        schedule: ScheduleChange,
    ) -> TaskResult<()> {
        self.timed("record_execution_start", |conn| {
            let tx = conn.transaction()?;
            insert_execution_row(&tx, exec)?;

            let started = ts(exec.started_at);
            let status = exec.status.as_str();
            let changed = match schedule {
                ScheduleChange::Preserve => tx.execute(
                    "UPDATE scheduled_tasks
                     SET last_run_at = ?1, last_run_status = ?2, updated_at = ?1
                     WHERE id = ?3",
                    params![started, status, exec.task_id],
                )?,
                ScheduleChange::Advance(next) => tx.execute(
                    "UPDATE scheduled_tasks
                     SET last_run_at = ?1, last_run_status = ?2, next_run_at = ?3, updated_at = ?1
                     WHERE id = ?4",
                    params![started, status, next.map(ts), exec.task_id],
                )?,
            };
            if changed == 0 {
                return Err(TaskError::task_not_found(exec.task_id.as_str()));
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Persist the mutable fields of `exec` and, when given, mirror the
    /// outcome onto the parent task, in one transaction.
    ///
    /// The write only applies while the stored status is still `expected`.
    /// A concurrent update that got there first turns this call into an
    /// `InvalidTransition` from the status it left behind, and no mirror is
    /// written.
    pub fn finalize_execution(
        &self,
        exec: &TaskExecution,
        expected: ExecutionStatus,
        mirror: Option<TaskMirror>,
    ) -> TaskResult<()> {
        let summary = exec
            .result_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.timed("finalize_execution", |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE task_executions
                 SET status = ?1, completed_at = ?2, records_processed = ?3, result_summary = ?4,
                     error_message = ?5, execution_time_ms = ?6
                 WHERE id = ?7 AND status = ?8",
                params![
                    exec.status.as_str(),
                    exec.completed_at.map(ts),
                    exec.records_processed,
                    summary,
                    exec.error_message,
                    exec.execution_time_ms,
                    exec.id,
                    expected.as_str(),
                ],
            )?;
            if changed == 0 {
                let current = tx
                    .query_row(
                        "SELECT status FROM task_executions WHERE id = ?1",
                        params![exec.id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                return Err(match current {
                    None => TaskError::execution_not_found(exec.id.as_str()),
                    Some(raw) => TaskError::InvalidTransition {
                        from: raw.parse()?,
                        to: exec.status,
                    },
                });
            }

            if let Some(mirror) = mirror {
                let now = ts(Utc::now());
                match mirror.schedule {
                    ScheduleChange::Preserve => tx.execute(
                        "UPDATE scheduled_tasks
                         SET last_run_status = ?1, last_run_duration_ms = ?2, updated_at = ?3
                         WHERE id = ?4",
                        params![mirror.status.as_str(), mirror.duration_ms, now, exec.task_id],
                    )?,
                    ScheduleChange::Advance(next) => tx.execute(
                        "UPDATE scheduled_tasks
                         SET last_run_status = ?1, last_run_duration_ms = ?2, next_run_at = ?3,
                             updated_at = ?4
                         WHERE id = ?5",
                        params![
                            mirror.status.as_str(),
                            mirror.duration_ms,
                            next.map(ts),
                            now,
                            exec.task_id
                        ],
                    )?,
                };
            }

            tx.commit()?;
            Ok(())
        })
    }
}

// -------------------------------------------------------------------------
// Row mapping
// -------------------------------------------------------------------------

/// RFC 3339, UTC, fixed millisecond precision, so text order is time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, s)).transpose()
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let last_run_status = row
        .get::<_, Option<String>>(10)?
        .map(|s| s.parse::<ExecutionStatus>().map_err(|e| conversion_error(10, e)))
        .transpose()?;

    Ok(ScheduledTask {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        cron_expression: row.get(4)?,
        timezone: row.get(5)?,
        workflow_id: row.get(6)?,
        webhook_url: row.get(7)?,
        is_active: row.get(8)?,
        last_run_at: parse_opt_ts(9, row.get(9)?)?,
        last_run_status,
        last_run_duration_ms: row.get(11)?,
        next_run_at: parse_opt_ts(12, row.get(12)?)?,
        created_at: parse_ts(13, row.get(13)?)?,
        updated_at: parse_ts(14, row.get(14)?)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<TaskExecution> {
    let status = row
        .get::<_, String>(4)?
        .parse::<ExecutionStatus>()
        .map_err(|e| conversion_error(4, e))?;
    let triggered_by = row
        .get::<_, String>(9)?
        .parse::<TriggerType>()
        .map_err(|e| conversion_error(9, e))?;
    let result_summary = row
        .get::<_, Option<String>>(6)?
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(6, e)))
        .transpose()?;

    Ok(TaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        started_at: parse_ts(2, row.get(2)?)?,
        completed_at: parse_opt_ts(3, row.get(3)?)?,
        status,
        records_processed: row.get(5)?,
        result_summary,
        error_message: row.get(7)?,
        execution_time_ms: row.get(8)?,
        triggered_by,
    })
}

fn insert_execution_row(conn: &Connection, exec: &TaskExecution) -> TaskResult<()> {
    let summary = exec
        .result_summary
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        &format!(
            "INSERT INTO task_executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            EXECUTION_COLUMNS
        ),
        params![
            exec.id,
            exec.task_id,
            ts(exec.started_at),
            exec.completed_at.map(ts),
            exec.status.as_str(),
            exec.records_processed,
            summary,
            exec.error_message,
            exec.execution_time_ms,
            exec.triggered_by.as_str(),
        ],
    )?;
    Ok(())
}
