//! Fault-contained batch execution.
//!
//! Jobs run one after another. An error or a panic in one job is captured in
//! its result and never stops the rest of the batch.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// Deferred unit of work for one task in a batch.
pub type TaskJob = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

#[derive(Debug, Clone, Serialize)]
pub struct TaskRunResult {
    pub task_code: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total_success: usize,
    pub total_failed: usize,
    pub results: BTreeMap<String, TaskRunResult>,
}

impl BatchReport {
    fn push(&mut self, result: TaskRunResult) {
        if result.success {
            self.total_success += 1;
        } else {
            self.total_failed += 1;
        }
        self.results.insert(result.task_code.clone(), result);
    }
}

/// Run one job, converting an `Err` or a panic into a failed result.
pub async fn execute_task_isolated<F, Fut>(task_code: &str, job: F) -> TaskRunResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<Value>>,
{
    let started = Instant::now();
    let outcome = AssertUnwindSafe(async move { job().await })
        .catch_unwind()
        .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (success, result, error) = match outcome {
        Ok(Ok(value)) => (true, Some(value), None),
        Ok(Err(e)) => {
            let message = format!("{:#}", e);
            error!(task = %task_code, error = %message, "Task failed");
            (false, None, Some(message))
        }
        Err(panic) => {
            let message = format!("task panicked: {}", panic_message(&*panic));
            error!(task = %task_code, error = %message, "Task panicked");
            (false, None, Some(message))
        }
    };

    TaskRunResult {
        task_code: task_code.to_string(),
        success,
        result,
        error,
        duration_ms,
    }
}

/// Run the job registered for each code in `task_codes`, in order. A code
/// without a job counts as a failure; a repeated code runs once.
pub async fn execute_tasks_isolated(
    task_codes: &[String],
    mut jobs: HashMap<String, TaskJob>,
) -> BatchReport {
    let mut report = BatchReport::default();

    for code in task_codes {
        if report.results.contains_key(code) {
            warn!(task = %code, "Duplicate task in batch skipped");
            continue;
        }

        let result = match jobs.remove(code) {
            Some(job) => execute_task_isolated(code, job).await,
            None => TaskRunResult {
                task_code: code.clone(),
                success: false,
                result: None,
                error: Some(format!("no job registered for task '{}'", code)),
                duration_ms: 0,
            },
        };
        report.push(result);
    }

    info!(
        success = report.total_success,
        failed = report.total_failed,
        "Batch finished"
    );
    report
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ok_job(n: i64) -> TaskJob {
        Box::new(move || async move { Ok::<_, anyhow::Error>(json!({ "rows": n })) }.boxed())
    }

    fn err_job(msg: &'static str) -> TaskJob {
        Box::new(move || async move { Err::<Value, _>(anyhow::anyhow!(msg)) }.boxed())
    }

    fn explode(msg: &str) -> anyhow::Result<Value> {
        panic!("{}", msg)
    }

    #[tokio::test]
    async fn test_isolated_success_and_error() {
        let ok = execute_task_isolated("a", || async { Ok(json!(1)) }).await;
        assert!(ok.success);
        assert_eq!(ok.result, Some(json!(1)));

        let bad = execute_task_isolated("b", || async { Err(anyhow::anyhow!("no rates")) }).await;
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("no rates"));
    }

    #[tokio::test]
    async fn test_isolated_panic_is_captured() {
        let res = execute_task_isolated("boom", || async { explode("index out of range") }).await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("index out of range"));
    }

    #[tokio::test]
    async fn test_batch_counts_and_keeps_going() {
        let ran = Arc::new(AtomicUsize::new(0));
        let codes: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();

        let mut jobs: HashMap<String, TaskJob> = HashMap::new();
        jobs.insert("a".into(), ok_job(1));
        jobs.insert("b".into(), err_job("carrier timeout"));
        jobs.insert("c".into(), ok_job(3));
        jobs.insert("d".into(), Box::new(|| async { explode("bad row") }.boxed()));
        let counter = ran.clone();
        jobs.insert(
            "e".into(),
            Box::new(move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(json!("last"))
                }
                .boxed()
            }),
        );

        let report = execute_tasks_isolated(&codes, jobs).await;
        assert_eq!(report.total_failed, 2);
        assert_eq!(report.total_success, 3);
        assert_eq!(report.results.len(), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 1, "tasks after a failure still run");
        assert!(!report.results["b"].success);
        assert!(report.results["e"].success);
    }

    #[tokio::test]
    async fn test_missing_job_counts_as_failure() {
        let codes = vec!["orphan".to_string()];
        let report = execute_tasks_isolated(&codes, HashMap::new()).await;
        assert_eq!(report.total_failed, 1);
        assert!(report.results["orphan"]
            .error
            .as_deref()
            .unwrap()
            .contains("no job registered"));
    }
}
