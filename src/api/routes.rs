//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{conflict, ApiError};
use super::state::AppState;
use crate::scheduler::ExecutionUpdate;

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{code}", get(get_task))
        .route("/tasks/{code}/toggle", post(toggle_task))
        .route("/tasks/{code}/trigger", post(trigger_task))
        .route("/tasks/{code}/retry", post(retry_task))
        .route("/tasks/{code}/executions", get(task_executions))
        .route("/tasks/{code}/can-retry", get(can_retry))
        .route("/executions/{id}", patch(update_execution))
        .route("/diagnostics/slow-queries", get(slow_queries))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult {
    let tasks = state.scheduler.list_tasks().await?;
    Ok(Json(json!({ "data": tasks, "meta": { "total": tasks.len() } })))
}

async fn get_task(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult {
    let task = state.scheduler.get_task_by_code(&code).await?;
    Ok(Json(json!({ "data": task, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    is_active: bool,
}

async fn toggle_task(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> ApiResult {
    let task = state.scheduler.get_task_by_code(&code).await?;
    let task = state
        .scheduler
        .toggle_task_status(&task.id, body.is_active)
        .await?;
    Ok(Json(json!({ "data": task, "meta": meta() })))
}

async fn trigger_task(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult {
    let execution_id = state.scheduler.trigger_task_manually(&code).await?;
    Ok(Json(json!({
        "data": { "execution_id": execution_id, "triggered_by": "manual" },
        "meta": meta()
    })))
}

async fn retry_task(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult {
    let task = state.scheduler.get_task_by_code(&code).await?;
    if !state.scheduler.can_retry_task(&task.id).await? {
        return Err(conflict(
            "not_retryable",
            format!("task '{}' has no outstanding failure to retry", code),
        ));
    }
    let execution_id = state.scheduler.retry_failed_task(&code).await?;
    Ok(Json(json!({
        "data": { "execution_id": execution_id, "triggered_by": "retry" },
        "meta": meta()
    })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn task_executions(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let task = state.scheduler.get_task_by_code(&code).await?;
    let limit = query.limit.unwrap_or(50).min(500);
    let history = state.scheduler.task_history(&task.id, limit).await?;
    Ok(Json(json!({ "data": history, "meta": { "total": history.len() } })))
}

async fn can_retry(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult {
    let task = state.scheduler.get_task_by_code(&code).await?;
    let can_retry = state.scheduler.can_retry_task(&task.id).await?;
    Ok(Json(json!({ "data": { "can_retry": can_retry }, "meta": meta() })))
}

/// Workflow-engine callback reporting progress or the final outcome of a run.
async fn update_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ExecutionUpdate>,
) -> ApiResult {
    let execution = state.scheduler.update_task_execution(&id, update).await?;
    Ok(Json(json!({ "data": execution, "meta": meta() })))
}

async fn slow_queries(State(state): State<AppState>) -> Json<Value> {
    let entries = state.scheduler.store().slow_queries();
    Json(json!({ "data": entries, "meta": { "total": entries.len() } }))
}
