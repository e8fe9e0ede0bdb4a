//! taskledger -- Scheduled-task execution ledger for freight back-office workflows.
//!
//! This crate keeps cron schedules for back-office jobs, records every run,
//! enforces the execution status state machine, and hands due runs to an
//! external workflow engine.

pub mod api;
pub mod config;
pub mod notify;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::scheduler::{Scheduler, WebhookDispatcher, WorkflowDispatcher};
use crate::storage::TaskStore;

/// Open the database and assemble a `Scheduler` from configuration. Runs are
/// handed to the workflow engine through each task's webhook.
pub fn build_scheduler(config: &AppConfig) -> Result<Scheduler> {
    let pool = storage::open_pool(&config.database.path)?;
    let store = TaskStore::new(pool).with_slow_threshold(Duration::from_millis(
        config.database.slow_query_threshold_ms,
    ));

    let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let dispatcher: Arc<dyn WorkflowDispatcher> = Arc::new(WebhookDispatcher::default());

    Ok(Scheduler::new(store)
        .with_dispatcher(dispatcher)
        .with_notifier(notifier)
        .with_template(config.notifications.template())
        .with_timeout(Duration::from_millis(config.executor.timeout_ms)))
}

/// Start the taskledger daemon: API server and dispatch engine.
pub async fn serve(config: &AppConfig, bind: &str) -> Result<()> {
    // 1. Initialize Storage + Scheduler
    tracing::info!(db_path = %config.database.path, "Initializing database");
    let scheduler = build_scheduler(config)?;

    if config.executor.seed_defaults {
        let added = scheduler.seed_defaults().await?;
        if !added.is_empty() {
            tracing::info!(tasks = ?added, "Seeded default tasks");
        }
    }

    // 2. Start Scheduler Engine (background task)
    let scheduler_engine = scheduler.clone();
    let dispatcher = scheduler
        .dispatcher()
        .unwrap_or_else(|| Arc::new(WebhookDispatcher::default()));
    let poll_interval = Duration::from_secs(config.executor.poll_interval_secs.max(1));
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler_engine, dispatcher, poll_interval).await;
    });

    // 3. Start API Server
    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState::new(scheduler));

    tracing::info!(%addr, "taskledger listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
